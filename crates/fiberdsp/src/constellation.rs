//! Reference symbol alphabets
//!
//! A [`Constellation`] is the set of complex points a transmitter
//! may send. The receiver uses it for
//!
//! * hard-decision slicing (decision-directed equalization and
//!   carrier recovery);
//! * the constant-modulus radius `R₂ = E|c|⁴ / E|c|²`; and
//! * the ring radii used by the radius-directed equalizer.
//!
//! Named alphabets are available through [`Modulation`], which
//! parses from and prints to lowercase names like `"qpsk"`.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

use strum_macros::{Display, EnumIter, EnumString};

use crate::error::{DspError, Result};
use crate::waveform::Sample;

/// Named modulation formats
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Modulation {
    /// Binary phase-shift keying
    Bpsk,

    /// Quadrature phase-shift keying
    Qpsk,

    /// Eight-point phase-shift keying
    #[strum(to_string = "8psk", serialize = "psk8")]
    Psk8,

    /// Square 16-point quadrature amplitude modulation
    #[strum(to_string = "16qam", serialize = "qam16")]
    Qam16,
}

impl Modulation {
    /// Unit-power constellation for this format
    pub fn constellation(&self) -> Constellation {
        match self {
            Modulation::Bpsk => Constellation::psk(2, 0.0),
            Modulation::Qpsk => Constellation::psk(4, PI / 4.0),
            Modulation::Psk8 => Constellation::psk(8, 0.0),
            Modulation::Qam16 => Constellation::square_qam(4),
        }
    }

    /// Blind phase-estimator order which strips this modulation
    pub fn phase_order(&self) -> u32 {
        match self {
            Modulation::Bpsk => 2,
            Modulation::Psk8 => 8,
            Modulation::Qpsk | Modulation::Qam16 => 4,
        }
    }
}

/// A set of reference symbol points
#[derive(Clone, Debug, PartialEq)]
pub struct Constellation {
    points: Vec<Sample>,
}

impl Constellation {
    /// Create from arbitrary points
    ///
    /// Fails with [`DspError::EmptyConstellation`] if there
    /// are no points.
    pub fn new<P>(points: P) -> Result<Self>
    where
        P: Into<Vec<Sample>>,
    {
        let points = points.into();
        if points.is_empty() {
            return Err(DspError::EmptyConstellation);
        }
        Ok(Self { points })
    }

    /// Unit-modulus `order`-PSK, rotated by `offset` radians
    pub fn psk(order: usize, offset: f64) -> Self {
        let order = usize::max(order, 1);
        let points = (0..order)
            .map(|k| Sample::from_polar(1.0, offset + 2.0 * PI * k as f64 / order as f64))
            .collect();
        Self { points }
    }

    /// Unit-power square QAM with `side` points per axis
    ///
    /// `side = 2` is QPSK, `side = 4` is 16-QAM.
    pub fn square_qam(side: usize) -> Self {
        let side = usize::max(side, 1);
        let levels: Vec<f64> = (0..side)
            .map(|i| 2.0 * i as f64 - (side as f64 - 1.0))
            .collect();
        let mut points = Vec::with_capacity(side * side);
        for re in &levels {
            for im in &levels {
                points.push(Sample::new(*re, *im));
            }
        }
        Self { points }.normalized()
    }

    /// QPSK, `(±1 ± j)/√2`
    pub fn qpsk() -> Self {
        Self {
            points: vec![
                Sample::new(FRAC_1_SQRT_2, FRAC_1_SQRT_2),
                Sample::new(-FRAC_1_SQRT_2, FRAC_1_SQRT_2),
                Sample::new(-FRAC_1_SQRT_2, -FRAC_1_SQRT_2),
                Sample::new(FRAC_1_SQRT_2, -FRAC_1_SQRT_2),
            ],
        }
    }

    /// Scale to unit mean power
    pub fn normalized(&self) -> Self {
        let pwr = self.mean_power();
        if pwr <= 0.0 {
            return self.clone();
        }
        let gain = 1.0 / pwr.sqrt();
        Self {
            points: self.points.iter().map(|p| *p * gain).collect(),
        }
    }

    /// Constellation points
    pub fn points(&self) -> &[Sample] {
        &self.points
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True if there are no points
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Mean power `E|c|²`
    pub fn mean_power(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        self.points.iter().map(|p| p.norm_sqr()).sum::<f64>() / self.points.len() as f64
    }

    /// Index of the point nearest to `z`
    pub fn nearest_index(&self, z: Sample) -> usize {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for (ind, p) in self.points.iter().enumerate() {
            let dist = (z - *p).norm_sqr();
            if dist < best_dist {
                best_dist = dist;
                best = ind;
            }
        }
        best
    }

    /// Hard decision: the point nearest to `z`
    ///
    /// Panics if the constellation is empty; all public
    /// constructors prevent this.
    #[inline]
    pub fn decide(&self, z: Sample) -> Sample {
        self.points[self.nearest_index(z)]
    }

    /// Constant-modulus radius `R₂ = E|c|⁴ / E|c|²`
    pub fn cma_radius(&self) -> f64 {
        let pwr = self.mean_power();
        if pwr <= 0.0 {
            return 0.0;
        }
        let m4 = self.points.iter().map(|p| p.norm_sqr().powi(2)).sum::<f64>()
            / self.points.len() as f64;
        m4 / pwr
    }

    /// Distinct point moduli ("rings"), ascending
    pub fn radii(&self) -> Vec<f64> {
        const TOLERANCE: f64 = 1.0e-9;

        let mut moduli: Vec<f64> = self.points.iter().map(|p| p.norm()).collect();
        moduli.sort_by(|a, b| a.total_cmp(b));
        moduli.dedup_by(|a, b| (*a - *b).abs() < TOLERANCE);
        moduli
    }

    /// Ring radius nearest to modulus `r`
    pub fn nearest_radius(&self, r: f64) -> f64 {
        self.radii()
            .into_iter()
            .min_by(|a, b| (a - r).abs().total_cmp(&(b - r).abs()))
            .unwrap_or(0.0)
    }

    /// Phase reference for an `order`-th power phase estimator
    ///
    /// Raising a symbol to the `order`-th power removes the
    /// modulation of symmetric constellations, leaving a fixed
    /// phasor. This returns that phasor (unit modulus), computed
    /// from the outermost point.
    pub fn power_reference(&self, order: u32) -> Sample {
        let outer = self
            .points
            .iter()
            .copied()
            .max_by(|a, b| a.norm_sqr().total_cmp(&b.norm_sqr()))
            .unwrap_or(Sample::new(1.0, 0.0));
        let raised = outer.powu(order);
        if raised.norm() > 0.0 {
            raised / raised.norm()
        } else {
            Sample::new(1.0, 0.0)
        }
    }
}

impl AsRef<[Sample]> for Constellation {
    fn as_ref(&self) -> &[Sample] {
        self.points()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_empty() {
        assert_eq!(
            Err(DspError::EmptyConstellation),
            Constellation::new(Vec::<Sample>::new())
        );
    }

    #[test]
    fn test_qpsk() {
        let qpsk = Constellation::qpsk();
        assert_eq!(4, qpsk.len());
        assert_approx_eq!(qpsk.mean_power(), 1.0);
        assert_approx_eq!(qpsk.cma_radius(), 1.0);
        assert_eq!(1, qpsk.radii().len());

        let d = qpsk.decide(Sample::new(0.2, -3.0));
        assert_approx_eq!(d.re, FRAC_1_SQRT_2);
        assert_approx_eq!(d.im, -FRAC_1_SQRT_2);

        // (±1±j)^4 / 4 = -1
        let r = qpsk.power_reference(4);
        assert_approx_eq!(r.re, -1.0);
        assert_approx_eq!(r.im, 0.0);

        // named qpsk has the same points
        let named = Modulation::Qpsk.constellation();
        for (a, b) in named.points().iter().zip(qpsk.points()) {
            assert_approx_eq!(a.re, b.re);
            assert_approx_eq!(a.im, b.im);
        }
    }

    #[test]
    fn test_qam16() {
        let qam = Modulation::Qam16.constellation();
        assert_eq!(16, qam.len());
        assert_approx_eq!(qam.mean_power(), 1.0);

        // three rings: √2, √10, √18 (÷√10)
        let radii = qam.radii();
        assert_eq!(3, radii.len());
        assert_approx_eq!(radii[0], f64::sqrt(2.0 / 10.0));
        assert_approx_eq!(radii[2], f64::sqrt(18.0 / 10.0));
        assert_approx_eq!(qam.nearest_radius(1.4), f64::sqrt(18.0 / 10.0));

        // E|c|^4 / E|c|^2 for 16-QAM is 1.32
        assert_approx_eq!(qam.cma_radius(), 1.32, 1.0e-9);
    }

    #[test]
    fn test_all_modulations() {
        use strum::IntoEnumIterator;

        for modulation in Modulation::iter() {
            let c = modulation.constellation();
            assert_approx_eq!(c.mean_power(), 1.0);
            assert_eq!(modulation, Modulation::from_str(&modulation.to_string()).unwrap());

            // the blind estimator strips the modulation
            let order = modulation.phase_order();
            let r = c.power_reference(order);
            let outer = c.radii().last().copied().unwrap();
            for p in c.points().iter().filter(|p| (p.norm() - outer).abs() < 1.0e-9) {
                let raised = p.powu(order) / p.norm().powi(order as i32);
                assert_approx_eq!(raised.re, r.re, 1.0e-9);
            }
        }
    }

    #[test]
    fn test_modulation_names() {
        assert_eq!(Modulation::Qpsk, Modulation::from_str("qpsk").unwrap());
        assert_eq!(Modulation::Qam16, Modulation::from_str("16qam").unwrap());
        assert_eq!(Modulation::Psk8, Modulation::from_str("psk8").unwrap());
        assert_eq!("qpsk", Modulation::Qpsk.to_string());
        assert!(Modulation::from_str("ook").is_err());
    }
}
