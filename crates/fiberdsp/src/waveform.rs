//! Dual-polarization sample buffers
//!
//! A [`Waveform`] holds the X and Y polarization tributaries of a
//! coherent receiver as complex baseband samples, together with the
//! sampling metadata that every stage needs: the sample rate, the
//! symbol rate, and an optional time origin.
//!
//! Symbol sequences are also `Waveform`s. They simply have a sample
//! rate equal to their symbol rate, i.e., one sample per symbol.
//!
//! ```
//! use fiberdsp::{Sample, Waveform};
//!
//! let x = vec![Sample::new(1.0, 0.0); 8];
//! let y = vec![Sample::new(0.0, 1.0); 8];
//! let wf = Waveform::new(x, y, 64.0e9, 32.0e9).expect("equal lengths");
//! assert_eq!(wf.samples_per_symbol().unwrap(), 2);
//! ```

use nalgebra::DVector;
use num_complex::Complex;

use crate::error::{DspError, Result};

/// Complex baseband sample
pub type Sample = Complex<f64>;

/// Number of polarization tributaries
pub const POLARIZATIONS: usize = 2;

/// Complex dual-polarization waveform
///
/// Both polarizations always have the same length. The
/// waveform is value-like: stages consume it or borrow it
/// immutably and return a new one.
#[derive(Clone, Debug, PartialEq)]
pub struct Waveform {
    // X and Y polarization samples
    pols: [DVector<Sample>; POLARIZATIONS],

    // samples per second
    sample_rate: f64,

    // symbols per second
    symbol_rate: f64,

    // time of the first sample, in seconds, if known
    time_origin: Option<f64>,
}

impl Waveform {
    /// Create from polarization sample vectors
    ///
    /// Fails with [`DspError::ShapeMismatch`] if `x` and `y`
    /// have different lengths, and with
    /// [`DspError::InvalidParameter`] if either rate is not
    /// positive.
    pub fn new<X, Y>(x: X, y: Y, sample_rate: f64, symbol_rate: f64) -> Result<Self>
    where
        X: Into<Vec<Sample>>,
        Y: Into<Vec<Sample>>,
    {
        let x = x.into();
        let y = y.into();
        if x.len() != y.len() {
            return Err(DspError::shape("polarization Y length", x.len(), y.len()));
        }
        if !(sample_rate > 0.0) || !(symbol_rate > 0.0) {
            return Err(DspError::InvalidParameter(
                "sample rate and symbol rate must be positive",
            ));
        }

        Ok(Self {
            pols: [DVector::from_vec(x), DVector::from_vec(y)],
            sample_rate,
            symbol_rate,
            time_origin: None,
        })
    }

    /// Create a symbol sequence (one sample per symbol)
    pub fn symbols<X, Y>(x: X, y: Y, symbol_rate: f64) -> Result<Self>
    where
        X: Into<Vec<Sample>>,
        Y: Into<Vec<Sample>>,
    {
        Self::new(x, y, symbol_rate, symbol_rate)
    }

    /// Create from `[x, y]` sample pairs
    pub fn from_pairs<I>(pairs: I, sample_rate: f64, symbol_rate: f64) -> Result<Self>
    where
        I: IntoIterator<Item = [Sample; POLARIZATIONS]>,
    {
        let (x, y): (Vec<Sample>, Vec<Sample>) =
            pairs.into_iter().map(|[x, y]| (x, y)).unzip();
        Self::new(x, y, sample_rate, symbol_rate)
    }

    /// Replace the samples, keeping all metadata
    ///
    /// Used by stages which transform samples without changing
    /// the sampling grid.
    pub fn with_samples<X, Y>(&self, x: X, y: Y) -> Result<Self>
    where
        X: Into<Vec<Sample>>,
        Y: Into<Vec<Sample>>,
    {
        let mut out = Self::new(x, y, self.sample_rate, self.symbol_rate)?;
        out.time_origin = self.time_origin;
        Ok(out)
    }

    /// Set the time origin (seconds)
    pub fn with_time_origin(mut self, t0: f64) -> Self {
        self.time_origin = Some(t0);
        self
    }

    /// Number of samples per polarization
    pub fn len(&self) -> usize {
        self.pols[0].len()
    }

    /// True if the waveform contains no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sampling rate (Hz)
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Symbol rate (Hz)
    pub fn symbol_rate(&self) -> f64 {
        self.symbol_rate
    }

    /// Time of the first sample (s), if known
    pub fn time_origin(&self) -> Option<f64> {
        self.time_origin
    }

    /// Oversampling factor, possibly fractional
    pub fn oversampling(&self) -> f64 {
        self.sample_rate / self.symbol_rate
    }

    /// Integer samples per symbol
    ///
    /// Stages which decimate to the symbol rate require an
    /// integer oversampling factor. Fails with
    /// [`DspError::Oversampling`] otherwise.
    pub fn samples_per_symbol(&self) -> Result<usize> {
        let sps = self.oversampling();
        let rounded = sps.round();
        if rounded < 1.0 || (sps - rounded).abs() > 1.0e-6 * rounded {
            return Err(DspError::Oversampling {
                sample_rate: self.sample_rate,
                symbol_rate: self.symbol_rate,
            });
        }
        Ok(rounded as usize)
    }

    /// X polarization samples
    #[inline]
    pub fn x(&self) -> &[Sample] {
        self.pols[0].as_slice()
    }

    /// Y polarization samples
    #[inline]
    pub fn y(&self) -> &[Sample] {
        self.pols[1].as_slice()
    }

    /// Samples of polarization `pol` (0 is X, 1 is Y)
    ///
    /// Panics if `pol >= 2`.
    #[inline]
    pub fn pol(&self, pol: usize) -> &[Sample] {
        self.pols[pol].as_slice()
    }

    /// Polarization vectors
    pub fn inner(&self) -> &[DVector<Sample>; POLARIZATIONS] {
        &self.pols
    }

    /// Sample pair at index `ind`
    #[inline]
    pub fn pair(&self, ind: usize) -> [Sample; POLARIZATIONS] {
        [self.pols[0][ind], self.pols[1][ind]]
    }

    /// Iterate over `[x, y]` sample pairs
    pub fn pairs(&self) -> impl Iterator<Item = [Sample; POLARIZATIONS]> + '_ {
        self.pols[0]
            .iter()
            .zip(self.pols[1].iter())
            .map(|(x, y)| [*x, *y])
    }

    /// Consume and return the `(x, y)` sample vectors
    pub fn into_samples(self) -> (Vec<Sample>, Vec<Sample>) {
        let [x, y] = self.pols;
        (x.as_slice().to_vec(), y.as_slice().to_vec())
    }

    /// Apply `func` to every sample of both polarizations
    pub fn map<F>(&self, mut func: F) -> Self
    where
        F: FnMut(Sample) -> Sample,
    {
        let mut out = self.clone();
        for pol in out.pols.iter_mut() {
            for sa in pol.iter_mut() {
                *sa = func(*sa);
            }
        }
        out
    }

    /// Apply `func` to every `[x, y]` sample pair
    pub fn map_pairs<F>(&self, mut func: F) -> Self
    where
        F: FnMut([Sample; POLARIZATIONS]) -> [Sample; POLARIZATIONS],
    {
        let mut out = self.clone();
        let [px, py] = &mut out.pols;
        for (sx, sy) in px.iter_mut().zip(py.iter_mut()) {
            let [x, y] = func([*sx, *sy]);
            *sx = x;
            *sy = y;
        }
        out
    }

    /// Take a sub-range of samples
    ///
    /// The range is clamped to the waveform length. The time
    /// origin, if any, is advanced accordingly.
    pub fn slice(&self, start: usize, len: usize) -> Self {
        let start = usize::min(start, self.len());
        let end = usize::min(start.saturating_add(len), self.len());
        let mut out = self.clone();
        for (opol, ipol) in out.pols.iter_mut().zip(self.pols.iter()) {
            *opol = DVector::from_column_slice(&ipol.as_slice()[start..end]);
        }
        out.time_origin = self
            .time_origin
            .map(|t0| t0 + start as f64 / self.sample_rate);
        out
    }

    /// Mean power of each polarization, `E|s|²`
    ///
    /// An empty waveform has zero power.
    pub fn power(&self) -> [f64; POLARIZATIONS] {
        let mut out = [0.0f64; POLARIZATIONS];
        if self.is_empty() {
            return out;
        }
        for (o, pol) in out.iter_mut().zip(self.pols.iter()) {
            *o = pol.iter().map(|s| s.norm_sqr()).sum::<f64>() / pol.len() as f64;
        }
        out
    }

    /// Mean total power of both polarizations
    pub fn total_power(&self) -> f64 {
        self.power().iter().sum()
    }

    /// Scale every sample by a real `gain`
    pub fn scaled(&self, gain: f64) -> Self {
        self.map(|s| s * gain)
    }

    /// Normalize each polarization to unit mean power
    ///
    /// Polarizations with zero power are left alone.
    pub fn normalized(&self) -> Self {
        let power = self.power();
        let mut out = self.clone();
        for (pol, pwr) in out.pols.iter_mut().zip(power.iter()) {
            if *pwr > 0.0 {
                let gain = 1.0 / pwr.sqrt();
                for sa in pol.iter_mut() {
                    *sa *= gain;
                }
            }
        }
        out
    }
}

/// Convert optical power in dBm to watts
pub fn dbm_to_watts(dbm: f64) -> f64 {
    1.0e-3 * f64::powf(10.0, dbm / 10.0)
}

/// Convert optical power in watts to dBm
pub fn watts_to_dbm(watts: f64) -> f64 {
    10.0 * f64::log10(watts / 1.0e-3)
}
