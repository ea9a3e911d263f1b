//! Carrier phase recovery
//!
//! After equalization, the symbols of each polarization still
//! carry the residual phase noise and frequency offset of the
//! transmit laser and local oscillator. A second-order phase
//! tracking loop removes them, one symbol at a time:
//!
//! ```txt
//! z      = u · e^(-jφ)
//! err    = detector(z)
//! ω     += β · err
//! φ     += ω + α · err
//! ```
//!
//! The proportional and integral gains `α` and `β` follow from
//! the loop bandwidth `B` (rad/symbol) and damping `ζ`:
//!
//! ```txt
//! α = 4ζB / (1 + 2ζB + B²)
//! β = 4B² / (1 + 2ζB + B²)
//! ```
//!
//! The phase detector is one of
//!
//! * decision-directed: `arg(z · conj(d))`, with `d` the nearest
//!   constellation point;
//! * blind M-th power: `arg(z^M · conj(r)) / M`, where `r` is the
//!   M-th power of the constellation's outer point; or
//! * hybrid: blind for the first few symbols of the stream, then
//!   decision-directed.
//!
//! The blind detector has an `M`-fold phase ambiguity which the
//! tracker does not resolve.
//!
//! [`TrackingFilter::Kalman`] replaces the loop with an extended
//! Kalman filter over the state `[φ, ω]`. It predicts with
//!
//! ```txt
//! φ ← φ + ω        P ← A P Aᵀ + Q        A = [[1, 1], [0, 1]]
//! ```
//!
//! and corrects against the received sample `u`, measured in
//! the complex plane against the rotated decision
//! `û = d · e^(jφ)`. The loop gains then adapt to the noise
//! covariances `Q` and `R` instead of a fixed bandwidth.
//!
//! Large frequency offsets exceed the loop's pull-in range. Seed
//! the tracker with [`estimate_frequency_offset()`] first.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

use nalgebra::{Matrix2, Vector2};

use crate::constellation::Constellation;
use crate::error::{DspError, Result};
use crate::spectral::SpectralFilter;
use crate::waveform::{Sample, Waveform, POLARIZATIONS};

#[cfg(not(test))]
use log::debug;

#[cfg(test)]
use std::println as debug;

/// Phase error detector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseDetector {
    /// Against the nearest constellation point
    DecisionDirected,

    /// M-th power, for `order`-fold symmetric constellations
    Blind {
        /// Power `M`
        order: u32,
    },

    /// Blind for the first `blind_symbols`, then decision-directed
    Hybrid {
        /// Power `M` of the blind detector
        order: u32,

        /// Symbols to spend in blind mode
        blind_symbols: u64,
    },
}

impl Default for PhaseDetector {
    fn default() -> Self {
        PhaseDetector::DecisionDirected
    }
}

/// Noise covariances for the Kalman tracker
///
/// `phase` and `frequency` are the per-symbol process noise
/// variances of the phase (rad²) and frequency (rad²/symbol²).
/// `measurement` is the variance of each quadrature of the
/// received sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KalmanNoise {
    /// Phase process noise
    pub phase: f64,

    /// Frequency process noise
    pub frequency: f64,

    /// Measurement noise
    pub measurement: f64,
}

impl Default for KalmanNoise {
    fn default() -> Self {
        Self {
            phase: 1.0e-3,
            frequency: 1.0e-7,
            measurement: 1.0e-2,
        }
    }
}

/// Filter which turns phase measurements into estimates
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrackingFilter {
    /// Second-order loop with fixed gains
    Loop,

    /// Extended Kalman filter
    ///
    /// Always decision-directed. The [`PhaseDetector`] is
    /// ignored.
    Kalman(KalmanNoise),
}

impl Default for TrackingFilter {
    fn default() -> Self {
        TrackingFilter::Loop
    }
}

/// Tracking loop state for both polarizations
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseTrackerState {
    // phase estimate (rad), wrapped to ±π
    phase: [f64; POLARIZATIONS],

    // frequency estimate (rad/symbol)
    frequency: [f64; POLARIZATIONS],

    // symbols processed since initialization
    symbols: u64,

    // predicted [φ, ω] covariance, Kalman tracker only
    covariance: [Matrix2<f64>; POLARIZATIONS],
}

impl PhaseTrackerState {
    /// Zero phase and frequency
    pub fn new() -> Self {
        Self {
            phase: [0.0; POLARIZATIONS],
            frequency: [0.0; POLARIZATIONS],
            symbols: 0,
            covariance: [Matrix2::identity(); POLARIZATIONS],
        }
    }

    /// Seed both polarizations with a frequency (rad/symbol)
    ///
    /// A frequency offset of `f` Hz at symbol rate `Rs` is
    /// `2π · f / Rs` rad/symbol.
    pub fn with_frequency(mut self, rad_per_symbol: f64) -> Self {
        self.frequency = [rad_per_symbol; POLARIZATIONS];
        self
    }

    /// Phase estimates (rad)
    pub fn phase(&self) -> [f64; POLARIZATIONS] {
        self.phase
    }

    /// Frequency estimates (rad/symbol)
    pub fn frequency(&self) -> [f64; POLARIZATIONS] {
        self.frequency
    }

    /// Symbols processed
    pub fn symbols(&self) -> u64 {
        self.symbols
    }
}

impl Default for PhaseTrackerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Carrier phase tracker
///
/// Build with [`CarrierBuilder`].
#[derive(Clone, Debug)]
pub struct CarrierRecovery {
    alpha: f64,
    beta: f64,
    max_frequency: f64,
    detector: PhaseDetector,
    tracking: TrackingFilter,
    constellation: Option<Constellation>,
    power_reference: Sample,
}

impl CarrierRecovery {
    /// Fresh tracking state
    pub fn initialize(&self) -> PhaseTrackerState {
        PhaseTrackerState::new()
    }

    /// Remove the carrier phase from a block of symbols
    ///
    /// `symbols` must have one sample per symbol; anything else
    /// fails with [`DspError::Oversampling`] or
    /// [`DspError::InvalidParameter`]. Returns the corrected
    /// symbols and the new state.
    pub fn step(
        &self,
        mut state: PhaseTrackerState,
        symbols: &Waveform,
    ) -> Result<(Waveform, PhaseTrackerState)> {
        if symbols.samples_per_symbol()? != 1 {
            return Err(DspError::InvalidParameter(
                "carrier recovery needs one sample per symbol",
            ));
        }

        let out = symbols.map_pairs(|input| {
            let blind = self.is_blind(state.symbols);
            let mut out = [Sample::new(0.0, 0.0); POLARIZATIONS];
            for (p, (o, u)) in out.iter_mut().zip(input.iter()).enumerate() {
                if let (TrackingFilter::Kalman(noise), Some(constellation)) =
                    (self.tracking, &self.constellation)
                {
                    *o = self.kalman(&noise, constellation, *u, &mut state, p);
                    continue;
                }

                let z = u * Sample::from_polar(1.0, -state.phase[p]);
                let err = self.phase_error(z, blind);

                let freq = state.frequency[p] + self.beta * err;
                state.frequency[p] = f64::clamp(freq, -self.max_frequency, self.max_frequency);
                state.phase[p] = wrap_phase(state.phase[p] + state.frequency[p] + self.alpha * err);
                *o = z;
            }

            state.symbols += 1;
            if let PhaseDetector::Hybrid { blind_symbols, .. } = self.detector {
                if state.symbols == blind_symbols {
                    debug!(
                        "carrier: decision-directed after {} symbols, phase {:.3} rad",
                        blind_symbols, state.phase[0]
                    );
                }
            }
            out
        });

        Ok((out, state))
    }

    /// Proportional gain α
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Integral gain β
    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Phase detector
    pub fn detector(&self) -> PhaseDetector {
        self.detector
    }

    /// Tracking filter
    pub fn tracking(&self) -> TrackingFilter {
        self.tracking
    }

    // One extended Kalman filter step on polarization `p`
    //
    // On entry the state holds the prediction for this symbol.
    // On exit it holds the prediction for the next.
    fn kalman(
        &self,
        noise: &KalmanNoise,
        constellation: &Constellation,
        u: Sample,
        state: &mut PhaseTrackerState,
        p: usize,
    ) -> Sample {
        let rot = Sample::from_polar(1.0, state.phase[p]);
        let z = u * rot.conj();
        let expect = constellation.decide(z) * rot;

        // ∂û/∂φ = j·û
        let h = Matrix2::new(-expect.im, 0.0, expect.re, 0.0);
        let innovation = Vector2::new(u.re - expect.re, u.im - expect.im);
        let cov = state.covariance[p];
        let s = h * cov * h.transpose() + Matrix2::from_diagonal_element(noise.measurement);

        let mut x = Vector2::new(state.phase[p], state.frequency[p]);
        let mut cov = cov;
        if let Some(s_inv) = s.try_inverse() {
            let gain = cov * h.transpose() * s_inv;
            x += gain * innovation;
            cov = (Matrix2::identity() - gain * h) * cov;
        }

        let a = Matrix2::new(1.0, 1.0, 0.0, 1.0);
        let q = Matrix2::new(noise.phase, 0.0, 0.0, noise.frequency);
        state.frequency[p] = f64::clamp(x[1], -self.max_frequency, self.max_frequency);
        state.phase[p] = wrap_phase(x[0] + state.frequency[p]);
        state.covariance[p] = a * cov * a.transpose() + q;
        z
    }

    fn is_blind(&self, symbols: u64) -> bool {
        match self.detector {
            PhaseDetector::DecisionDirected => false,
            PhaseDetector::Blind { .. } => true,
            PhaseDetector::Hybrid { blind_symbols, .. } => symbols < blind_symbols,
        }
    }

    fn phase_error(&self, z: Sample, blind: bool) -> f64 {
        match (&self.constellation, self.detector) {
            (Some(constellation), _) if !blind => (z * constellation.decide(z).conj()).arg(),
            (_, PhaseDetector::Blind { order }) | (_, PhaseDetector::Hybrid { order, .. }) => {
                let order = u32::max(order, 1);
                (z.powu(order) * self.power_reference.conj()).arg() / order as f64
            }
            _ => 0.0,
        }
    }
}

/// Builds a [`CarrierRecovery`]
///
/// The defaults are a decision-directed QPSK tracker with a
/// loop bandwidth of 0.01 rad/symbol and damping `1/√2`.
#[derive(Clone, Debug)]
pub struct CarrierBuilder {
    loop_bandwidth: f64,
    damping: f64,
    max_frequency: f64,
    detector: PhaseDetector,
    tracking: TrackingFilter,
    constellation: Vec<Sample>,
}

impl CarrierBuilder {
    /// New builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the tracker
    ///
    /// Fails with [`DspError::EmptyConstellation`] if a
    /// decision-directed or hybrid detector, or the Kalman
    /// tracker, has no constellation. The blind detector does
    /// not need one; it then assumes a power reference of
    /// `1 + 0j`.
    pub fn build(&self) -> Result<CarrierRecovery> {
        let constellation = match Constellation::new(self.constellation.clone()) {
            Ok(c) => Some(c),
            Err(e) => match (self.detector, self.tracking) {
                (PhaseDetector::Blind { .. }, TrackingFilter::Loop) => None,
                _ => return Err(e),
            },
        };

        let power_reference = match (&constellation, self.detector) {
            (Some(c), PhaseDetector::Blind { order })
            | (Some(c), PhaseDetector::Hybrid { order, .. }) => c.power_reference(order),
            _ => Sample::new(1.0, 0.0),
        };

        let bw = self.loop_bandwidth;
        let damp = self.damping;
        let denom = 1.0 + 2.0 * damp * bw + bw * bw;

        Ok(CarrierRecovery {
            alpha: 4.0 * damp * bw / denom,
            beta: 4.0 * bw * bw / denom,
            max_frequency: self.max_frequency,
            detector: self.detector,
            tracking: self.tracking,
            constellation,
            power_reference,
        })
    }

    /// Loop bandwidth (rad/symbol)
    pub fn with_loop_bandwidth(&mut self, bandwidth: f64) -> &mut Self {
        self.loop_bandwidth = f64::clamp(bandwidth, 0.0, 1.0);
        self
    }

    /// Loop damping factor
    pub fn with_damping(&mut self, damping: f64) -> &mut Self {
        self.damping = f64::clamp(damping, 0.1, 10.0);
        self
    }

    /// Largest trackable frequency offset (rad/symbol)
    pub fn with_max_frequency(&mut self, max_frequency: f64) -> &mut Self {
        self.max_frequency = f64::clamp(max_frequency, 0.0, PI);
        self
    }

    /// Phase detector
    pub fn with_detector(&mut self, detector: PhaseDetector) -> &mut Self {
        self.detector = detector;
        self
    }

    /// Tracking filter
    ///
    /// Kalman noise covariances are floored at a small positive
    /// value.
    pub fn with_tracking(&mut self, tracking: TrackingFilter) -> &mut Self {
        self.tracking = match tracking {
            TrackingFilter::Kalman(noise) => TrackingFilter::Kalman(KalmanNoise {
                phase: f64::max(noise.phase, 1.0e-12),
                frequency: f64::max(noise.frequency, 1.0e-12),
                measurement: f64::max(noise.measurement, 1.0e-9),
            }),
            other => other,
        };
        self
    }

    /// Constellation for decisions and the blind power reference
    pub fn with_constellation(&mut self, constellation: &[Sample]) -> &mut Self {
        self.constellation = constellation.to_vec();
        self
    }

    /// Loop bandwidth (rad/symbol)
    pub fn loop_bandwidth(&self) -> f64 {
        self.loop_bandwidth
    }

    /// Loop damping factor
    pub fn damping(&self) -> f64 {
        self.damping
    }

    /// Phase detector
    pub fn detector(&self) -> PhaseDetector {
        self.detector
    }
}

impl Default for CarrierBuilder {
    fn default() -> Self {
        Self {
            loop_bandwidth: 0.01,
            damping: FRAC_1_SQRT_2,
            max_frequency: 0.5,
            detector: PhaseDetector::DecisionDirected,
            tracking: TrackingFilter::Loop,
            constellation: Constellation::qpsk().points().to_vec(),
        }
    }
}

/// Blind carrier frequency offset estimate (Hz)
///
/// Raises every sample to the `order`-th power, which strips
/// the modulation of `order`-fold symmetric constellations and
/// leaves a tone at `order` times the offset. The tone is
/// located with a zero-padded FFT, summed over both
/// polarizations. Offsets beyond `±sample_rate / (2 · order)`
/// alias.
///
/// Returns 0.0 for an empty waveform.
pub fn estimate_frequency_offset(wf: &Waveform, order: u32, filter: &SpectralFilter) -> f64 {
    if wf.is_empty() {
        return 0.0;
    }
    let order = u32::max(order, 1);
    let nfft = (4 * wf.len()).next_power_of_two();

    let mut spectrum = vec![0.0f64; nfft];
    for pol in [wf.x(), wf.y()] {
        let mut buf = vec![Sample::new(0.0, 0.0); nfft];
        for (b, s) in buf.iter_mut().zip(pol.iter()) {
            *b = s.powu(order);
        }
        filter.fft(&mut buf);
        for (acc, b) in spectrum.iter_mut().zip(buf.iter()) {
            *acc += b.norm_sqr();
        }
    }

    let peak = spectrum
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(k, _)| k)
        .unwrap_or(0);

    // cycles per sample, in [-0.5, 0.5)
    let mut cycles = peak as f64 / nfft as f64;
    if cycles >= 0.5 {
        cycles -= 1.0;
    }
    cycles * wf.sample_rate() / order as f64
}

// Wrap to (-π, π]
#[inline]
fn wrap_phase(phase: f64) -> f64 {
    let out = (phase + PI).rem_euclid(2.0 * PI) - PI;
    if out <= -PI {
        out + 2.0 * PI
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    use crate::metrics::{normalized_mse, symbol_errors};
    use crate::simulate::{add_noise, carrier_offset, dual_pol_symbols};

    const RATE: f64 = 1.0e9;

    fn qpsk(len: usize, seed: u64) -> Waveform {
        dual_pol_symbols(&Constellation::qpsk(), len, RATE, seed).unwrap()
    }

    #[test]
    fn test_wrap_phase() {
        assert_approx_eq!(wrap_phase(0.5), 0.5);
        assert_approx_eq!(wrap_phase(2.0 * PI + 0.5), 0.5);
        assert_approx_eq!(wrap_phase(-2.0 * PI - 0.5), -0.5);
        assert_approx_eq!(wrap_phase(-PI), PI);
    }

    #[test]
    fn test_loop_gains() {
        let cpr = CarrierBuilder::new().with_loop_bandwidth(0.01).build().unwrap();
        let denom = 1.0 + 2.0 * FRAC_1_SQRT_2 * 0.01 + 1.0e-4;
        assert_approx_eq!(cpr.alpha(), 4.0 * FRAC_1_SQRT_2 * 0.01 / denom);
        assert_approx_eq!(cpr.beta(), 4.0e-4 / denom);
    }

    #[test]
    fn test_converges_to_constant_phase() {
        let tx = qpsk(2000, 1);
        let rx = carrier_offset(&tx, 0.3, 0.0);

        for detector in [
            PhaseDetector::DecisionDirected,
            PhaseDetector::Blind { order: 4 },
            PhaseDetector::Hybrid {
                order: 4,
                blind_symbols: 200,
            },
        ] {
            let cpr = CarrierBuilder::new()
                .with_loop_bandwidth(0.02)
                .with_detector(detector)
                .build()
                .unwrap();
            let (out, state) = cpr.step(cpr.initialize(), &rx).unwrap();

            assert_eq!(2000, state.symbols());
            assert_approx_eq!(state.phase()[0], 0.3, 1.0e-6);
            assert_approx_eq!(state.phase()[1], 0.3, 1.0e-6);
            assert_approx_eq!(state.frequency()[0], 0.0, 1.0e-6);
            assert!(normalized_mse(&out.slice(1000, 1000), &tx.slice(1000, 1000)) < 1.0e-10);
        }
    }

    #[test]
    fn test_tracks_frequency_offset() {
        let tx = qpsk(6000, 2);
        let per_symbol = 2.0e-3;
        let rx = carrier_offset(&tx, 0.0, per_symbol * RATE / (2.0 * PI));

        let cpr = CarrierBuilder::new()
            .with_loop_bandwidth(0.02)
            .build()
            .unwrap();

        // streaming in two blocks gives the same result as one
        let (whole, whole_state) = cpr.step(cpr.initialize(), &rx).unwrap();
        let (_, state) = cpr.step(cpr.initialize(), &rx.slice(0, 2500)).unwrap();
        let (tail, state) = cpr.step(state, &rx.slice(2500, 3500)).unwrap();
        assert_eq!(whole_state, state);
        assert_eq!(whole.slice(2500, 3500).x(), tail.x());

        assert_approx_eq!(state.frequency()[0], per_symbol, 1.0e-6);
        assert_approx_eq!(state.frequency()[1], per_symbol, 1.0e-6);
        assert!(normalized_mse(&whole.slice(4000, 2000), &tx.slice(4000, 2000)) < 1.0e-8);
    }

    fn kalman() -> CarrierRecovery {
        CarrierBuilder::new()
            .with_tracking(TrackingFilter::Kalman(KalmanNoise::default()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_kalman_constant_phase() {
        let tx = qpsk(2000, 5);
        let rx = carrier_offset(&tx, 0.3, 0.0);

        let cpr = kalman();
        let (out, state) = cpr.step(cpr.initialize(), &rx).unwrap();
        assert_approx_eq!(state.phase()[0], 0.3, 1.0e-6);
        assert_approx_eq!(state.phase()[1], 0.3, 1.0e-6);
        assert_approx_eq!(state.frequency()[1], 0.0, 1.0e-6);
        assert!(normalized_mse(&out.slice(1000, 1000), &tx.slice(1000, 1000)) < 1.0e-10);

        // the covariance settles to a steady state
        let p = state.covariance[0];
        assert!(p[(0, 0)] > 0.0 && p[(0, 0)] < 1.0e-1);
        assert!(p[(1, 1)] > 0.0 && p[(1, 1)] < 1.0e-2);
    }

    #[test]
    fn test_kalman_tracks_frequency_offset() {
        let tx = qpsk(6000, 6);
        let per_symbol = 2.0e-3;
        let rx = carrier_offset(&tx, 0.0, per_symbol * RATE / (2.0 * PI));

        let cpr = kalman();
        let (whole, whole_state) = cpr.step(cpr.initialize(), &rx).unwrap();
        let (_, state) = cpr.step(cpr.initialize(), &rx.slice(0, 3000)).unwrap();
        let (_, state) = cpr.step(state, &rx.slice(3000, 3000)).unwrap();
        assert_eq!(whole_state, state);

        assert_approx_eq!(state.frequency()[0], per_symbol, 1.0e-6);
        assert!(normalized_mse(&whole.slice(4000, 2000), &tx.slice(4000, 2000)) < 1.0e-8);
    }

    #[test]
    fn test_kalman_with_noise() {
        let tx = qpsk(3000, 7);
        let rx = add_noise(&carrier_offset(&tx, -0.5, 2.0e5), 20.0, 8);

        let (out, _) = kalman().step(PhaseTrackerState::new(), &rx).unwrap();
        let tail = out.slice(500, 2500);
        let want = tx.slice(500, 2500);
        let qpsk = Constellation::qpsk();
        assert_eq!(0, symbol_errors(tail.x(), want.x(), &qpsk));
        assert_eq!(0, symbol_errors(tail.y(), want.y(), &qpsk));
    }

    #[test]
    fn test_step_is_pure() {
        let rx = carrier_offset(&qpsk(300, 3), 0.2, 1.0e5);
        let cpr = CarrierBuilder::new().build().unwrap();
        let state = cpr.initialize().with_frequency(1.0e-4);
        let a = cpr.step(state.clone(), &rx).unwrap();
        let b = cpr.step(state, &rx).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_constellation_required() {
        let err = CarrierBuilder::new()
            .with_constellation(&[])
            .build()
            .unwrap_err();
        assert_eq!(DspError::EmptyConstellation, err);

        let err = CarrierBuilder::new()
            .with_constellation(&[])
            .with_detector(PhaseDetector::Hybrid {
                order: 4,
                blind_symbols: 10,
            })
            .build()
            .unwrap_err();
        assert_eq!(DspError::EmptyConstellation, err);

        let err = CarrierBuilder::new()
            .with_constellation(&[])
            .with_detector(PhaseDetector::Blind { order: 4 })
            .with_tracking(TrackingFilter::Kalman(KalmanNoise::default()))
            .build()
            .unwrap_err();
        assert_eq!(DspError::EmptyConstellation, err);

        // blind falls back to a unit reference: QPSK at 0° and
        // 90° raises to +1
        let cpr = CarrierBuilder::new()
            .with_constellation(&[])
            .with_detector(PhaseDetector::Blind { order: 4 })
            .build()
            .unwrap();
        let x = vec![Sample::new(1.0, 0.0), Sample::new(0.0, 1.0)];
        let tx = Waveform::symbols(x.clone(), x, RATE).unwrap();
        let (out, state) = cpr.step(cpr.initialize(), &tx).unwrap();
        assert_eq!(tx, out);
        assert_eq!([0.0, 0.0], state.phase());
    }

    #[test]
    fn test_oversampled_input_rejected() {
        let cpr = CarrierBuilder::new().build().unwrap();
        let x = vec![Sample::new(1.0, 0.0); 8];
        let wf = Waveform::new(x.clone(), x, 2.0 * RATE, RATE).unwrap();
        assert!(matches!(
            cpr.step(cpr.initialize(), &wf),
            Err(DspError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_estimate_frequency_offset() {
        let filt = SpectralFilter::new();
        let tx = dual_pol_symbols(&Constellation::qpsk(), 4096, 32.0e9, 4).unwrap();
        for offset in [200.0e6, -350.0e6] {
            let rx = carrier_offset(&tx, 1.0, offset);
            let est = estimate_frequency_offset(&rx, 4, &filt);
            assert_approx_eq!(est, offset, 2.0e6);
        }

        assert_eq!(0.0, estimate_frequency_offset(&tx.slice(0, 0), 4, &filt));
    }
}
