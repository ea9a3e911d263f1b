//! Complete coherent receiver
//!
//! A [`Receiver`] chains the stages of a digital coherent
//! receiver:
//!
//! ```txt
//! samples ─▶ CD compensation or DBP ─▶ normalize ─▶ MIMO equalizer ─▶ carrier recovery ─▶ symbols
//! ```
//!
//! Configure it with [`ReceiverBuilder`]. Like the individual
//! stages, the receiver is a pure state transition: all
//! adaptive state lives in a [`ReceiverState`], which
//! [`Receiver::process()`] consumes and returns.
//!
//! Dispersion compensation is applied to each block as a whole,
//! with circular convolution. Blocks should be long compared to
//! the dispersive memory of the link.

use crate::carrier::{estimate_frequency_offset, CarrierBuilder, CarrierRecovery, PhaseTrackerState};
use crate::constellation::Modulation;
use crate::equalize::{Equalizer, EqualizerBuilder, EqualizerState, RuleKind};
use crate::error::Result;
use crate::learned::LearnedBackPropagation;
use crate::propagate::{FiberLink, SplitStepPropagator, StepOrder, StepPolicy};
use crate::spectral::SpectralFilter;
use crate::waveform::Waveform;

#[cfg(not(test))]
use log::debug;

#[cfg(test)]
use std::println as debug;

/// Fiber impairment compensation
#[derive(Clone, Debug)]
pub enum Compensation {
    /// Pass samples straight to the equalizer
    None,

    /// Linear chromatic dispersion compensation over the whole link
    Dispersion,

    /// Split-step digital back-propagation
    BackPropagation {
        /// Steps per span
        steps: StepPolicy,

        /// Sub-step ordering
        order: StepOrder,
    },

    /// Learned back-propagation with trained parameters
    Learned(LearnedBackPropagation),
}

impl Default for Compensation {
    fn default() -> Self {
        Compensation::Dispersion
    }
}

/// Builds a [`Receiver`]
///
/// ```
/// use fiberdsp::{FiberLink, Modulation, ReceiverBuilder};
///
/// let mut link = FiberLink::new(80.0, 4);
/// link.with_dispersion(17.0);
///
/// let receiver = ReceiverBuilder::new(link)
///     .with_modulation(Modulation::Qpsk)
///     .with_launch_power(Some(2.0))
///     .build()
///     .expect("valid receiver");
/// let state = receiver.initialize().expect("valid state");
/// assert_eq!(0, state.equalizer().updates());
/// ```
#[derive(Clone, Debug)]
pub struct ReceiverBuilder {
    link: FiberLink,
    compensation: Compensation,
    launch_power: Option<f64>,
    nonlinear_scale: f64,
    normalize: bool,
    modulation: Modulation,
    equalizer: EqualizerBuilder,
    carrier: Option<CarrierBuilder>,
    estimate_frequency: bool,
    diagnostics: bool,
}

impl ReceiverBuilder {
    /// Receiver for `link` with default settings
    ///
    /// The defaults compensate dispersion, normalize power, and
    /// run a blind multi-user CMA equalizer followed by
    /// decision-directed carrier recovery, all for QPSK.
    pub fn new(link: FiberLink) -> Self {
        let mut equalizer = EqualizerBuilder::default();
        equalizer.with_rule(RuleKind::Mucma);
        Self {
            link,
            compensation: Compensation::default(),
            launch_power: None,
            nonlinear_scale: 1.0,
            normalize: true,
            modulation: Modulation::Qpsk,
            equalizer,
            carrier: Some(CarrierBuilder::default()),
            estimate_frequency: false,
            diagnostics: false,
        }
    }

    /// Build the receiver
    ///
    /// The modulation's constellation replaces any set on the
    /// equalizer or carrier builders. Fails if either stage
    /// rejects its configuration.
    pub fn build(&self) -> Result<Receiver> {
        let points = self.modulation.constellation();

        let compensation = match &self.compensation {
            Compensation::None => Stage::None,
            Compensation::Dispersion => Stage::Dispersion,
            Compensation::BackPropagation { steps, order } => {
                let mut prop = SplitStepPropagator::new(self.link);
                prop.with_steps(*steps)
                    .with_order(*order)
                    .with_nonlinear_scale(self.nonlinear_scale)
                    .with_launch_power(self.launch_power);
                // zero-step policies fail here, not on the first block
                steps.steps_per_span(self.link.span_length())?;
                Stage::BackPropagation(prop)
            }
            Compensation::Learned(ldbp) => Stage::Learned(ldbp.clone()),
        };

        let equalizer = self
            .equalizer
            .clone()
            .with_constellation(points.points())
            .build()?;

        let carrier = match &self.carrier {
            Some(builder) => Some(
                builder
                    .clone()
                    .with_constellation(points.points())
                    .build()?,
            ),
            None => None,
        };

        Ok(Receiver {
            link: self.link,
            compensation,
            filter: SpectralFilter::new(),
            normalize: self.normalize,
            equalizer,
            carrier,
            phase_order: self.modulation.phase_order(),
            estimate_frequency: self.estimate_frequency,
            diagnostics: self.diagnostics,
        })
    }

    /// Fiber link to compensate
    pub fn with_link(&mut self, link: FiberLink) -> &mut Self {
        self.link = link;
        self
    }

    /// Impairment compensation stage
    pub fn with_compensation(&mut self, compensation: Compensation) -> &mut Self {
        self.compensation = compensation;
        self
    }

    /// Launch power (dBm) assumed by back-propagation
    ///
    /// `None` back-propagates the samples at their own power.
    pub fn with_launch_power(&mut self, dbm: Option<f64>) -> &mut Self {
        self.launch_power = dbm.map(|p| f64::clamp(p, -30.0, 30.0));
        self
    }

    /// Back-propagation nonlinear scale ξ, `[0, 2]`
    pub fn with_nonlinear_scale(&mut self, xi: f64) -> &mut Self {
        self.nonlinear_scale = f64::clamp(xi, 0.0, 2.0);
        self
    }

    /// Normalize each polarization to unit power before equalizing
    pub fn with_normalize(&mut self, normalize: bool) -> &mut Self {
        self.normalize = normalize;
        self
    }

    /// Modulation format
    pub fn with_modulation(&mut self, modulation: Modulation) -> &mut Self {
        self.modulation = modulation;
        self
    }

    /// Equalizer settings
    pub fn with_equalizer(&mut self, equalizer: EqualizerBuilder) -> &mut Self {
        self.equalizer = equalizer;
        self
    }

    /// Carrier recovery settings, or `None` to skip the stage
    pub fn with_carrier(&mut self, carrier: Option<CarrierBuilder>) -> &mut Self {
        self.carrier = carrier;
        self
    }

    /// Seed carrier recovery with a blind frequency estimate
    ///
    /// The estimate is taken from the first block of the stream.
    pub fn with_frequency_estimate(&mut self, estimate: bool) -> &mut Self {
        self.estimate_frequency = estimate;
        self
    }

    /// Keep intermediate waveforms in the output
    pub fn with_diagnostics(&mut self, diagnostics: bool) -> &mut Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Fiber link
    pub fn link(&self) -> &FiberLink {
        &self.link
    }

    /// Impairment compensation stage
    pub fn compensation(&self) -> &Compensation {
        &self.compensation
    }

    /// Modulation format
    pub fn modulation(&self) -> Modulation {
        self.modulation
    }
}

impl Default for ReceiverBuilder {
    fn default() -> Self {
        Self::new(FiberLink::default())
    }
}

// Configured compensation stage
#[derive(Clone, Debug)]
enum Stage {
    None,
    Dispersion,
    BackPropagation(SplitStepPropagator),
    Learned(LearnedBackPropagation),
}

/// Adaptive state of a [`Receiver`]
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiverState {
    equalizer: EqualizerState,
    carrier: PhaseTrackerState,
}

impl ReceiverState {
    /// Equalizer state
    pub fn equalizer(&self) -> &EqualizerState {
        &self.equalizer
    }

    /// Carrier tracker state
    pub fn carrier(&self) -> &PhaseTrackerState {
        &self.carrier
    }
}

/// Intermediate results of one block
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostics {
    /// After dispersion compensation or back-propagation
    pub compensated: Waveform,

    /// After the equalizer, before carrier recovery
    pub equalized: Waveform,
}

/// Symbols recovered from one block
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiverOutput {
    /// Recovered symbols, one sample per symbol
    pub symbols: Waveform,

    /// Intermediate waveforms, if enabled
    pub diagnostics: Option<Diagnostics>,
}

/// Coherent receiver
///
/// Build with [`ReceiverBuilder`].
#[derive(Clone, Debug)]
pub struct Receiver {
    link: FiberLink,
    compensation: Stage,
    filter: SpectralFilter,
    normalize: bool,
    equalizer: Equalizer,
    carrier: Option<CarrierRecovery>,
    phase_order: u32,
    estimate_frequency: bool,
    diagnostics: bool,
}

impl Receiver {
    /// Fresh receiver state
    pub fn initialize(&self) -> Result<ReceiverState> {
        Ok(ReceiverState {
            equalizer: self.equalizer.initialize()?,
            carrier: PhaseTrackerState::new(),
        })
    }

    /// Recover symbols from a block of samples
    ///
    /// `reference`, if given, holds known transmitted symbols
    /// for training the equalizer; see [`Equalizer::step()`].
    /// Fails with the first error raised by any stage.
    pub fn process(
        &self,
        state: ReceiverState,
        wf: &Waveform,
        reference: Option<&Waveform>,
    ) -> Result<(ReceiverOutput, ReceiverState)> {
        let ReceiverState { equalizer, carrier } = state;

        let compensated = self.compensate(wf)?;
        let input = if self.normalize {
            compensated.normalized()
        } else {
            compensated.clone()
        };

        let (equalized, equalizer) = self.equalizer.step(equalizer, &input, reference)?;
        let (symbols, carrier) = self.track(carrier, &equalized)?;

        debug!(
            "receiver: {} samples → {} symbols, equalizer {} (cost {:.4})",
            wf.len(),
            symbols.len(),
            equalizer.phase(),
            equalizer.cost()
        );

        let diagnostics = if self.diagnostics {
            Some(Diagnostics {
                compensated,
                equalized,
            })
        } else {
            None
        };

        Ok((
            ReceiverOutput {
                symbols,
                diagnostics,
            },
            ReceiverState { equalizer, carrier },
        ))
    }

    /// Drain the last symbols at the end of a stream
    ///
    /// See [`Equalizer::flush()`]. The output carries no
    /// diagnostics.
    pub fn finish(&self, state: ReceiverState) -> Result<(ReceiverOutput, ReceiverState)> {
        let ReceiverState { equalizer, carrier } = state;
        let (equalized, equalizer) = self.equalizer.flush(equalizer)?;
        let (symbols, carrier) = self.track(carrier, &equalized)?;

        Ok((
            ReceiverOutput {
                symbols,
                diagnostics: None,
            },
            ReceiverState { equalizer, carrier },
        ))
    }

    /// Equalizer stage
    pub fn equalizer(&self) -> &Equalizer {
        &self.equalizer
    }

    /// Carrier recovery stage, if any
    pub fn carrier(&self) -> Option<&CarrierRecovery> {
        self.carrier.as_ref()
    }

    fn compensate(&self, wf: &Waveform) -> Result<Waveform> {
        match &self.compensation {
            Stage::None => Ok(wf.clone()),
            Stage::Dispersion => self.filter.compensate_dispersion(
                wf,
                self.link.dispersion(),
                self.link.wavelength(),
                self.link.total_length(),
            ),
            Stage::BackPropagation(prop) => prop.back_propagate(wf),
            Stage::Learned(ldbp) => ldbp.apply(wf),
        }
    }

    fn track(
        &self,
        mut state: PhaseTrackerState,
        symbols: &Waveform,
    ) -> Result<(Waveform, PhaseTrackerState)> {
        let carrier = match &self.carrier {
            Some(carrier) => carrier,
            None => return Ok((symbols.clone(), state)),
        };

        if self.estimate_frequency && state.symbols() == 0 && !symbols.is_empty() {
            let offset = estimate_frequency_offset(symbols, self.phase_order, &self.filter);
            debug!("receiver: carrier frequency offset {:.3} MHz", offset / 1.0e6);
            state = state.with_frequency(2.0 * std::f64::consts::PI * offset / symbols.symbol_rate());
        }

        carrier.step(state, symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};

    use crate::constellation::Constellation;
    use crate::error::DspError;
    use crate::metrics::align;
    use crate::simulate::{
        add_noise, carrier_offset, dual_pol_symbols, polarization_rotation, rotate_polarization,
        upsample,
    };

    const SYMBOL_RATE: f64 = 32.0e9;

    // QPSK → fiber → polarization rotation → carrier phase → noise
    fn channel(link: FiberLink, symbols: usize, launch_power: Option<f64>) -> (Waveform, Waveform) {
        channel_rotated(link, symbols, launch_power, (PI / 6.0, 0.0))
    }

    fn channel_rotated(
        link: FiberLink,
        symbols: usize,
        launch_power: Option<f64>,
        (theta, phi): (f64, f64),
    ) -> (Waveform, Waveform) {
        let tx = dual_pol_symbols(&Constellation::qpsk(), symbols, SYMBOL_RATE, 11).unwrap();
        let up = upsample(&tx, 2, &SpectralFilter::new()).unwrap();

        let mut fiber = SplitStepPropagator::new(link);
        fiber
            .with_steps(StepPolicy::PerSpan(32))
            .with_launch_power(launch_power);
        let rx = fiber.propagate(&up).unwrap();

        let rx = rotate_polarization(&rx, &polarization_rotation(theta, phi));
        let rx = carrier_offset(&rx, 0.4, 0.0);
        (tx, add_noise(&rx, 20.0, 12))
    }

    fn receiver(link: FiberLink, compensation: Compensation) -> ReceiverBuilder {
        let mut eq = EqualizerBuilder::new();
        eq.with_taps(11)
            .with_step_size(5.0e-3)
            .with_rule(RuleKind::Mucma);
        let mut cpr = CarrierBuilder::new();
        cpr.with_loop_bandwidth(0.01);

        let mut builder = ReceiverBuilder::new(link);
        builder
            .with_compensation(compensation)
            .with_equalizer(eq)
            .with_carrier(Some(cpr));
        builder
    }

    #[test]
    fn test_end_to_end_qpsk() {
        let mut link = FiberLink::new(50.0, 1);
        link.with_nonlinearity(0.0);
        let (tx, rx) = channel(link, 4096, None);

        let rcv = receiver(link, Compensation::Dispersion)
            .with_diagnostics(true)
            .build()
            .unwrap();
        let (out, state) = rcv.process(rcv.initialize().unwrap(), &rx, None).unwrap();
        assert!(state.equalizer().updates() > 4000);

        let diag = out.diagnostics.expect("diagnostics enabled");
        assert_eq!(rx.len(), diag.compensated.len());
        assert_eq!(out.symbols.len(), diag.equalized.len());

        let half = out.symbols.len() / 2;
        let alignment = align(
            &out.symbols.slice(half, half),
            &tx.slice(half, half),
            &Constellation::qpsk(),
            2,
        );
        debug!("end-to-end: {:?}", alignment);
        assert!(alignment.ser() <= 1.0e-2);

        let (tail, _) = rcv.finish(state).unwrap();
        assert_eq!(tx.len(), out.symbols.len() + tail.symbols.len());
    }

    #[test]
    fn test_recovers_both_polarizations() {
        // an even power split with a quarter-wave retardance is
        // where blind CMA most readily locks both outputs together
        let mut link = FiberLink::new(20.0, 1);
        link.with_nonlinearity(0.0);
        let (tx, rx) = channel_rotated(link, 4096, None, (FRAC_PI_4, FRAC_PI_2));

        let rcv = receiver(link, Compensation::Dispersion).build().unwrap();
        let (out, state) = rcv.process(rcv.initialize().unwrap(), &rx, None).unwrap();
        assert!(state.equalizer().cross_correlation().unwrap() < 0.3);

        let half = out.symbols.len() / 2;
        let alignment = align(
            &out.symbols.slice(half, half),
            &tx.slice(half, half),
            &Constellation::qpsk(),
            2,
        );
        debug!("both polarizations: {:?}", alignment);
        assert!(alignment.ser() <= 1.0e-2);

        assert!(ReceiverBuilder::new(link)
            .build()
            .unwrap()
            .equalizer()
            .decorrelation()
            .is_some());
    }

    #[test]
    fn test_back_propagation_receiver() {
        let mut link = FiberLink::new(80.0, 2);
        link.with_nonlinearity(1.3);
        let (tx, rx) = channel(link, 2048, Some(4.0));

        let rcv = receiver(
            link,
            Compensation::BackPropagation {
                steps: StepPolicy::PerSpan(4),
                order: StepOrder::Symmetric,
            },
        )
        .with_launch_power(Some(4.0))
        .build()
        .unwrap();
        let (out, _) = rcv.process(rcv.initialize().unwrap(), &rx, None).unwrap();

        let half = out.symbols.len() / 2;
        let alignment = align(
            &out.symbols.slice(half, half),
            &tx.slice(half, half),
            &Constellation::qpsk(),
            2,
        );
        assert!(alignment.ser() <= 1.0e-2);
    }

    #[test]
    fn test_streaming_blocks() {
        let mut link = FiberLink::new(20.0, 1);
        link.with_nonlinearity(0.0);
        let (_, rx) = channel(link, 1024, None);

        let rcv = receiver(link, Compensation::None)
            .with_normalize(false)
            .build()
            .unwrap();
        let state = rcv.initialize().unwrap();
        let (a, state) = rcv.process(state, &rx.slice(0, 1024), None).unwrap();
        let (b, state) = rcv.process(state, &rx.slice(1024, 1024), None).unwrap();
        let (c, state) = rcv.finish(state).unwrap();
        assert!(a.diagnostics.is_none());
        assert_eq!(1024, a.symbols.len() + b.symbols.len() + c.symbols.len());
        assert_eq!(1024, state.carrier().symbols());

        // identical to a single block
        let (whole, whole_state) = rcv.process(rcv.initialize().unwrap(), &rx, None).unwrap();
        let (_, whole_state) = rcv.finish(whole_state).unwrap();
        assert_eq!(whole_state, state);
        assert_eq!(&whole.symbols.x()[..a.symbols.len()], a.symbols.x());
    }

    #[test]
    fn test_frequency_estimate_seeds_tracker() {
        let tx = dual_pol_symbols(&Constellation::qpsk(), 4096, SYMBOL_RATE, 13).unwrap();
        let up = upsample(&tx, 2, &SpectralFilter::new()).unwrap();
        let rx = add_noise(&carrier_offset(&up, 0.2, 300.0e6), 20.0, 14);

        let mut link = FiberLink::new(1.0, 1);
        link.with_nonlinearity(0.0);
        let rcv = receiver(link, Compensation::None)
            .with_frequency_estimate(true)
            .build()
            .unwrap();
        let (out, state) = rcv.process(rcv.initialize().unwrap(), &rx, None).unwrap();

        let expect = 2.0 * PI * 300.0e6 / SYMBOL_RATE;
        assert!((state.carrier().frequency()[0] - expect).abs() < 1.0e-3);

        let half = out.symbols.len() / 2;
        let alignment = align(
            &out.symbols.slice(half, half),
            &tx.slice(half, half),
            &Constellation::qpsk(),
            2,
        );
        assert!(alignment.ser() <= 1.0e-2);
    }

    #[test]
    fn test_bad_configuration() {
        let link = FiberLink::default();
        let err = ReceiverBuilder::new(link)
            .with_compensation(Compensation::BackPropagation {
                steps: StepPolicy::PerSpan(0),
                order: StepOrder::Symmetric,
            })
            .build()
            .unwrap_err();
        assert_eq!(DspError::InvalidStepCount, err);

        let mut eq = EqualizerBuilder::new();
        eq.with_taps(0);
        let rcv = ReceiverBuilder::new(link).with_equalizer(eq).build().unwrap();
        assert!(matches!(
            rcv.initialize(),
            Err(DspError::TapLengthInvalid { .. })
        ));
    }
}
