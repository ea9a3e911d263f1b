//! # fiberdsp: coherent optical receiver DSP
//!
//! This crate provides the digital signal processing chain of a
//! dual-polarization coherent optical receiver. It recovers
//! transmitted symbols from the complex baseband samples of the
//! two polarization tributaries.
//!
//! ## Stages
//!
//! ```txt
//! ┌──────────────┐   ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ CD comp. or  │──▶│ normalize  │──▶│ 2×2 adaptive │──▶│ carrier      │──▶ symbols
//! │ back-prop.   │   │            │   │ equalizer    │   │ recovery     │
//! └──────────────┘   └────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! * [`SpectralFilter`] applies frequency-domain all-pass
//!   kernels, such as the inverse of the fiber's chromatic
//!   dispersion.
//! * [`SplitStepPropagator`] solves the Manakov equation by
//!   alternating linear and nonlinear sub-steps. Run backwards,
//!   it performs digital back-propagation (DBP).
//!   [`LearnedBackPropagation`] exposes the per-step kernels and
//!   nonlinear couplings of DBP as trainable parameters.
//! * [`Equalizer`] undoes polarization mixing and residual
//!   inter-symbol interference with four adaptive FIR filters,
//!   adapted blindly (CMA, multi-user CMA, RDE) or by decisions
//!   or training symbols (LMS).
//! * [`CarrierRecovery`] tracks and removes the residual carrier
//!   phase and frequency with a phase-locked loop or an extended
//!   Kalman filter.
//! * [`Receiver`] chains all of the above.
//!
//! Every stage is a pure function of its configuration, its
//! explicit state, and its input. Adaptive stages take their
//! state by value and return the new state alongside their
//! output:
//!
//! ```txt
//! (config, state, input) → (output, new state)
//! ```
//!
//! There is no hidden mutation, so a stage may be re-run from any
//! saved state, and its parameters may be tuned by the
//! gradient-based tools in [`optim`].
//!
//! ## Example
//!
//! Simulate a short QPSK link and recover its symbols:
//!
//! ```
//! use fiberdsp::simulate::{dual_pol_symbols, upsample};
//! use fiberdsp::{
//!     Constellation, FiberLink, ReceiverBuilder, SpectralFilter, SplitStepPropagator,
//! };
//!
//! let mut link = FiberLink::new(20.0, 1);
//! link.with_nonlinearity(0.0);
//!
//! // transmit
//! let tx = dual_pol_symbols(&Constellation::qpsk(), 1024, 32.0e9, 1).expect("symbols");
//! let samples = upsample(&tx, 2, &SpectralFilter::new()).expect("upsample");
//! let rx = SplitStepPropagator::new(link).propagate(&samples).expect("fiber");
//!
//! // receive
//! let receiver = ReceiverBuilder::new(link).build().expect("receiver");
//! let state = receiver.initialize().expect("state");
//! let (out, _state) = receiver.process(state, &rx, None).expect("process");
//! assert_eq!(1021, out.symbols.len());
//! ```
//!
//! ## Units
//!
//! Fiber parameters use the customary engineering units:
//! dispersion in ps/nm/km, wavelength in nm, lengths in km,
//! nonlinearity in 1/W/km, attenuation in dB/km, and power in
//! dBm. Sample and symbol rates are in Hz.

mod carrier;
mod constellation;
mod equalize;
mod error;
mod filter;
mod learned;
mod propagate;
mod receiver;
mod waveform;

pub mod metrics;
pub mod optim;
pub mod simulate;
pub mod spectral;

pub use carrier::{
    estimate_frequency_offset, CarrierBuilder, CarrierRecovery, KalmanNoise, PhaseDetector,
    PhaseTrackerState, TrackingFilter,
};
pub use constellation::{Constellation, Modulation};
pub use equalize::{
    AdaptationRule, ConstantModulus, ConvergencePhase, DecisionDirected, Decorrelation,
    Equalizer, EqualizerBuilder, EqualizerState, RadiusDirected, RuleKind, UpdateForm,
};
pub use error::{DspError, Result};
pub use filter::{centre_tap, FilterCoeff, Window};
pub use learned::LearnedBackPropagation;
pub use propagate::{
    effective_length, Direction, FiberLink, SplitStepPropagator, StepOrder, StepPolicy,
};
pub use receiver::{
    Compensation, Diagnostics, Receiver, ReceiverBuilder, ReceiverOutput, ReceiverState,
};
pub use spectral::{DispersionScan, FilterKernel, KernelDomain, SpectralFilter};
pub use waveform::{dbm_to_watts, watts_to_dbm, Sample, Waveform, POLARIZATIONS};
