//! Split-step Fourier propagation and digital back-propagation
//!
//! Light in a single-mode fiber obeys the (Manakov) nonlinear
//! Schrödinger equation. Over a short step `h` its linear and
//! nonlinear parts are nearly independent, so the split-step
//! Fourier method alternates
//!
//! 1. a **linear** step: chromatic dispersion over `h`, applied
//!    in the frequency domain by the [`SpectralFilter`]; and
//! 2. a **nonlinear** step: a power-dependent phase rotation of
//!    every sample pair,
//!
//!    ```txt
//!    φ = ξ · γ · 8/9 · (|x|² + |y|²) · h_eff
//!    h_eff = (1 - exp(-a·h)) / a
//!    ```
//!
//!    followed by the fiber loss `exp(-a·h/2)` on the field. `a`
//!    is the power attenuation, signed by the direction of
//!    travel.
//!
//! Each span ends with an amplifier which restores the span
//! loss.
//!
//! [`SplitStepPropagator::propagate()`] runs a link the way the
//! channel does; it is used to build simulated signals.
//! [`SplitStepPropagator::back_propagate()`] undoes a link at the
//! receiver (DBP): spans and steps run in reverse, with negated
//! dispersion, gain instead of loss and a negated nonlinear
//! phase.

use std::f64::consts::LN_10;

use strum_macros::{Display, EnumIter, EnumString};

use crate::error::{DspError, Result};
use crate::spectral::{dispersion_response, group_velocity_dispersion, SpectralFilter};
use crate::waveform::{dbm_to_watts, Sample, Waveform};

#[cfg(not(test))]
use log::debug;

#[cfg(test)]
use std::println as debug;

/// Polarization-averaged nonlinear coefficient
pub const MANAKOV_FACTOR: f64 = 8.0 / 9.0;

/// Fiber link parameters
///
/// A link is `spans` identical spans of `span_length` km, each
/// optionally followed by an amplifier which exactly restores
/// the span loss. The defaults describe standard single-mode
/// fiber in the C band.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct FiberLink {
    dispersion: f64,
    wavelength: f64,
    nonlinearity: f64,
    attenuation: f64,
    span_length: f64,
    spans: u32,
    amplified: bool,
}

impl FiberLink {
    /// Link of `spans` spans, `span_length` km each
    pub fn new(span_length: f64, spans: u32) -> Self {
        Self {
            dispersion: 17.0,
            wavelength: 1550.0,
            nonlinearity: 1.3,
            attenuation: 0.2,
            span_length: f64::max(span_length, 0.0),
            spans,
            amplified: true,
        }
    }

    /// Dispersion coefficient (ps/nm/km)
    pub fn with_dispersion(&mut self, dispersion: f64) -> &mut Self {
        self.dispersion = dispersion;
        self
    }

    /// Carrier wavelength (nm)
    pub fn with_wavelength(&mut self, wavelength: f64) -> &mut Self {
        self.wavelength = f64::max(wavelength, 1.0);
        self
    }

    /// Nonlinearity coefficient γ (1/W/km)
    ///
    /// Zero makes the link purely linear.
    pub fn with_nonlinearity(&mut self, gamma: f64) -> &mut Self {
        self.nonlinearity = f64::max(gamma, 0.0);
        self
    }

    /// Fiber attenuation (dB/km)
    pub fn with_attenuation(&mut self, attenuation: f64) -> &mut Self {
        self.attenuation = f64::max(attenuation, 0.0);
        self
    }

    /// Span length (km) and number of spans
    pub fn with_spans(&mut self, span_length: f64, spans: u32) -> &mut Self {
        self.span_length = f64::max(span_length, 0.0);
        self.spans = spans;
        self
    }

    /// Amplify at the end of each span
    pub fn with_amplifiers(&mut self, amplified: bool) -> &mut Self {
        self.amplified = amplified;
        self
    }

    /// Dispersion coefficient (ps/nm/km)
    pub fn dispersion(&self) -> f64 {
        self.dispersion
    }

    /// Carrier wavelength (nm)
    pub fn wavelength(&self) -> f64 {
        self.wavelength
    }

    /// Nonlinearity coefficient γ (1/W/km)
    pub fn nonlinearity(&self) -> f64 {
        self.nonlinearity
    }

    /// Fiber attenuation (dB/km)
    pub fn attenuation(&self) -> f64 {
        self.attenuation
    }

    /// Span length (km)
    pub fn span_length(&self) -> f64 {
        self.span_length
    }

    /// Number of spans
    pub fn spans(&self) -> u32 {
        self.spans
    }

    /// True if each span ends with an amplifier
    pub fn amplified(&self) -> bool {
        self.amplified
    }

    /// Total length (km)
    pub fn total_length(&self) -> f64 {
        self.span_length * self.spans as f64
    }

    /// Group-velocity dispersion β₂ (s²/m)
    pub fn beta2(&self) -> f64 {
        group_velocity_dispersion(self.dispersion, self.wavelength)
    }

    /// Nonlinearity coefficient γ (1/W/m)
    pub fn gamma_per_metre(&self) -> f64 {
        self.nonlinearity * 1.0e-3
    }

    /// Power attenuation coefficient (1/m)
    pub fn alpha_per_metre(&self) -> f64 {
        self.attenuation * LN_10 / 10.0 * 1.0e-3
    }
}

impl Default for FiberLink {
    fn default() -> Self {
        Self::new(80.0, 1)
    }
}

/// How spans are divided into steps
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub enum StepPolicy {
    /// A fixed number of uniform steps per span
    PerSpan(u32),

    /// The fewest uniform steps no longer than the given length (km)
    MaxStepLength(f64),
}

impl StepPolicy {
    /// Number of steps for a span of `span_length` km
    ///
    /// Fails with [`DspError::InvalidStepCount`] if the policy
    /// yields no steps.
    pub fn steps_per_span(&self, span_length: f64) -> Result<usize> {
        match *self {
            StepPolicy::PerSpan(0) => Err(DspError::InvalidStepCount),
            StepPolicy::PerSpan(n) => Ok(n as usize),
            StepPolicy::MaxStepLength(max) if max.is_finite() && max > 0.0 => {
                Ok(usize::max(1, (span_length / max).ceil() as usize))
            }
            StepPolicy::MaxStepLength(_) => Err(DspError::InvalidStepCount),
        }
    }
}

impl Default for StepPolicy {
    fn default() -> Self {
        StepPolicy::PerSpan(1)
    }
}

/// Ordering of the linear and nonlinear sub-steps
///
/// Orders describe forward propagation. Back-propagation runs
/// the same sub-steps in reverse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum StepOrder {
    /// Dispersion over `h`, then nonlinearity over `h`
    LinearFirst,

    /// Nonlinearity over `h`, then dispersion over `h`
    NonlinearFirst,

    /// Dispersion over `h/2`, nonlinearity over `h`, dispersion over `h/2`
    Symmetric,
}

impl Default for StepOrder {
    fn default() -> Self {
        StepOrder::Symmetric
    }
}

/// Direction of travel through a link
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    /// As the channel does
    Forward,

    /// Undoing the channel (digital back-propagation)
    Backward,
}

impl Direction {
    #[inline]
    fn sign(&self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Backward => -1.0,
        }
    }
}

// One sub-step, in forward order
#[derive(Clone, Copy, Debug, PartialEq)]
enum SubStep {
    // dispersion over the given length (m)
    Linear(f64),

    // nonlinear phase and loss over the given length (m)
    Nonlinear(f64),
}

/// Split-step Fourier propagator over a [`FiberLink`]
///
/// Configure with the `with_*` setters, then call
/// [`propagate()`](SplitStepPropagator::propagate) or
/// [`back_propagate()`](SplitStepPropagator::back_propagate).
/// Both are pure: all working state is local to the call.
#[derive(Clone, Debug)]
pub struct SplitStepPropagator {
    link: FiberLink,
    policy: StepPolicy,
    order: StepOrder,
    nonlinear_scale: f64,
    launch_power: Option<f64>,
    filter: SpectralFilter,
}

impl SplitStepPropagator {
    /// Propagator for `link`, one symmetric step per span
    pub fn new(link: FiberLink) -> Self {
        Self {
            link,
            policy: StepPolicy::default(),
            order: StepOrder::default(),
            nonlinear_scale: 1.0,
            launch_power: None,
            filter: SpectralFilter::new(),
        }
    }

    /// Step policy
    ///
    /// Policies which yield zero steps are accepted here and
    /// rejected when propagating.
    pub fn with_steps(&mut self, policy: StepPolicy) -> &mut Self {
        self.policy = policy;
        self
    }

    /// Sub-step ordering
    pub fn with_order(&mut self, order: StepOrder) -> &mut Self {
        self.order = order;
        self
    }

    /// Nonlinear phase scaling ξ for back-propagation
    ///
    /// Values below 1.0 are commonly used to account for
    /// amplifier noise and imperfect link knowledge. Forward
    /// propagation always uses ξ = 1.
    pub fn with_nonlinear_scale(&mut self, xi: f64) -> &mut Self {
        self.nonlinear_scale = f64::clamp(xi, 0.0, 2.0);
        self
    }

    /// Launch power (dBm)
    ///
    /// When set, the waveform is rescaled to this mean total
    /// power before propagating, and the original scale is
    /// restored afterward. When unset, samples are taken to be
    /// in units of √W.
    pub fn with_launch_power(&mut self, dbm: Option<f64>) -> &mut Self {
        self.launch_power = dbm;
        self
    }

    /// Fiber link
    pub fn link(&self) -> &FiberLink {
        &self.link
    }

    /// Step policy
    pub fn steps(&self) -> StepPolicy {
        self.policy
    }

    /// Sub-step ordering
    pub fn order(&self) -> StepOrder {
        self.order
    }

    /// Nonlinear phase scaling ξ
    pub fn nonlinear_scale(&self) -> f64 {
        self.nonlinear_scale
    }

    /// Launch power (dBm), if any
    pub fn launch_power(&self) -> Option<f64> {
        self.launch_power
    }

    /// Propagate through the link, as the channel does
    pub fn propagate(&self, wf: &Waveform) -> Result<Waveform> {
        self.run(wf, Direction::Forward)
    }

    /// Undo the link (digital back-propagation)
    pub fn back_propagate(&self, wf: &Waveform) -> Result<Waveform> {
        self.run(wf, Direction::Backward)
    }

    /// Propagate in the given direction
    ///
    /// Fails with [`DspError::InvalidStepCount`] if the step
    /// policy yields no steps.
    pub fn run(&self, wf: &Waveform, direction: Direction) -> Result<Waveform> {
        let steps = self.policy.steps_per_span(self.link.span_length)?;
        let plan = step_plan(self.order, steps, self.link.span_length * 1.0e3);
        let xi = match direction {
            Direction::Forward => 1.0,
            Direction::Backward => self.nonlinear_scale,
        };

        debug!(
            "split-step: {} {} spans × {} {} steps of {:.3} km",
            direction,
            self.link.spans,
            steps,
            self.order,
            self.link.span_length / steps as f64
        );

        let scale = launch_scale(wf, self.launch_power);
        let mut out = if scale != 1.0 {
            wf.scaled(scale)
        } else {
            wf.clone()
        };
        if out.is_empty() {
            return Ok(wf.clone());
        }

        let span_gain = (0.5 * self.link.alpha_per_metre() * self.link.span_length * 1.0e3).exp();
        for _span in 0..self.link.spans {
            match direction {
                Direction::Forward => {
                    for sub in plan.iter() {
                        out = self.sub_step(&out, *sub, direction, xi)?;
                    }
                    if self.link.amplified {
                        out = out.scaled(span_gain);
                    }
                }
                Direction::Backward => {
                    if self.link.amplified {
                        out = out.scaled(1.0 / span_gain);
                    }
                    for sub in plan.iter().rev() {
                        out = self.sub_step(&out, *sub, direction, xi)?;
                    }
                }
            }
        }

        if scale != 1.0 {
            out = out.scaled(1.0 / scale);
        }
        Ok(out)
    }

    // Apply one sub-step in the given direction
    fn sub_step(
        &self,
        wf: &Waveform,
        sub: SubStep,
        direction: Direction,
        xi: f64,
    ) -> Result<Waveform> {
        let sign = direction.sign();
        match sub {
            SubStep::Linear(len) => {
                let response =
                    dispersion_response(wf.len(), wf.sample_rate(), self.link.beta2(), sign * len);
                self.filter.apply_response(wf, &response)
            }
            SubStep::Nonlinear(len) => {
                let a = sign * self.link.alpha_per_metre();
                let coeff = sign
                    * xi
                    * self.link.gamma_per_metre()
                    * MANAKOV_FACTOR
                    * effective_length(a, len);
                let loss = (-0.5 * a * len).exp();
                Ok(nonlinear_phase(wf, coeff, loss))
            }
        }
    }
}

/// Effective nonlinear length of a step
///
/// `(1 - exp(-a·h)) / a` for a signed power attenuation `a`
/// (1/m) and step length `h` (m). Tends to `h` as `a → 0`.
pub fn effective_length(a: f64, h: f64) -> f64 {
    if (a * h).abs() < 1.0e-12 {
        h
    } else {
        -(-a * h).exp_m1() / a
    }
}

// Rotate each sample pair by `coeff · (|x|² + |y|²)`, then scale by `gain`
fn nonlinear_phase(wf: &Waveform, coeff: f64, gain: f64) -> Waveform {
    wf.map_pairs(|[x, y]| {
        let rot = Sample::from_polar(gain, coeff * (x.norm_sqr() + y.norm_sqr()));
        [x * rot, y * rot]
    })
}

// Gain which brings `wf` to the launch power
pub(crate) fn launch_scale(wf: &Waveform, launch_power: Option<f64>) -> f64 {
    match launch_power {
        Some(dbm) => {
            let pwr = wf.total_power();
            if pwr > 0.0 {
                (dbm_to_watts(dbm) / pwr).sqrt()
            } else {
                1.0
            }
        }
        None => 1.0,
    }
}

// Forward-order sub-steps of one span of `span` metres
fn step_plan(order: StepOrder, steps: usize, span: f64) -> Vec<SubStep> {
    let h = span / steps as f64;
    let mut plan = Vec::with_capacity(3 * steps);
    for _ in 0..steps {
        match order {
            StepOrder::LinearFirst => {
                plan.push(SubStep::Linear(h));
                plan.push(SubStep::Nonlinear(h));
            }
            StepOrder::NonlinearFirst => {
                plan.push(SubStep::Nonlinear(h));
                plan.push(SubStep::Linear(h));
            }
            StepOrder::Symmetric => {
                plan.push(SubStep::Linear(0.5 * h));
                plan.push(SubStep::Nonlinear(h));
                plan.push(SubStep::Linear(0.5 * h));
            }
        }
    }
    plan
}
