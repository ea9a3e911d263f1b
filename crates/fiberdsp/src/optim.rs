//! Gradient-based tuning of DSP parameters
//!
//! Every stage in this crate is a pure function of its
//! parameters, its state and its input. An outer loop can
//! therefore tune any real parameter vector by gradient descent:
//!
//! ```
//! use fiberdsp::optim::{numeric_gradient, Adam, Optimizer, Schedule};
//!
//! let loss = |p: &[f64]| (p[0] - 3.0).powi(2) + (p[1] + 1.0).powi(2);
//! let adam = Adam::new(Schedule::Constant(0.1));
//! let mut state = adam.init(&[0.0, 0.0]);
//! for step in 0..500 {
//!     let grad = numeric_gradient(loss, adam.params(&state), 1.0e-6);
//!     state = adam.update(step, &grad, state).unwrap();
//! }
//! assert!((adam.params(&state)[0] - 3.0).abs() < 1.0e-2);
//! ```
//!
//! Besides [`Sgd`], [`Momentum`] and [`Adam`] there are
//! [`Nesterov`], [`Adagrad`], [`RmsProp`] and [`Adamax`]. Large
//! gradients early in training can be tamed with
//! [`clip_grads()`].
//!
//! Complex parameters, such as FIR taps, are optimized as
//! interleaved real and imaginary parts; see
//! [`pack_complex()`] and [`unpack_complex()`]. For a real loss
//! `J(w)`, descending along the packed real gradient is the same
//! as the complex update `w ← w − μ · conj(∂J/∂w)` with the
//! Wirtinger derivative `∂J/∂w`.

use nalgebra::DVector;

use crate::error::{DspError, Result};
use crate::waveform::Sample;

/// Interleave complex values as `re, im` pairs
pub fn pack_complex(values: &[Sample]) -> Vec<f64> {
    values.iter().flat_map(|v| [v.re, v.im]).collect()
}

/// Inverse of [`pack_complex()`]
///
/// Fails with [`DspError::ShapeMismatch`] if `packed` has an
/// odd length.
pub fn unpack_complex(packed: &[f64]) -> Result<Vec<Sample>> {
    if packed.len() % 2 != 0 {
        return Err(DspError::shape(
            "packed complex length (rounded to even)",
            packed.len() + 1,
            packed.len(),
        ));
    }
    Ok(packed
        .chunks_exact(2)
        .map(|pair| Sample::new(pair[0], pair[1]))
        .collect())
}

/// Central-difference gradient of a real function
///
/// ```txt
/// ∂f/∂xᵢ ≈ (f(x + h·eᵢ) − f(x − h·eᵢ)) / 2h
/// ```
///
/// Costs `2·x.len()` evaluations of `f`.
pub fn numeric_gradient<F>(mut f: F, x: &[f64], h: f64) -> Vec<f64>
where
    F: FnMut(&[f64]) -> f64,
{
    let mut shifted = x.to_vec();
    let mut grad = Vec::with_capacity(x.len());
    for i in 0..x.len() {
        let orig = shifted[i];
        shifted[i] = orig + h;
        let up = f(&shifted);
        shifted[i] = orig - h;
        let down = f(&shifted);
        shifted[i] = orig;
        grad.push((up - down) / (2.0 * h));
    }
    grad
}

/// Rescale `grad` so its L2 norm is at most `max_norm`
///
/// Gradients already inside the ball are returned unchanged.
pub fn clip_grads(grad: &[f64], max_norm: f64) -> Vec<f64> {
    let norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
    let max_norm = f64::max(max_norm, 0.0);
    if norm >= max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        grad.iter().map(|g| g * scale).collect()
    } else {
        grad.to_vec()
    }
}

/// Learning rate as a function of the step number
#[derive(Clone, Debug, PartialEq)]
pub enum Schedule {
    /// The same rate forever
    Constant(f64),

    /// `values[k]`, where `k` counts the boundaries below the step
    Piecewise {
        /// Ascending step numbers at which the rate changes
        boundaries: Vec<usize>,
        /// One more value than there are boundaries
        values: Vec<f64>,
    },

    /// `initial · rate^(step / decay_steps)`
    ExponentialDecay {
        /// Rate at step zero
        initial: f64,
        /// Steps per decay period
        decay_steps: f64,
        /// Decay factor per period
        decay_rate: f64,
    },

    /// `initial / (1 + rate · step / decay_steps)`
    InverseTimeDecay {
        /// Rate at step zero
        initial: f64,
        /// Steps per decay period
        decay_steps: f64,
        /// Decay factor per period
        decay_rate: f64,
    },
}

impl Schedule {
    /// Piecewise-constant schedule
    ///
    /// Fails with [`DspError::InvalidParameter`] unless there is
    /// exactly one more value than boundaries.
    pub fn piecewise(boundaries: Vec<usize>, values: Vec<f64>) -> Result<Self> {
        if values.len() != boundaries.len() + 1 {
            return Err(DspError::InvalidParameter(
                "piecewise schedule needs one more value than boundaries",
            ));
        }
        Ok(Schedule::Piecewise { boundaries, values })
    }

    /// Learning rate at `step`
    pub fn rate(&self, step: usize) -> f64 {
        match self {
            Schedule::Constant(rate) => *rate,
            Schedule::Piecewise { boundaries, values } => {
                let ind = boundaries.iter().filter(|b| step > **b).count();
                values.get(ind).copied().unwrap_or(0.0)
            }
            Schedule::ExponentialDecay {
                initial,
                decay_steps,
                decay_rate,
            } => initial * decay_rate.powf(step as f64 / decay_steps),
            Schedule::InverseTimeDecay {
                initial,
                decay_steps,
                decay_rate,
            } => initial / (1.0 + decay_rate * step as f64 / decay_steps),
        }
    }
}

/// A pure first-order optimizer
///
/// The optimizer itself is configuration only. All evolving
/// quantities live in [`Optimizer::State`], which `update`
/// consumes and returns.
pub trait Optimizer {
    /// Parameters and any auxiliary moments
    type State: Clone + std::fmt::Debug;

    /// Initial state for starting parameters `params`
    fn init(&self, params: &[f64]) -> Self::State;

    /// Take step number `step` along gradient `grad`
    ///
    /// Fails with [`DspError::ShapeMismatch`] if `grad` has a
    /// different length than the parameters.
    fn update(&self, step: usize, grad: &[f64], state: Self::State) -> Result<Self::State>;

    /// Current parameters
    fn params<'a>(&self, state: &'a Self::State) -> &'a [f64];
}

/// Plain stochastic gradient descent
#[derive(Clone, Debug, PartialEq)]
pub struct Sgd {
    schedule: Schedule,
}

/// State of [`Sgd`]
#[derive(Clone, Debug, PartialEq)]
pub struct SgdState {
    params: DVector<f64>,
}

impl Sgd {
    /// Descend with the given learning rate schedule
    pub fn new(schedule: Schedule) -> Self {
        Self { schedule }
    }
}

impl Optimizer for Sgd {
    type State = SgdState;

    fn init(&self, params: &[f64]) -> SgdState {
        SgdState {
            params: DVector::from_column_slice(params),
        }
    }

    fn update(&self, step: usize, grad: &[f64], mut state: SgdState) -> Result<SgdState> {
        let grad = gradient_vector(grad, state.params.len())?;
        state.params.axpy(-self.schedule.rate(step), &grad, 1.0);
        Ok(state)
    }

    fn params<'a>(&self, state: &'a SgdState) -> &'a [f64] {
        state.params.as_slice()
    }
}

/// Gradient descent with momentum
#[derive(Clone, Debug, PartialEq)]
pub struct Momentum {
    schedule: Schedule,
    mass: f64,
}

/// State of [`Momentum`]
#[derive(Clone, Debug, PartialEq)]
pub struct MomentumState {
    params: DVector<f64>,
    velocity: DVector<f64>,
}

impl Momentum {
    /// Descend with momentum `mass` (commonly 0.9)
    pub fn new(schedule: Schedule, mass: f64) -> Self {
        Self {
            schedule,
            mass: f64::clamp(mass, 0.0, 1.0),
        }
    }
}

impl Optimizer for Momentum {
    type State = MomentumState;

    fn init(&self, params: &[f64]) -> MomentumState {
        MomentumState {
            params: DVector::from_column_slice(params),
            velocity: DVector::zeros(params.len()),
        }
    }

    fn update(&self, step: usize, grad: &[f64], mut state: MomentumState) -> Result<MomentumState> {
        let grad = gradient_vector(grad, state.params.len())?;
        state.velocity = &state.velocity * self.mass + grad;
        state
            .params
            .axpy(-self.schedule.rate(step), &state.velocity, 1.0);
        Ok(state)
    }

    fn params<'a>(&self, state: &'a MomentumState) -> &'a [f64] {
        state.params.as_slice()
    }
}

/// Adam: adaptive moment estimation
#[derive(Clone, Debug, PartialEq)]
pub struct Adam {
    schedule: Schedule,
    b1: f64,
    b2: f64,
    eps: f64,
}

/// State of [`Adam`]
#[derive(Clone, Debug, PartialEq)]
pub struct AdamState {
    params: DVector<f64>,
    m: DVector<f64>,
    v: DVector<f64>,
}

impl Adam {
    /// Adam with the customary moment decay rates
    pub fn new(schedule: Schedule) -> Self {
        Self::with_moments(schedule, 0.9, 0.999, 1.0e-8)
    }

    /// Adam with explicit decay rates `b1`, `b2` and epsilon
    pub fn with_moments(schedule: Schedule, b1: f64, b2: f64, eps: f64) -> Self {
        Self {
            schedule,
            b1: f64::clamp(b1, 0.0, 0.999_999),
            b2: f64::clamp(b2, 0.0, 0.999_999),
            eps: f64::max(eps, 0.0),
        }
    }
}

impl Optimizer for Adam {
    type State = AdamState;

    fn init(&self, params: &[f64]) -> AdamState {
        AdamState {
            params: DVector::from_column_slice(params),
            m: DVector::zeros(params.len()),
            v: DVector::zeros(params.len()),
        }
    }

    fn update(&self, step: usize, grad: &[f64], mut state: AdamState) -> Result<AdamState> {
        let grad = gradient_vector(grad, state.params.len())?;
        state.m = &state.m * self.b1 + &grad * (1.0 - self.b1);
        state.v = &state.v * self.b2 + grad.component_mul(&grad) * (1.0 - self.b2);

        let t = step as i32 + 1;
        let mcorr = 1.0 / (1.0 - self.b1.powi(t));
        let vcorr = 1.0 / (1.0 - self.b2.powi(t));
        let rate = self.schedule.rate(step);
        for ((p, m), v) in state
            .params
            .iter_mut()
            .zip(state.m.iter())
            .zip(state.v.iter())
        {
            *p -= rate * (m * mcorr) / ((v * vcorr).sqrt() + self.eps);
        }
        Ok(state)
    }

    fn params<'a>(&self, state: &'a AdamState) -> &'a [f64] {
        state.params.as_slice()
    }
}

/// Nesterov accelerated gradient
///
/// Like [`Momentum`], but takes the gradient step from the
/// look-ahead point.
#[derive(Clone, Debug, PartialEq)]
pub struct Nesterov {
    schedule: Schedule,
    mass: f64,
}

impl Nesterov {
    /// Descend with momentum `mass` (commonly 0.9)
    pub fn new(schedule: Schedule, mass: f64) -> Self {
        Self {
            schedule,
            mass: f64::clamp(mass, 0.0, 1.0),
        }
    }
}

impl Optimizer for Nesterov {
    type State = MomentumState;

    fn init(&self, params: &[f64]) -> MomentumState {
        MomentumState {
            params: DVector::from_column_slice(params),
            velocity: DVector::zeros(params.len()),
        }
    }

    fn update(&self, step: usize, grad: &[f64], mut state: MomentumState) -> Result<MomentumState> {
        let grad = gradient_vector(grad, state.params.len())?;
        state.velocity = &state.velocity * self.mass + &grad;
        let look_ahead = &state.velocity * self.mass + grad;
        state.params.axpy(-self.schedule.rate(step), &look_ahead, 1.0);
        Ok(state)
    }

    fn params<'a>(&self, state: &'a MomentumState) -> &'a [f64] {
        state.params.as_slice()
    }
}

/// Adagrad with momentum
///
/// Each coordinate is scaled by the root of its summed squared
/// gradients, so steps shrink as evidence accumulates.
#[derive(Clone, Debug, PartialEq)]
pub struct Adagrad {
    schedule: Schedule,
    momentum: f64,
}

/// State of [`Adagrad`]
#[derive(Clone, Debug, PartialEq)]
pub struct AdagradState {
    params: DVector<f64>,
    sum_sq: DVector<f64>,
    m: DVector<f64>,
}

impl Adagrad {
    /// Adagrad with momentum `momentum` (commonly 0.9)
    pub fn new(schedule: Schedule, momentum: f64) -> Self {
        Self {
            schedule,
            momentum: f64::clamp(momentum, 0.0, 1.0),
        }
    }
}

impl Optimizer for Adagrad {
    type State = AdagradState;

    fn init(&self, params: &[f64]) -> AdagradState {
        AdagradState {
            params: DVector::from_column_slice(params),
            sum_sq: DVector::zeros(params.len()),
            m: DVector::zeros(params.len()),
        }
    }

    fn update(&self, step: usize, grad: &[f64], mut state: AdagradState) -> Result<AdagradState> {
        let grad = gradient_vector(grad, state.params.len())?;
        state.sum_sq += grad.component_mul(&grad);

        let rate = self.schedule.rate(step);
        for (((p, m), g), sq) in state
            .params
            .iter_mut()
            .zip(state.m.iter_mut())
            .zip(grad.iter())
            .zip(state.sum_sq.iter())
        {
            let scaled = if *sq > 0.0 { g / sq.sqrt() } else { 0.0 };
            *m = (1.0 - self.momentum) * scaled + self.momentum * *m;
            *p -= rate * *m;
        }
        Ok(state)
    }

    fn params<'a>(&self, state: &'a AdagradState) -> &'a [f64] {
        state.params.as_slice()
    }
}

/// RMSprop: divide by a running root-mean-square gradient
#[derive(Clone, Debug, PartialEq)]
pub struct RmsProp {
    schedule: Schedule,
    gamma: f64,
    eps: f64,
}

/// State of [`RmsProp`]
#[derive(Clone, Debug, PartialEq)]
pub struct RmsPropState {
    params: DVector<f64>,
    avg_sq: DVector<f64>,
}

impl RmsProp {
    /// RMSprop with decay `gamma` 0.9 and epsilon `1e-8`
    pub fn new(schedule: Schedule) -> Self {
        Self::with_decay(schedule, 0.9, 1.0e-8)
    }

    /// RMSprop with explicit decay `gamma` and epsilon
    pub fn with_decay(schedule: Schedule, gamma: f64, eps: f64) -> Self {
        Self {
            schedule,
            gamma: f64::clamp(gamma, 0.0, 0.999_999),
            eps: f64::max(eps, 0.0),
        }
    }
}

impl Optimizer for RmsProp {
    type State = RmsPropState;

    fn init(&self, params: &[f64]) -> RmsPropState {
        RmsPropState {
            params: DVector::from_column_slice(params),
            avg_sq: DVector::zeros(params.len()),
        }
    }

    fn update(&self, step: usize, grad: &[f64], mut state: RmsPropState) -> Result<RmsPropState> {
        let grad = gradient_vector(grad, state.params.len())?;
        state.avg_sq = &state.avg_sq * self.gamma + grad.component_mul(&grad) * (1.0 - self.gamma);

        let rate = self.schedule.rate(step);
        for ((p, g), avg) in state
            .params
            .iter_mut()
            .zip(grad.iter())
            .zip(state.avg_sq.iter())
        {
            *p -= rate * g / (avg + self.eps).sqrt();
        }
        Ok(state)
    }

    fn params<'a>(&self, state: &'a RmsPropState) -> &'a [f64] {
        state.params.as_slice()
    }
}

/// Adamax: [`Adam`] with an infinity-norm second moment
#[derive(Clone, Debug, PartialEq)]
pub struct Adamax {
    schedule: Schedule,
    b1: f64,
    b2: f64,
    eps: f64,
}

/// State of [`Adamax`]
#[derive(Clone, Debug, PartialEq)]
pub struct AdamaxState {
    params: DVector<f64>,
    m: DVector<f64>,
    u: DVector<f64>,
}

impl Adamax {
    /// Adamax with the customary decay rates
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            b1: 0.9,
            b2: 0.999,
            eps: 1.0e-8,
        }
    }
}

impl Optimizer for Adamax {
    type State = AdamaxState;

    fn init(&self, params: &[f64]) -> AdamaxState {
        AdamaxState {
            params: DVector::from_column_slice(params),
            m: DVector::zeros(params.len()),
            u: DVector::zeros(params.len()),
        }
    }

    fn update(&self, step: usize, grad: &[f64], mut state: AdamaxState) -> Result<AdamaxState> {
        let grad = gradient_vector(grad, state.params.len())?;
        state.m = &state.m * self.b1 + &grad * (1.0 - self.b1);
        for (u, g) in state.u.iter_mut().zip(grad.iter()) {
            *u = f64::max(self.b2 * *u, g.abs());
        }

        let rate = self.schedule.rate(step) / (1.0 - self.b1.powi(step as i32 + 1));
        for ((p, m), u) in state
            .params
            .iter_mut()
            .zip(state.m.iter())
            .zip(state.u.iter())
        {
            *p -= rate * m / (u + self.eps);
        }
        Ok(state)
    }

    fn params<'a>(&self, state: &'a AdamaxState) -> &'a [f64] {
        state.params.as_slice()
    }
}

fn gradient_vector(grad: &[f64], expect: usize) -> Result<DVector<f64>> {
    if grad.len() != expect {
        return Err(DspError::shape("gradient length", expect, grad.len()));
    }
    Ok(DVector::from_column_slice(grad))
}
