//! Adaptive 2×2 MIMO equalizer
//!
//! After dispersion compensation, the two received polarizations
//! are still an unknown, slowly-varying mixture of the two
//! transmitted ones, smeared by residual inter-symbol
//! interference. The equalizer undoes this with four FIR filters
//!
//! ```txt
//! y_x = h_xx ⊛ u_x + h_xy ⊛ u_y
//! y_y = h_yx ⊛ u_x + h_yy ⊛ u_y
//! ```
//!
//! fed at the oversampled input rate and evaluated once per
//! symbol. After each output the taps take a stochastic gradient
//! step on a per-symbol cost `J`,
//!
//! ```txt
//! h_pq ← h_pq − μ · e_p · conj(u_q)        e_p = ∂J/∂y_p*
//! ```
//!
//! The cost is supplied by an [`AdaptationRule`]:
//!
//! * [`ConstantModulus`] (CMA): `J = (|y|² − R₂)²`, blind
//! * [`RadiusDirected`] (RDE): CMA against the nearest ring
//!   radius, blind, for multi-ring constellations
//! * [`DecisionDirected`] (DD-LMS): `J = |y − d|²` against the
//!   nearest constellation point, or against known training
//!   symbols when supplied
//!
//! and [`UpdateForm`] selects a plain, normalized (NLMS) or
//! sign-error step.
//!
//! Blind CMA has a singular solution in which both outputs lock
//! onto the same transmitted polarization while the cost stays
//! near zero.
//! [`RuleKind::Mucma`] selects multi-user CMA, which adds the
//! cross-correlation penalty
//!
//! ```txt
//! J_mu = 2 · Σ_{p≠q} Σ_d |E[y_p(k) · conj(y_q(k − d))]|²
//! ```
//!
//! over the last few output lags, and a guard which rebuilds
//! the `y` filters as the orthogonal complement of the `x`
//! filters if the outputs lock together anyway. See
//! [`Decorrelation`].
//!
//! The equalizer is a pure state transition. All evolving
//! quantities (taps, sample history, cost statistics) live in
//! the [`EqualizerState`], which [`Equalizer::step()`] consumes
//! and returns along with the output symbols.
//!
//! Outputs are aligned with the input: output symbol `k`
//! corresponds to the input sample at `k · sps`. Streaming across
//! calls is seamless. Call [`Equalizer::flush()`] at the end of a
//! stream to obtain the last few symbols.

use std::fmt;
use std::sync::Arc;

use strum_macros::{Display, EnumIter, EnumString};

use crate::constellation::Constellation;
use crate::error::{DspError, Result};
use crate::filter::{centre_tap, FilterCoeff, Window};
use crate::waveform::{Sample, Waveform, POLARIZATIONS};

#[cfg(not(test))]
use log::{debug, warn};

#[cfg(test)]
use std::{println as debug, println as warn};

/// A per-symbol equalizer cost
///
/// Implementations return the error term `e = ∂J/∂y*` (up to a
/// constant factor) and the cost `J` for one equalizer output
/// `y`. If the caller supplied a training symbol, it is passed
/// as `reference`; rules may use or ignore it.
pub trait AdaptationRule: fmt::Debug + Send + Sync {
    /// Error term and cost for output `y`
    fn error(&self, y: Sample, reference: Option<Sample>) -> (Sample, f64);
}

/// Constant modulus algorithm
///
/// Drives `|y|²` toward `R₂ = E|c|⁴ / E|c|²`. Ignores training
/// symbols.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstantModulus {
    r2: f64,
}

impl ConstantModulus {
    /// CMA with an explicit radius `R₂`
    pub fn new(r2: f64) -> Self {
        Self { r2 }
    }

    /// CMA with the radius of `constellation`
    pub fn for_constellation(constellation: &Constellation) -> Self {
        Self::new(constellation.cma_radius())
    }

    /// Target radius `R₂`
    pub fn r2(&self) -> f64 {
        self.r2
    }
}

impl AdaptationRule for ConstantModulus {
    fn error(&self, y: Sample, _reference: Option<Sample>) -> (Sample, f64) {
        let dev = y.norm_sqr() - self.r2;
        (y * dev, dev * dev)
    }
}

/// Radius-directed equalization
///
/// CMA against the constellation ring nearest to `|y|`, or the
/// modulus of the training symbol when one is supplied.
#[derive(Clone, Debug, PartialEq)]
pub struct RadiusDirected {
    constellation: Constellation,
}

impl RadiusDirected {
    /// Fails with [`DspError::EmptyConstellation`] if `points`
    /// is empty.
    pub fn new(points: &[Sample]) -> Result<Self> {
        Ok(Self {
            constellation: Constellation::new(points.to_vec())?,
        })
    }
}

impl AdaptationRule for RadiusDirected {
    fn error(&self, y: Sample, reference: Option<Sample>) -> (Sample, f64) {
        let radius = match reference {
            Some(r) => r.norm(),
            None => self.constellation.nearest_radius(y.norm()),
        };
        let dev = y.norm_sqr() - radius * radius;
        (y * dev, dev * dev)
    }
}

/// Decision-directed least mean squares
///
/// Error against the training symbol, if supplied, or else the
/// nearest constellation point.
#[derive(Clone, Debug, PartialEq)]
pub struct DecisionDirected {
    constellation: Constellation,
}

impl DecisionDirected {
    /// Fails with [`DspError::EmptyConstellation`] if `points`
    /// is empty.
    pub fn new(points: &[Sample]) -> Result<Self> {
        Ok(Self {
            constellation: Constellation::new(points.to_vec())?,
        })
    }
}

impl AdaptationRule for DecisionDirected {
    fn error(&self, y: Sample, reference: Option<Sample>) -> (Sample, f64) {
        let d = reference.unwrap_or_else(|| self.constellation.decide(y));
        let e = y - d;
        (e, e.norm_sqr())
    }
}

/// Built-in adaptation rules, by name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum RuleKind {
    /// [`ConstantModulus`]
    Cma,

    /// [`RadiusDirected`]
    Rde,

    /// [`DecisionDirected`]
    Dd,

    /// [`ConstantModulus`] with output [`Decorrelation`]
    Mucma,
}

impl RuleKind {
    /// Build the rule for a constellation
    ///
    /// CMA and MU-CMA accept an empty constellation and use
    /// `R₂ = 1`. The other rules fail with
    /// [`DspError::EmptyConstellation`]. The decorrelation half of
    /// MU-CMA lives in the [`Equalizer`] itself.
    pub fn build(&self, points: &[Sample]) -> Result<Arc<dyn AdaptationRule>> {
        Ok(match self {
            RuleKind::Cma | RuleKind::Mucma => match Constellation::new(points.to_vec()) {
                Ok(c) => Arc::new(ConstantModulus::for_constellation(&c)),
                Err(_) => Arc::new(ConstantModulus::new(1.0)),
            },
            RuleKind::Rde => Arc::new(RadiusDirected::new(points)?),
            RuleKind::Dd => Arc::new(DecisionDirected::new(points)?),
        })
    }
}

/// Form of the tap update
#[derive(Clone, Copy, Debug, PartialEq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum UpdateForm {
    /// `h ← h − μ · e · conj(u)`
    Gradient,

    /// NLMS: `μ` is divided by `regularization + ‖u‖²`
    Normalized {
        /// Keeps the step bounded for weak inputs
        regularization: f64,
    },

    /// `e` is replaced by its complex sign `e / |e|`
    Sign,
}

impl Default for UpdateForm {
    fn default() -> Self {
        UpdateForm::Gradient
    }
}

/// Output decorrelation for multi-user CMA
///
/// The equalizer keeps an exponential moving average of the
/// output cross-correlation `r_pq(d) = E[y_p(k) · conj(y_q(k − d))]`
/// for lags `0..delays` and adds its gradient to the error of
/// each output, pushing the two outputs apart.
///
/// If the normalized cross-correlation at any lag still exceeds
/// `reset_above`, the outputs have locked onto the same
/// polarization. The `y` filters are then replaced by the
/// orthogonal complement of the `x` filters,
///
/// ```txt
/// h_yx[k] = −conj(h_xy[L − 1 − k])
/// h_yy[k] =  conj(h_xx[L − 1 − k])
/// ```
///
/// which separates the outputs for any unitary channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decorrelation {
    delays: usize,
    smoothing: f64,
    reset_above: f64,
    holdoff: u64,
}

impl Decorrelation {
    /// Decorrelate over `delays` output lags with averaging factor `smoothing`
    ///
    /// `smoothing` is the weight `β` of the old average, in
    /// `[0.5, 1)`.
    pub fn new(delays: usize, smoothing: f64) -> Self {
        Self {
            delays: usize::max(delays, 1),
            smoothing: f64::clamp(smoothing, 0.5, 0.999_999),
            ..Self::default()
        }
    }

    /// Normalized correlation that triggers the singularity guard
    ///
    /// Values of 1.0 or more disable the guard.
    pub fn with_reset_above(mut self, threshold: f64) -> Self {
        self.reset_above = f64::max(threshold, 0.0);
        self
    }

    /// Updates to wait before the guard may fire, and between firings
    pub fn with_holdoff(mut self, updates: u64) -> Self {
        self.holdoff = updates;
        self
    }

    /// Output lags
    pub fn delays(&self) -> usize {
        self.delays
    }

    /// Averaging factor `β`
    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    /// Guard threshold on the normalized correlation
    pub fn reset_above(&self) -> f64 {
        self.reset_above
    }
}

impl Default for Decorrelation {
    fn default() -> Self {
        Self {
            delays: 6,
            smoothing: 0.999,
            reset_above: 0.8,
            holdoff: 200,
        }
    }
}

// Running output statistics for multi-user CMA
#[derive(Clone, Debug, PartialEq)]
struct CrossCorrelation {
    // recent outputs, newest last
    outputs: [Window<Sample>; POLARIZATIONS],

    // corr[p][q][d] ≈ E[y_p(k) · conj(y_q(k − d))], p ≠ q
    corr: [[Vec<Sample>; POLARIZATIONS]; POLARIZATIONS],

    // per-output power E|y|²
    power: [f64; POLARIZATIONS],

    // β^n, for bias correction
    beta_pow: f64,

    // updates since the statistics were last cleared
    updates: u64,

    // largest normalized |r_pq(d)| at the last update
    peak: f64,
}

impl CrossCorrelation {
    fn new(cfg: &Decorrelation) -> Self {
        let zeros = vec![Sample::new(0.0, 0.0); cfg.delays];
        Self {
            outputs: [Window::new(cfg.delays), Window::new(cfg.delays)],
            corr: [
                [zeros.clone(), zeros.clone()],
                [zeros.clone(), zeros],
            ],
            power: [0.0; POLARIZATIONS],
            beta_pow: cfg.smoothing,
            updates: 0,
            peak: 0.0,
        }
    }

    // Fold in the newest outputs
    //
    // Returns the extra error term for each output and the
    // penalty cost `J_mu`.
    fn update(
        &mut self,
        out: [Sample; POLARIZATIONS],
        beta: f64,
    ) -> ([Sample; POLARIZATIONS], f64) {
        for (w, y) in self.outputs.iter_mut().zip(out.iter()) {
            w.push_scalar(*y);
        }
        let correction = 1.0 / (1.0 - self.beta_pow);
        for (pwr, y) in self.power.iter_mut().zip(out.iter()) {
            *pwr = beta * *pwr + (1.0 - beta) * y.norm_sqr();
        }
        let power = self.power.map(|p| p * correction);

        let mut err = [Sample::new(0.0, 0.0); POLARIZATIONS];
        let mut penalty = 0.0f64;
        let mut peak = 0.0f64;
        for p in 0..POLARIZATIONS {
            for q in 0..POLARIZATIONS {
                if p == q {
                    continue;
                }
                let norm = (power[p] * power[q]).sqrt();
                let past = self.outputs[q].iter().rev();
                for (r, yq) in self.corr[p][q].iter_mut().zip(past) {
                    *r = *r * beta + out[p] * yq.conj() * (1.0 - beta);
                    let rhat = *r * correction;
                    penalty += rhat.norm_sqr();
                    err[p] += rhat * yq;
                    if norm > 0.0 {
                        peak = f64::max(peak, rhat.norm() / norm);
                    }
                }
            }
        }

        self.beta_pow *= beta;
        self.updates += 1;
        self.peak = peak;
        (err, 2.0 * penalty)
    }
}

/// Convergence phase of the equalizer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum ConvergencePhase {
    /// No updates yet
    Uninitialized,

    /// Adapting; the smoothed cost is above the tracking threshold
    Converging,

    /// Converged; the smoothed cost is below the re-acquire threshold
    Tracking,
}

/// Everything the equalizer remembers between calls
#[derive(Clone, Debug, PartialEq)]
pub struct EqualizerState {
    // taps[output][input]
    taps: [[FilterCoeff<Sample>; POLARIZATIONS]; POLARIZATIONS],

    // per-polarization input history
    history: [Window<Sample>; POLARIZATIONS],

    // input samples consumed since initialization
    samples: u64,

    // (sample rate, symbol rate) of the stream, once known
    rates: Option<(f64, f64)>,

    // smoothed cost, a running mean over the first updates
    cost: f64,

    // tap updates since initialization
    updates: u64,

    phase: ConvergencePhase,

    // output statistics, for multi-user CMA only
    crosscorr: Option<CrossCorrelation>,

    // singularity guard firings
    resets: u64,
}

impl EqualizerState {
    /// Identity-initialized state
    ///
    /// Every filter has `taps` taps. The direct filters start as
    /// centre spikes and the cross filters as zeros. Fails with
    /// [`DspError::TapLengthInvalid`] for zero taps and with
    /// [`DspError::ShapeMismatch`] unless `polarizations` is 2.
    pub fn new(taps: usize, polarizations: usize) -> Result<Self> {
        if polarizations != POLARIZATIONS {
            return Err(DspError::shape("polarizations", POLARIZATIONS, polarizations));
        }
        if taps == 0 {
            return Err(DspError::TapLengthInvalid { taps, block: 0 });
        }

        let spike = FilterCoeff::from_centre_spike(taps);
        let zero = FilterCoeff::zeros(taps);
        Ok(Self::with_filters([
            [spike.clone(), zero.clone()],
            [zero, spike],
        ]))
    }

    /// State with explicit starting taps
    ///
    /// `taps[p][q]` filters input polarization `q` into output
    /// polarization `p`; `taps[p][q][0]` multiplies the newest
    /// sample. All four filters must have the same non-zero
    /// length.
    pub fn from_taps(taps: [[Vec<Sample>; POLARIZATIONS]; POLARIZATIONS]) -> Result<Self> {
        let len = taps[0][0].len();
        if len == 0 {
            return Err(DspError::TapLengthInvalid { taps: 0, block: 0 });
        }
        for row in taps.iter() {
            for filt in row.iter() {
                if filt.len() != len {
                    return Err(DspError::shape("equalizer filter length", len, filt.len()));
                }
            }
        }
        let [[xx, xy], [yx, yy]] = taps;
        Ok(Self::with_filters([
            [FilterCoeff::from_slice(xx), FilterCoeff::from_slice(xy)],
            [FilterCoeff::from_slice(yx), FilterCoeff::from_slice(yy)],
        ]))
    }

    fn with_filters(taps: [[FilterCoeff<Sample>; POLARIZATIONS]; POLARIZATIONS]) -> Self {
        let len = taps[0][0].len();
        Self {
            taps,
            history: [Window::new(len), Window::new(len)],
            samples: 0,
            rates: None,
            cost: 0.0,
            updates: 0,
            phase: ConvergencePhase::Uninitialized,
            crosscorr: None,
            resets: 0,
        }
    }

    /// Taps per filter
    pub fn num_taps(&self) -> usize {
        self.taps[0][0].len()
    }

    /// Taps from input polarization `input` to output `output`
    pub fn taps(&self, output: usize, input: usize) -> &[Sample] {
        self.taps[output][input].as_slice()
    }

    /// Smoothed cost
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Number of tap updates so far
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Number of input samples consumed so far
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Convergence phase
    pub fn phase(&self) -> ConvergencePhase {
        self.phase
    }

    /// Largest normalized output cross-correlation
    ///
    /// `None` unless the equalizer decorrelates its outputs. Near
    /// zero when the outputs carry different polarizations and
    /// near one when they have locked onto the same one.
    pub fn cross_correlation(&self) -> Option<f64> {
        self.crosscorr.as_ref().map(|cc| cc.peak)
    }

    /// Number of times the `y` filters were rebuilt
    pub fn singularity_resets(&self) -> u64 {
        self.resets
    }

    /// Total tap energy `Σ|h|²`
    pub fn tap_energy(&self) -> f64 {
        self.taps
            .iter()
            .flat_map(|row| row.iter())
            .flat_map(|filt| filt.as_slice().iter())
            .map(|h| h.norm_sqr())
            .sum()
    }

    // Replace the y filters with the orthogonal complement of the x filters
    fn orthogonalize(&mut self) {
        let [xx, xy] = [&self.taps[0][0], &self.taps[0][1]];
        let yx: Vec<Sample> = xy.as_slice().iter().rev().map(|h| -h.conj()).collect();
        let yy: Vec<Sample> = xx.as_slice().iter().rev().map(|h| h.conj()).collect();
        self.taps[1] = [FilterCoeff::from_slice(yx), FilterCoeff::from_slice(yy)];
    }

    // Current filter outputs for both polarizations
    fn output(&self) -> [Sample; POLARIZATIONS] {
        let mut out = [Sample::new(0.0, 0.0); POLARIZATIONS];
        for (o, row) in out.iter_mut().zip(self.taps.iter()) {
            for (filt, hist) in row.iter().zip(self.history.iter()) {
                *o += filt.filter::<_, Sample, Sample>(hist);
            }
        }
        out
    }
}

/// Adaptive MIMO equalizer configuration
///
/// Build with [`EqualizerBuilder`].
#[derive(Clone, Debug)]
pub struct Equalizer {
    taps: usize,
    step_size: f64,
    update: UpdateForm,
    rule: Arc<dyn AdaptationRule>,
    smoothing: f64,
    track_below: f64,
    reacquire_above: f64,
    max_tap_energy: f64,
    decorrelation: Option<Decorrelation>,
}

impl Equalizer {
    /// Fresh state with this equalizer's tap count
    pub fn initialize(&self) -> Result<EqualizerState> {
        EqualizerState::new(self.taps, POLARIZATIONS)
    }

    /// Equalize a block and adapt the taps
    ///
    /// `block` must have an integer number of samples per symbol
    /// and at least as many samples as there are taps. If
    /// `reference` is given, its symbol `j` is the training
    /// symbol for the `j`-th output of this call; outputs beyond
    /// its end fall back to the rule's blind or decision mode.
    ///
    /// Returns the output symbols, at one sample per symbol, and
    /// the new state. Fails with [`DspError::TapLengthInvalid`],
    /// [`DspError::Oversampling`], or
    /// [`DspError::NumericDivergence`] if the taps blow up. After
    /// divergence, start over from [`initialize()`](Self::initialize).
    pub fn step(
        &self,
        state: EqualizerState,
        block: &Waveform,
        reference: Option<&Waveform>,
    ) -> Result<(Waveform, EqualizerState)> {
        self.run(state, block, reference, true)
    }

    /// Equalize a block with frozen taps
    ///
    /// The sample history still advances, so `apply()` may be
    /// interleaved with [`step()`](Self::step) in one stream.
    pub fn apply(
        &self,
        state: EqualizerState,
        block: &Waveform,
    ) -> Result<(Waveform, EqualizerState)> {
        self.run(state, block, None, false)
    }

    /// Drain the symbols still held in the sample history
    ///
    /// Pushes zeros through the frozen filters until the last
    /// input symbol has been output. This ends the stream; start
    /// the next one from a fresh or reset state. Fails with
    /// [`DspError::InvalidParameter`] if the state has never
    /// seen a block.
    pub fn flush(&self, mut state: EqualizerState) -> Result<(Waveform, EqualizerState)> {
        let (sample_rate, symbol_rate) = state.rates.ok_or(DspError::InvalidParameter(
            "nothing to flush: the equalizer has not seen any samples",
        ))?;
        let sps = (sample_rate / symbol_rate).round() as u64;
        let zeros = vec![Sample::new(0.0, 0.0); centre_tap(state.num_taps())];
        let (x, y) = self.feed(&mut state, &zeros, &zeros, sps, None, false)?;
        Ok((Waveform::symbols(x, y, symbol_rate)?, state))
    }

    /// Taps per filter
    pub fn num_taps(&self) -> usize {
        self.taps
    }

    /// Step size μ
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Update form
    pub fn update_form(&self) -> UpdateForm {
        self.update
    }

    /// Adaptation rule
    pub fn rule(&self) -> &Arc<dyn AdaptationRule> {
        &self.rule
    }

    /// Output decorrelation, for multi-user CMA
    pub fn decorrelation(&self) -> Option<Decorrelation> {
        self.decorrelation
    }

    fn run(
        &self,
        mut state: EqualizerState,
        block: &Waveform,
        reference: Option<&Waveform>,
        adapt: bool,
    ) -> Result<(Waveform, EqualizerState)> {
        let ntaps = state.num_taps();
        if ntaps == 0 || ntaps > block.len() {
            return Err(DspError::TapLengthInvalid {
                taps: ntaps,
                block: block.len(),
            });
        }
        let sps = block.samples_per_symbol()? as u64;
        state.rates = Some((block.sample_rate(), block.symbol_rate()));

        let (x, y) = self.feed(&mut state, block.x(), block.y(), sps, reference, adapt)?;
        let mut out = Waveform::symbols(x, y, block.symbol_rate())?;
        if let Some(t0) = block.time_origin() {
            out = out.with_time_origin(t0);
        }
        Ok((out, state))
    }

    // Push samples through the filters, emitting one output per symbol
    fn feed(
        &self,
        state: &mut EqualizerState,
        x: &[Sample],
        y: &[Sample],
        sps: u64,
        reference: Option<&Waveform>,
        adapt: bool,
    ) -> Result<(Vec<Sample>, Vec<Sample>)> {
        let centre = centre_tap(state.num_taps()) as u64;
        let sps = u64::max(sps, 1);
        let mut out_x = Vec::with_capacity(x.len() / sps as usize + 1);
        let mut out_y = Vec::with_capacity(out_x.capacity());

        for (ux, uy) in x.iter().zip(y.iter()) {
            state.history[0].push_scalar(*ux);
            state.history[1].push_scalar(*uy);
            let newest = state.samples;
            state.samples += 1;
            if newest < centre || (newest - centre) % sps != 0 {
                continue;
            }

            let out = state.output();
            if adapt {
                let training = reference.and_then(|r| {
                    let j = out_x.len();
                    if j < r.len() {
                        Some(r.pair(j))
                    } else {
                        None
                    }
                });
                self.adapt(state, out, training)?;
            }
            out_x.push(out[0]);
            out_y.push(out[1]);
        }

        Ok((out_x, out_y))
    }

    // One stochastic gradient step on every filter
    fn adapt(
        &self,
        state: &mut EqualizerState,
        out: [Sample; POLARIZATIONS],
        training: Option<[Sample; POLARIZATIONS]>,
    ) -> Result<()> {
        let gain = match self.update {
            UpdateForm::Gradient | UpdateForm::Sign => self.step_size,
            UpdateForm::Normalized { regularization } => nlms_gain(
                self.step_size,
                regularization,
                state.history.iter().flat_map(|h| h.iter()),
            ),
        };

        let (extra, mut cost) = match &self.decorrelation {
            Some(cfg) => state
                .crosscorr
                .get_or_insert_with(|| CrossCorrelation::new(cfg))
                .update(out, cfg.smoothing),
            None => ([Sample::new(0.0, 0.0); POLARIZATIONS], 0.0),
        };

        for (p, y) in out.iter().enumerate() {
            let (mut err, c) = self.rule.error(*y, training.map(|t| t[p]));
            err += extra[p];
            if self.update == UpdateForm::Sign {
                err = complex_sign(err);
            }
            cost += c;
            for (filt, hist) in state.taps[p].iter_mut().zip(state.history.iter()) {
                lms_update(gain, err, hist, filt.as_mut());
            }
        }
        cost /= POLARIZATIONS as f64;
        state.updates += 1;

        if !cost.is_finite() {
            warn!("equalizer: cost diverged after {} updates", state.updates);
            return Err(DspError::NumericDivergence {
                what: "cost",
                value: cost,
                updates: state.updates,
            });
        }
        let energy = state.tap_energy();
        if !energy.is_finite() || energy > self.max_tap_energy {
            warn!("equalizer: taps diverged after {} updates", state.updates);
            return Err(DspError::NumericDivergence {
                what: "tap energy",
                value: energy,
                updates: state.updates,
            });
        }

        // running mean until one smoothing period has passed
        let gain = f64::max(self.smoothing, 1.0 / state.updates as f64);
        state.cost += gain * (cost - state.cost);
        let settled = state.updates as f64 * self.smoothing >= 1.0;

        state.phase = match state.phase {
            ConvergencePhase::Uninitialized => {
                debug!("equalizer: converging");
                ConvergencePhase::Converging
            }
            ConvergencePhase::Converging if settled && state.cost < self.track_below => {
                debug!(
                    "equalizer: tracking after {} updates, cost {:.4}",
                    state.updates, state.cost
                );
                ConvergencePhase::Tracking
            }
            ConvergencePhase::Tracking if state.cost > self.reacquire_above => {
                debug!(
                    "equalizer: lost track after {} updates, cost {:.4}",
                    state.updates, state.cost
                );
                ConvergencePhase::Converging
            }
            phase => phase,
        };

        if let Some(cfg) = &self.decorrelation {
            self.guard(state, cfg);
        }
        Ok(())
    }

    // Rebuild the y filters if both outputs carry the same polarization
    fn guard(&self, state: &mut EqualizerState, cfg: &Decorrelation) {
        let locked = match &state.crosscorr {
            Some(cc) => cc.updates >= cfg.holdoff && cc.peak > cfg.reset_above,
            None => false,
        };
        if !locked {
            return;
        }

        state.resets += 1;
        warn!(
            "equalizer: outputs locked together after {} updates; rebuilding y filters",
            state.updates
        );
        state.orthogonalize();
        state.crosscorr = Some(CrossCorrelation::new(cfg));
        if state.phase == ConvergencePhase::Tracking {
            state.phase = ConvergencePhase::Converging;
        }
    }
}

/// Builds an [`Equalizer`]
///
/// The defaults are a 15-tap blind CMA equalizer for QPSK with
/// a plain gradient update.
#[derive(Clone, Debug)]
pub struct EqualizerBuilder {
    taps: usize,
    step_size: f64,
    update: UpdateForm,
    rule: RuleKind,
    custom_rule: Option<Arc<dyn AdaptationRule>>,
    constellation: Vec<Sample>,
    smoothing: f64,
    track_below: f64,
    reacquire_above: f64,
    max_tap_energy: f64,
    decorrelation: Decorrelation,
}

impl EqualizerBuilder {
    /// New builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the equalizer
    ///
    /// Fails with [`DspError::EmptyConstellation`] if a
    /// decision-directed or radius-directed rule has no
    /// constellation.
    pub fn build(&self) -> Result<Equalizer> {
        let (rule, decorrelation) = match &self.custom_rule {
            Some(rule) => (rule.clone(), None),
            None => (
                self.rule.build(&self.constellation)?,
                match self.rule {
                    RuleKind::Mucma => Some(self.decorrelation),
                    _ => None,
                },
            ),
        };
        Ok(Equalizer {
            taps: self.taps,
            step_size: self.step_size,
            update: self.update,
            rule,
            smoothing: self.smoothing,
            track_below: self.track_below,
            reacquire_above: self.reacquire_above,
            max_tap_energy: self.max_tap_energy,
            decorrelation,
        })
    }

    /// Taps per filter
    ///
    /// Zero is accepted here and rejected by
    /// [`Equalizer::initialize()`].
    pub fn with_taps(&mut self, taps: usize) -> &mut Self {
        self.taps = taps;
        self
    }

    /// Step size μ
    pub fn with_step_size(&mut self, mu: f64) -> &mut Self {
        self.step_size = f64::clamp(mu, 0.0, 1.0);
        self
    }

    /// Form of the tap update
    pub fn with_update(&mut self, update: UpdateForm) -> &mut Self {
        self.update = match update {
            UpdateForm::Normalized { regularization } => UpdateForm::Normalized {
                regularization: f64::max(regularization, 0.0),
            },
            other => other,
        };
        self
    }

    /// Built-in adaptation rule
    ///
    /// Clears any custom rule.
    pub fn with_rule(&mut self, rule: RuleKind) -> &mut Self {
        self.rule = rule;
        self.custom_rule = None;
        self
    }

    /// Caller-supplied adaptation rule
    pub fn with_custom_rule(&mut self, rule: Arc<dyn AdaptationRule>) -> &mut Self {
        self.custom_rule = Some(rule);
        self
    }

    /// Constellation for the built-in rules
    pub fn with_constellation(&mut self, constellation: &[Sample]) -> &mut Self {
        self.constellation = constellation.to_vec();
        self
    }

    /// Cost smoothing factor, `(0, 1]`
    pub fn with_cost_smoothing(&mut self, smoothing: f64) -> &mut Self {
        self.smoothing = f64::clamp(smoothing, 1.0e-6, 1.0);
        self
    }

    /// Convergence thresholds on the smoothed cost
    ///
    /// Enter tracking below `track_below`. Return to converging
    /// above `reacquire_above`, which is at least `track_below`.
    pub fn with_thresholds(&mut self, track_below: f64, reacquire_above: f64) -> &mut Self {
        self.track_below = f64::max(track_below, 0.0);
        self.reacquire_above = f64::max(reacquire_above, self.track_below);
        self
    }

    /// Output decorrelation settings for [`RuleKind::Mucma`]
    ///
    /// Ignored by the other rules.
    pub fn with_decorrelation(&mut self, decorrelation: Decorrelation) -> &mut Self {
        self.decorrelation = decorrelation;
        self
    }

    /// Largest permitted total tap energy `Σ|h|²`
    pub fn with_divergence_bound(&mut self, max_tap_energy: f64) -> &mut Self {
        self.max_tap_energy = f64::max(max_tap_energy, 1.0);
        self
    }

    /// Taps per filter
    pub fn taps(&self) -> usize {
        self.taps
    }

    /// Step size μ
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Update form
    pub fn update(&self) -> UpdateForm {
        self.update
    }

    /// Built-in adaptation rule
    pub fn rule(&self) -> RuleKind {
        self.rule
    }
}

impl Default for EqualizerBuilder {
    fn default() -> Self {
        Self {
            taps: 15,
            step_size: 1.0e-3,
            update: UpdateForm::Gradient,
            rule: RuleKind::Cma,
            custom_rule: None,
            constellation: Constellation::qpsk().points().to_vec(),
            smoothing: 0.01,
            track_below: 0.1,
            reacquire_above: 0.2,
            max_tap_energy: 1.0e6,
            decorrelation: Decorrelation::default(),
        }
    }
}

// Complex LMS update
//
// `filter[i]` pairs with the `i`-th newest sample of `window`.
fn lms_update<W>(gain: f64, error: Sample, window: W, filter: &mut [Sample])
where
    W: IntoIterator<Item = Sample>,
    W::IntoIter: DoubleEndedIterator,
{
    let step = error * gain;
    for (coeff, data) in filter.iter_mut().zip(window.into_iter().rev()) {
        *coeff -= step * data.conj();
    }
}

// NLMS gain
//
// ```txt
// gain =               relaxation
//        --------------------------------------
//          regularization + norm(window, 2)^2
// ```
#[inline]
fn nlms_gain<W>(relaxation: f64, regularization: f64, window: W) -> f64
where
    W: IntoIterator<Item = Sample>,
{
    let sumsq: f64 = window.into_iter().map(|w| w.norm_sqr()).sum();
    if regularization + sumsq > 0.0 {
        relaxation / (regularization + sumsq)
    } else {
        0.0
    }
}

#[inline]
fn complex_sign(z: Sample) -> Sample {
    let mag = z.norm();
    if mag > 0.0 {
        z / mag
    } else {
        Sample::new(0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    use crate::simulate::{dual_pol_symbols, upsample};
    use crate::spectral::SpectralFilter;

    fn qpsk_block(symbols: usize, sps: usize, seed: u64) -> (Waveform, Waveform) {
        let syms = dual_pol_symbols(&Constellation::qpsk(), symbols, 32.0e9, seed).unwrap();
        let wf = if sps > 1 {
            upsample(&syms, sps, &SpectralFilter::new()).unwrap()
        } else {
            syms.clone()
        };
        (syms, wf)
    }

    fn cma(taps: usize, mu: f64) -> Equalizer {
        EqualizerBuilder::new()
            .with_taps(taps)
            .with_step_size(mu)
            .build()
            .unwrap()
    }

    fn mucma(taps: usize, mu: f64, decorrelation: Decorrelation) -> Equalizer {
        EqualizerBuilder::new()
            .with_taps(taps)
            .with_step_size(mu)
            .with_rule(RuleKind::Mucma)
            .with_decorrelation(decorrelation)
            .build()
            .unwrap()
    }

    fn rotated(block: &Waveform, theta: f64, phi: f64) -> Waveform {
        crate::simulate::rotate_polarization(
            block,
            &crate::simulate::polarization_rotation(theta, phi),
        )
    }

    // |corr(y_p, s_q)| at the best small lag, ignoring the first `skip` outputs
    fn separation(out: &Waveform, syms: &Waveform, skip: usize) -> [[f64; 2]; 2] {
        let mut sep = [[0.0f64; 2]; 2];
        for (p, row) in sep.iter_mut().enumerate() {
            for (q, cell) in row.iter_mut().enumerate() {
                for lag in -2i64..=2 {
                    let mut acc = Sample::new(0.0, 0.0);
                    let (mut py, mut ps) = (0.0, 0.0);
                    for k in skip..out.len() {
                        let j = k as i64 + lag;
                        if j < 0 || j as usize >= syms.len() {
                            continue;
                        }
                        let y = out.pol(p)[k];
                        let s = syms.pol(q)[j as usize];
                        acc += y * s.conj();
                        py += y.norm_sqr();
                        ps += s.norm_sqr();
                    }
                    *cell = f64::max(*cell, acc.norm() / f64::sqrt(py * ps));
                }
            }
        }
        sep
    }

    fn separated(sep: &[[f64; 2]; 2]) -> bool {
        let straight = sep[0][0] > 0.9 && sep[1][1] > 0.9;
        let swapped = sep[0][1] > 0.9 && sep[1][0] > 0.9;
        straight || swapped
    }

    #[test]
    fn test_rules() {
        let cma = ConstantModulus::new(1.0);
        let (e, j) = cma.error(Sample::new(2.0, 0.0), None);
        assert_approx_eq!(e.re, 6.0);
        assert_approx_eq!(j, 9.0);

        let dd = DecisionDirected::new(Constellation::qpsk().points()).unwrap();
        let (e, j) = dd.error(Sample::new(1.0, 1.0), None);
        assert_approx_eq!(e.re, 1.0 - std::f64::consts::FRAC_1_SQRT_2);
        assert_approx_eq!(j, 2.0 * e.re * e.re);
        let (e, _) = dd.error(Sample::new(1.0, 1.0), Some(Sample::new(1.0, 0.0)));
        assert_approx_eq!(e.im, 1.0);

        let rde = RadiusDirected::new(crate::Modulation::Qam16.constellation().points()).unwrap();
        let (_, j) = rde.error(Sample::new(0.0, f64::sqrt(1.8)), None);
        assert_approx_eq!(j, 0.0);

        assert_eq!(
            DspError::EmptyConstellation,
            RuleKind::Dd.build(&[]).unwrap_err()
        );
        assert_eq!(
            DspError::EmptyConstellation,
            DecisionDirected::new(&[]).unwrap_err()
        );
        assert!(RuleKind::Cma.build(&[]).is_ok());
        assert!(RuleKind::Mucma.build(&[]).is_ok());
        assert_eq!(RuleKind::Rde, "rde".parse().unwrap());
        assert_eq!(RuleKind::Mucma, "mucma".parse().unwrap());

        assert!(self::cma(5, 1.0e-3).decorrelation().is_none());
        let mu = mucma(5, 1.0e-3, Decorrelation::default());
        assert_eq!(Some(Decorrelation::default()), mu.decorrelation());
        assert_eq!(6, Decorrelation::default().delays());
        assert_eq!(1, Decorrelation::new(0, 2.0).delays());
        assert_approx_eq!(Decorrelation::new(3, 2.0).smoothing(), 0.999_999);
    }

    #[test]
    fn test_initialize() {
        let state = EqualizerState::new(7, 2).unwrap();
        assert_eq!(7, state.num_taps());
        assert_eq!(Sample::new(1.0, 0.0), state.taps(0, 0)[3]);
        assert_eq!(Sample::new(1.0, 0.0), state.taps(1, 1)[3]);
        assert_approx_eq!(state.tap_energy(), 2.0);
        assert_eq!(ConvergencePhase::Uninitialized, state.phase());

        assert_eq!(
            DspError::TapLengthInvalid { taps: 0, block: 0 },
            EqualizerState::new(0, 2).unwrap_err()
        );
        assert!(matches!(
            EqualizerState::new(7, 3),
            Err(DspError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_tap_length_invalid() {
        let eq = cma(15, 1.0e-3);
        let (_, block) = qpsk_block(4, 2, 1);
        let state = eq.initialize().unwrap();
        assert_eq!(
            DspError::TapLengthInvalid { taps: 15, block: 8 },
            eq.step(state, &block, None).unwrap_err()
        );

        let zero = EqualizerBuilder::new().with_taps(0).build().unwrap();
        assert!(matches!(
            zero.initialize(),
            Err(DspError::TapLengthInvalid { taps: 0, .. })
        ));
    }

    #[test]
    fn test_identity_channel() {
        let eq = cma(7, 1.0e-3);
        let (syms, block) = qpsk_block(500, 2, 2);
        let state = eq.initialize().unwrap();

        let (out, state) = eq.step(state, &block, None).unwrap();
        let (tail, state) = eq.flush(state).unwrap();
        assert_eq!(499, out.len());
        assert_eq!(1, tail.len());
        // flushing does not adapt
        assert_eq!(499, state.updates());

        // taps have not moved
        let fresh = eq.initialize().unwrap();
        for p in 0..2 {
            for q in 0..2 {
                for (a, b) in state.taps(p, q).iter().zip(fresh.taps(p, q)) {
                    assert_approx_eq!(a.re, b.re, 1.0e-9);
                    assert_approx_eq!(a.im, b.im, 1.0e-9);
                }
            }
        }

        // and the symbols come straight through
        for (k, sym) in out.pairs().chain(tail.pairs()).enumerate() {
            assert_approx_eq!(sym[0].re, syms.x()[k].re, 1.0e-9);
            assert_approx_eq!(sym[1].im, syms.y()[k].im, 1.0e-9);
        }
        assert_eq!(ConvergencePhase::Tracking, state.phase());
    }

    #[test]
    fn test_phase_machine_on_rotated_channel() {
        let eq = cma(11, 5.0e-3);
        let (_, block) = qpsk_block(6000, 2, 8);
        let block = rotated(&block, 0.4, 0.0);

        // a short burst is not enough to call it converged
        let (_, state) = eq
            .step(eq.initialize().unwrap(), &block.slice(0, 120), None)
            .unwrap();
        assert_eq!(58, state.updates());
        assert_eq!(ConvergencePhase::Converging, state.phase());
        assert!(state.cost() > 0.1);

        let (_, state) = eq.step(state, &block.slice(120, 12000), None).unwrap();
        assert_eq!(ConvergencePhase::Tracking, state.phase());
        assert!(state.cost() < 0.1);
    }

    #[test]
    fn test_phase_machine_loses_track() {
        let eq = cma(11, 1.0e-3);
        let (_, block) = qpsk_block(500, 2, 9);
        let (_, state) = eq.step(eq.initialize().unwrap(), &block, None).unwrap();
        assert_eq!(ConvergencePhase::Tracking, state.phase());

        // the channel abruptly rotates by 45 degrees
        let (_, jump) = qpsk_block(200, 2, 10);
        let jump = rotated(&jump, std::f64::consts::FRAC_PI_4, 0.0);
        let (_, state) = eq.step(state, &jump, None).unwrap();
        assert_eq!(ConvergencePhase::Converging, state.phase());
        assert!(state.cost() > 0.2);
    }

    #[test]
    fn test_mucma_separates_polarizations() {
        let eq = mucma(11, 5.0e-3, Decorrelation::default());
        let (syms, block) = qpsk_block(6000, 2, 12);
        let block = rotated(&block, std::f64::consts::FRAC_PI_4, 0.0);

        let (out, state) = eq.step(eq.initialize().unwrap(), &block, None).unwrap();
        let sep = separation(&out, &syms, 4000);
        assert!(separated(&sep), "{:?}", sep);
        assert!(state.cross_correlation().unwrap() < 0.2);
        assert_eq!(ConvergencePhase::Tracking, state.phase());

        // plain CMA has no output statistics
        let (_, state) = cma(11, 5.0e-3)
            .step(eq.initialize().unwrap(), &block.slice(0, 200), None)
            .unwrap();
        assert!(state.cross_correlation().is_none());
    }

    #[test]
    fn test_singularity_guard() {
        // both outputs start out copying the x input
        let mut spike = vec![Sample::new(0.0, 0.0); 7];
        spike[3] = Sample::new(1.0, 0.0);
        let zero = vec![Sample::new(0.0, 0.0); 7];
        let state =
            EqualizerState::from_taps([[spike.clone(), zero.clone()], [spike, zero]]).unwrap();

        let eq = mucma(7, 1.0e-3, Decorrelation::default().with_holdoff(50));
        let (syms, block) = qpsk_block(1000, 2, 13);
        let (out, state) = eq.step(state, &block, None).unwrap();

        assert!(state.singularity_resets() >= 1);
        assert!(state.cross_correlation().unwrap() < 0.2);
        let sep = separation(&out, &syms, 500);
        assert!(separated(&sep), "{:?}", sep);

        // the rebuilt y row is orthogonal to the x row
        let energy: f64 = state.taps(1, 1).iter().map(|h| h.norm_sqr()).sum();
        assert!(energy > 0.5);

        // a disabled guard leaves the outputs locked
        let state = EqualizerState::from_taps([
            [state.taps(0, 0).to_vec(), state.taps(0, 1).to_vec()],
            [state.taps(0, 0).to_vec(), state.taps(0, 1).to_vec()],
        ])
        .unwrap();
        let off = mucma(
            7,
            1.0e-3,
            Decorrelation::default()
                .with_holdoff(50)
                .with_reset_above(1.5),
        );
        let (_, state) = off.step(state, &block, None).unwrap();
        assert_eq!(0, state.singularity_resets());
        assert!(state.cross_correlation().unwrap() > 0.8);
    }

    #[test]
    fn test_dd_training_converges_to_identity() {
        let qpsk = Constellation::qpsk();
        let eq = EqualizerBuilder::new()
            .with_taps(5)
            .with_step_size(0.01)
            .with_rule(RuleKind::Dd)
            .with_constellation(qpsk.points())
            .build()
            .unwrap();

        let mut xx = vec![Sample::new(0.0, 0.0); 5];
        xx[2] = Sample::new(0.8, 0.1);
        xx[1] = Sample::new(0.1, 0.0);
        let mut xy = vec![Sample::new(0.0, 0.0); 5];
        xy[2] = Sample::new(0.2, -0.1);
        let mut yx = vec![Sample::new(0.0, 0.0); 5];
        yx[3] = Sample::new(-0.1, 0.0);
        let mut yy = vec![Sample::new(0.0, 0.0); 5];
        yy[2] = Sample::new(0.9, 0.0);
        let state = EqualizerState::from_taps([[xx, xy], [yx, yy]]).unwrap();

        // symbol-spaced input, trained on the transmitted symbols
        let (syms, block) = qpsk_block(3000, 1, 3);
        let (_, state) = eq.step(state, &block, Some(&syms)).unwrap();

        let ident = EqualizerState::new(5, 2).unwrap();
        for p in 0..2 {
            for q in 0..2 {
                for (a, b) in state.taps(p, q).iter().zip(ident.taps(p, q)) {
                    assert_approx_eq!(a.re, b.re, 1.0e-6);
                    assert_approx_eq!(a.im, b.im, 1.0e-6);
                }
            }
        }
        assert!(state.cost() < 1.0e-6);
    }

    #[test]
    fn test_normalized_update_converges() {
        let eq = EqualizerBuilder::new()
            .with_taps(5)
            .with_step_size(0.05)
            .with_update(UpdateForm::Normalized {
                regularization: 1.0e-6,
            })
            .with_rule(RuleKind::Dd)
            .build()
            .unwrap();

        let mut taps = [
            [vec![Sample::new(0.0, 0.0); 5], vec![Sample::new(0.0, 0.0); 5]],
            [vec![Sample::new(0.0, 0.0); 5], vec![Sample::new(0.0, 0.0); 5]],
        ];
        taps[0][0][2] = Sample::new(0.7, 0.0);
        taps[1][1][2] = Sample::new(0.7, 0.0);
        let state = EqualizerState::from_taps(taps).unwrap();

        let (syms, block) = qpsk_block(2000, 1, 4);
        let (out, _) = eq.step(state, &block, Some(&syms)).unwrap();
        let tail = out.slice(1500, 500);
        let want = syms.slice(1500, 500);
        assert!(crate::metrics::normalized_mse(&tail, &want) < 1.0e-4);
    }

    #[test]
    fn test_step_is_pure() {
        let eq = cma(9, 1.0e-2);
        let (_, block) = qpsk_block(200, 2, 5);
        let block = crate::simulate::rotate_polarization(
            &block,
            &crate::simulate::polarization_rotation(0.4, 0.0),
        );
        let state = eq.initialize().unwrap();

        let first = eq.step(state.clone(), &block, None).unwrap();
        let second = eq.step(state, &block, None).unwrap();
        assert_eq!(first, second);
        assert!(first.1.updates() > 0);

        let frozen = eq.apply(first.1.clone(), &block).unwrap();
        assert_eq!(first.1.taps(0, 1), frozen.1.taps(0, 1));
        assert_eq!(first.1.updates(), frozen.1.updates());
    }

    #[test]
    fn test_streaming_matches_single_block() {
        let eq = cma(9, 1.0e-2);
        let (_, block) = qpsk_block(300, 2, 6);

        let (whole, whole_state) = eq.step(eq.initialize().unwrap(), &block, None).unwrap();

        let (a, state) = eq
            .step(eq.initialize().unwrap(), &block.slice(0, 251), None)
            .unwrap();
        let (b, state) = eq.step(state, &block.slice(251, 1000), None).unwrap();
        assert_eq!(whole_state, state);
        let joined: Vec<Sample> = a.x().iter().chain(b.x().iter()).copied().collect();
        assert_eq!(whole.x(), &joined[..]);
    }

    #[test]
    fn test_oversampling_rejected() {
        let eq = cma(3, 1.0e-3);
        let x = vec![Sample::new(1.0, 0.0); 30];
        let block = Waveform::new(x.clone(), x, 48.0e9, 32.0e9).unwrap();
        assert!(matches!(
            eq.step(eq.initialize().unwrap(), &block, None),
            Err(DspError::Oversampling { .. })
        ));
        assert!(eq.flush(eq.initialize().unwrap()).is_err());
    }

    #[test]
    fn test_divergence() {
        let eq = EqualizerBuilder::new()
            .with_taps(5)
            .with_step_size(1.0)
            .with_divergence_bound(100.0)
            .build()
            .unwrap();
        let (_, block) = qpsk_block(500, 2, 7);
        let block = block.scaled(10.0);
        let err = eq.step(eq.initialize().unwrap(), &block, None).unwrap_err();
        assert!(matches!(err, DspError::NumericDivergence { .. }));
    }
}
