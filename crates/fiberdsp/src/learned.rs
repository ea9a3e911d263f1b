//! Learned digital back-propagation
//!
//! A generalization of split-step back-propagation in which
//! every step has its own free parameters:
//!
//! ```txt
//! for i in 1..=K:
//!     y ← h_i ⊛ y                       (time-domain kernel)
//!     y ← y · exp(j · C_i · [|y_x|², |y_y|²]ᵀ)
//! ```
//!
//! `h_i` are centred complex FIR kernels and `C_i` real 2×2
//! coupling matrices. Initialized from a [`SplitStepPropagator`],
//! the kernels are truncated dispersion impulse responses and
//! the couplings are the physical nonlinear phases, so the
//! model starts out as ordinary DBP. The parameters are then
//! exposed as one flat real vector for gradient-based tuning.

use nalgebra::Matrix2;

use crate::error::{DspError, Result};
use crate::optim::{pack_complex, unpack_complex};
use crate::propagate::{effective_length, launch_scale, SplitStepPropagator, MANAKOV_FACTOR};
use crate::spectral::{dispersion_response, FilterKernel, SpectralFilter};
use crate::waveform::{Sample, Waveform};

#[cfg(not(test))]
use log::debug;

#[cfg(test)]
use std::println as debug;

/// Back-propagation with trainable per-step kernels and couplings
#[derive(Clone, Debug)]
pub struct LearnedBackPropagation {
    kernels: Vec<FilterKernel>,
    couplings: Vec<Matrix2<f64>>,
    output_gain: f64,
    launch_power: Option<f64>,
    filter: SpectralFilter,
}

impl LearnedBackPropagation {
    /// Initialize from a physical back-propagator
    ///
    /// Each step gets a `taps`-long dispersion kernel for the
    /// given `sample_rate`. The result approximates
    /// [`SplitStepPropagator::back_propagate()`] with
    /// [`StepOrder::NonlinearFirst`](crate::StepOrder::NonlinearFirst),
    /// up to kernel truncation.
    ///
    /// Fails with [`DspError::InvalidStepCount`] if the step
    /// policy yields no steps, or [`DspError::InvalidParameter`]
    /// if `taps` is zero.
    pub fn from_propagator(
        prop: &SplitStepPropagator,
        taps: usize,
        sample_rate: f64,
    ) -> Result<Self> {
        if taps == 0 {
            return Err(DspError::InvalidParameter("learned DBP kernels need at least one tap"));
        }

        let link = prop.link();
        let steps = prop.steps().steps_per_span(link.span_length())?;
        let h = link.span_length() * 1.0e3 / steps as f64;
        let alpha = link.alpha_per_metre();
        let phase_per_watt = -prop.nonlinear_scale()
            * link.gamma_per_metre()
            * MANAKOV_FACTOR
            * effective_length(-alpha, h);

        let filter = SpectralFilter::new();
        let kernel = filter.impulse_response(taps, |n| {
            dispersion_response(n, sample_rate, link.beta2(), -h)
        });

        let span_loss = (-0.5 * alpha * link.span_length() * 1.0e3).exp();
        let step_gain = (0.5 * alpha * h).exp();

        // running field gain since the receiver
        let mut gain = 1.0f64;
        let mut kernels = Vec::with_capacity(steps * link.spans() as usize);
        let mut couplings = Vec::with_capacity(kernels.capacity());
        for _span in 0..link.spans() {
            if link.amplified() {
                gain *= span_loss;
            }
            for _step in 0..steps {
                kernels.push(kernel.clone());
                couplings.push(Matrix2::from_element(phase_per_watt * gain * gain));
                gain *= step_gain;
            }
        }

        debug!(
            "learned dbp: {} steps of {} taps, output gain {:.4}",
            kernels.len(),
            taps,
            gain
        );

        Ok(Self {
            kernels,
            couplings,
            output_gain: gain,
            launch_power: prop.launch_power(),
            filter,
        })
    }

    /// Number of steps
    pub fn steps(&self) -> usize {
        self.kernels.len()
    }

    /// Per-step dispersion kernels
    pub fn kernels(&self) -> &[FilterKernel] {
        &self.kernels
    }

    /// Per-step nonlinear coupling matrices (rad/W)
    pub fn couplings(&self) -> &[Matrix2<f64>] {
        &self.couplings
    }

    /// Number of real parameters
    pub fn num_params(&self) -> usize {
        self.kernels.iter().map(|k| 2 * k.len()).sum::<usize>() + 4 * self.couplings.len()
    }

    /// Flat real parameter vector
    ///
    /// All kernels, as interleaved `re, im` pairs, followed by
    /// all coupling matrices in row-major order.
    pub fn params(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.num_params());
        for kernel in &self.kernels {
            out.extend(pack_complex(kernel.coeffs()));
        }
        for c in &self.couplings {
            out.extend_from_slice(&[c[(0, 0)], c[(0, 1)], c[(1, 0)], c[(1, 1)]]);
        }
        out
    }

    /// Copy with new parameters
    ///
    /// `params` has the layout of [`params()`](Self::params).
    /// Fails with [`DspError::ShapeMismatch`] if its length is
    /// not [`num_params()`](Self::num_params).
    pub fn with_params(&self, params: &[f64]) -> Result<Self> {
        if params.len() != self.num_params() {
            return Err(DspError::shape(
                "learned DBP parameter count",
                self.num_params(),
                params.len(),
            ));
        }

        let mut out = self.clone();
        let mut rest = params;
        for kernel in out.kernels.iter_mut() {
            let (mine, tail) = rest.split_at(2 * kernel.len());
            *kernel = FilterKernel::time(unpack_complex(mine)?);
            rest = tail;
        }
        for (c, chunk) in out.couplings.iter_mut().zip(rest.chunks_exact(4)) {
            *c = Matrix2::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        }
        Ok(out)
    }

    /// Back-propagate `wf`
    ///
    /// Fails with [`DspError::ShapeMismatch`] if the kernels are
    /// longer than the waveform.
    pub fn apply(&self, wf: &Waveform) -> Result<Waveform> {
        let scale = launch_scale(wf, self.launch_power);
        let mut out = wf.scaled(scale);
        for (kernel, c) in self.kernels.iter().zip(self.couplings.iter()) {
            out = self.filter.apply(&out, kernel)?;
            out = out.map_pairs(|[x, y]| {
                let px = x.norm_sqr();
                let py = y.norm_sqr();
                let phix = c[(0, 0)] * px + c[(0, 1)] * py;
                let phiy = c[(1, 0)] * px + c[(1, 1)] * py;
                [
                    x * Sample::from_polar(1.0, phix),
                    y * Sample::from_polar(1.0, phiy),
                ]
            });
        }
        Ok(out.scaled(self.output_gain / scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::constellation::Constellation;
    use crate::metrics::normalized_mse;
    use crate::propagate::{FiberLink, StepOrder, StepPolicy};
    use crate::simulate::{dual_pol_symbols, upsample};

    fn setup() -> (SplitStepPropagator, Waveform) {
        let mut link = FiberLink::new(40.0, 2);
        link.with_nonlinearity(1.3);

        let mut prop = SplitStepPropagator::new(link);
        prop.with_steps(StepPolicy::PerSpan(2))
            .with_order(StepOrder::NonlinearFirst)
            .with_launch_power(Some(6.0));

        let syms = dual_pol_symbols(&Constellation::qpsk(), 512, 32.0e9, 7).unwrap();
        let wf = upsample(&syms, 2, &SpectralFilter::new()).unwrap();
        (prop, wf)
    }

    #[test]
    fn test_matches_physical_dbp() {
        let (prop, wf) = setup();
        let rx = prop.propagate(&wf).unwrap();
        let physical = prop.back_propagate(&rx).unwrap();

        let ldbp = LearnedBackPropagation::from_propagator(&prop, 101, wf.sample_rate()).unwrap();
        assert_eq!(4, ldbp.steps());
        let learned = ldbp.apply(&rx).unwrap();

        let err = normalized_mse(&learned, &physical);
        debug!("learned vs physical: {:e}", err);
        assert!(err < 1.0e-2);
        assert!(err < 0.1 * normalized_mse(&rx, &physical));
    }

    #[test]
    fn test_params_round_trip() {
        let (prop, wf) = setup();
        let ldbp = LearnedBackPropagation::from_propagator(&prop, 31, wf.sample_rate()).unwrap();
        let params = ldbp.params();
        assert_eq!(4 * (2 * 31 + 4), params.len());
        assert_eq!(params.len(), ldbp.num_params());

        let copy = ldbp.with_params(&params).unwrap();
        assert_eq!(ldbp.apply(&wf).unwrap(), copy.apply(&wf).unwrap());

        // zeroing the couplings removes the nonlinear step
        let mut linear = params.clone();
        let ncoup = 4 * ldbp.steps();
        let start = linear.len() - ncoup;
        for p in &mut linear[start..] {
            *p = 0.0;
        }
        let linear = ldbp.with_params(&linear).unwrap();
        assert!(linear.couplings().iter().all(|c| c.norm() == 0.0));

        assert!(matches!(
            ldbp.with_params(&params[1..]),
            Err(DspError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_construction() {
        let (mut prop, _) = setup();
        assert!(LearnedBackPropagation::from_propagator(&prop, 0, 64.0e9).is_err());
        prop.with_steps(StepPolicy::PerSpan(0));
        assert_eq!(
            DspError::InvalidStepCount,
            LearnedBackPropagation::from_propagator(&prop, 11, 64.0e9).unwrap_err()
        );
    }
}
