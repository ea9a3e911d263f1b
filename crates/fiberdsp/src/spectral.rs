//! Frequency-domain filtering and chromatic dispersion
//!
//! The [`SpectralFilter`] applies a linear filter to both
//! polarizations of a [`Waveform`] by circular convolution:
//! forward FFT, multiply by the frequency response, inverse FFT.
//! The input is treated as one period of a periodic signal.
//! Callers who cannot tolerate wrap-around should pad their
//! input or use [`SpectralFilter::linear()`].
//!
//! Chromatic dispersion is an all-pass filter with a quadratic
//! phase response,
//!
//! ```txt
//! H(ω) = exp(-j · β₂/2 · ω² · L)
//! β₂   = -D · λ² / (2πc)
//! ```
//!
//! where `D` is the dispersion coefficient, `λ` the carrier
//! wavelength and `L` the fiber length. Dispersion compensation
//! is the same filter with `-L`.

use std::f64::consts::PI;
use std::fmt;
use std::sync::{Arc, Mutex};

use nalgebra::DVector;
use rustfft::{Fft, FftPlanner};
use strum_macros::{Display, EnumString};

use crate::error::{DspError, Result};
use crate::filter::centre_tap;
use crate::waveform::{Sample, Waveform};

/// Speed of light in vacuum (m/s)
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Group-velocity dispersion β₂ (s²/m)
///
/// From the dispersion coefficient `dispersion` (ps/nm/km) and
/// the carrier `wavelength` (nm).
pub fn group_velocity_dispersion(dispersion: f64, wavelength: f64) -> f64 {
    // ps/(nm·km) → s/m²
    let d = dispersion * 1.0e-6;
    let lambda = wavelength * 1.0e-9;
    -d * lambda * lambda / (2.0 * PI * SPEED_OF_LIGHT)
}

/// Angular frequency of each FFT bin (rad/s)
///
/// Bins are in FFT order: DC first, then positive frequencies,
/// then negative frequencies.
pub fn angular_frequencies(len: usize, sample_rate: f64) -> Vec<f64> {
    let n = len as f64;
    (0..len)
        .map(|k| {
            let k = if k < (len + 1) / 2 {
                k as f64
            } else {
                k as f64 - n
            };
            2.0 * PI * sample_rate * k / n
        })
        .collect()
}

/// Dispersion frequency response over `length` metres
///
/// `beta2` is in s²/m. Negative lengths give the compensating
/// (inverse) response.
pub fn dispersion_response(len: usize, sample_rate: f64, beta2: f64, length: f64) -> Vec<Sample> {
    angular_frequencies(len, sample_rate)
        .into_iter()
        .map(|w| Sample::from_polar(1.0, -0.5 * beta2 * w * w * length))
        .collect()
}

/// Domain of a [`FilterKernel`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum KernelDomain {
    /// Centred impulse response
    Time,

    /// Frequency response, in FFT bin order
    Frequency,
}

/// Complex filter coefficients tagged with their domain
///
/// * `Frequency` kernels hold one coefficient per FFT bin and
///   must have the same length as the waveform they filter.
/// * `Time` kernels are impulse responses whose centre tap is
///   at zero delay. They may be any length up to the waveform
///   length.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterKernel {
    domain: KernelDomain,
    coeffs: DVector<Sample>,
}

impl FilterKernel {
    /// Frequency response kernel
    pub fn frequency<C>(coeffs: C) -> Self
    where
        C: Into<Vec<Sample>>,
    {
        Self {
            domain: KernelDomain::Frequency,
            coeffs: DVector::from_vec(coeffs.into()),
        }
    }

    /// Centred impulse response kernel
    pub fn time<C>(coeffs: C) -> Self
    where
        C: Into<Vec<Sample>>,
    {
        Self {
            domain: KernelDomain::Time,
            coeffs: DVector::from_vec(coeffs.into()),
        }
    }

    /// All-pass (identity) frequency kernel of `len` bins
    pub fn all_pass(len: usize) -> Self {
        Self::frequency(vec![Sample::new(1.0, 0.0); len])
    }

    /// Dispersion kernel for a waveform of `len` samples
    ///
    /// See [`dispersion_response()`].
    pub fn dispersion(len: usize, sample_rate: f64, beta2: f64, length: f64) -> Self {
        Self::frequency(dispersion_response(len, sample_rate, beta2, length))
    }

    /// Kernel domain
    pub fn domain(&self) -> KernelDomain {
        self.domain
    }

    /// Number of coefficients
    pub fn len(&self) -> usize {
        self.coeffs.len()
    }

    /// True if there are no coefficients
    pub fn is_empty(&self) -> bool {
        self.coeffs.is_empty()
    }

    /// Kernel coefficients
    pub fn coeffs(&self) -> &[Sample] {
        self.coeffs.as_slice()
    }
}

/// FFT-based linear filter for dual-polarization waveforms
///
/// FFT plans are cached per transform length. Filtering
/// borrows the filter immutably and may be shared between
/// threads; the plan cache is the only interior state.
pub struct SpectralFilter {
    planner: Mutex<FftPlanner<f64>>,
}

impl SpectralFilter {
    /// New filter with an empty plan cache
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(FftPlanner::new()),
        }
    }

    /// Apply `kernel` to both polarizations
    ///
    /// Fails with [`DspError::ShapeMismatch`] if a frequency
    /// kernel's length differs from the waveform length, or a
    /// time kernel is longer than the waveform.
    pub fn apply(&self, wf: &Waveform, kernel: &FilterKernel) -> Result<Waveform> {
        let response = self.response(kernel, wf.len())?;
        self.apply_response(wf, &response)
    }

    /// Apply a frequency response (FFT bin order)
    pub fn apply_response(&self, wf: &Waveform, response: &[Sample]) -> Result<Waveform> {
        if response.len() != wf.len() {
            return Err(DspError::shape(
                "frequency response length",
                wf.len(),
                response.len(),
            ));
        }
        if wf.is_empty() {
            return Ok(wf.clone());
        }

        let (fwd, inv) = self.plans(wf.len());
        let mut pols = [wf.x().to_vec(), wf.y().to_vec()];
        for pol in pols.iter_mut() {
            fwd.process(pol);
            for (sa, h) in pol.iter_mut().zip(response.iter()) {
                *sa *= *h;
            }
            inverse_normalized(inv.as_ref(), pol);
        }
        let [x, y] = pols;
        wf.with_samples(x, y)
    }

    /// Compensate chromatic dispersion accumulated over `length` km
    ///
    /// `dispersion` is in ps/nm/km and `wavelength` in nm.
    pub fn compensate_dispersion(
        &self,
        wf: &Waveform,
        dispersion: f64,
        wavelength: f64,
        length: f64,
    ) -> Result<Waveform> {
        let beta2 = group_velocity_dispersion(dispersion, wavelength);
        let response = dispersion_response(wf.len(), wf.sample_rate(), beta2, -length * 1.0e3);
        self.apply_response(wf, &response)
    }

    /// Blind scan for the accumulated dispersion (ps/nm)
    ///
    /// Compensates `wf` with each of `bins` evenly spaced
    /// candidates from `start` to `end` ps/nm and scores each by
    /// the normalized fourth moment
    ///
    /// ```txt
    /// κ = E|y|⁴ / (E|y|²)²
    /// ```
    ///
    /// summed over both polarizations. Residual dispersion mixes
    /// many symbols into every sample and drives `κ` toward the
    /// Gaussian value of 2; the right candidate minimizes it.
    ///
    /// Fails with [`DspError::InvalidParameter`] if `wf` is empty
    /// or `bins` is zero.
    pub fn estimate_dispersion(
        &self,
        wf: &Waveform,
        wavelength: f64,
        start: f64,
        end: f64,
        bins: usize,
    ) -> Result<DispersionScan> {
        if wf.is_empty() || bins == 0 {
            return Err(DspError::InvalidParameter(
                "dispersion scan needs samples and at least one bin",
            ));
        }

        let spectra: Vec<Vec<Sample>> = [wf.x(), wf.y()]
            .iter()
            .map(|pol| {
                let mut buf = pol.to_vec();
                self.fft(&mut buf);
                buf
            })
            .collect();

        let step = if bins > 1 {
            (end - start) / (bins - 1) as f64
        } else {
            0.0
        };
        let candidates: Vec<f64> = (0..bins).map(|k| start + step * k as f64).collect();

        let mut metric = Vec::with_capacity(bins);
        for cand in candidates.iter() {
            // accumulated dispersion is D · L with L = 1 km
            let beta2 = group_velocity_dispersion(*cand, wavelength);
            let response = dispersion_response(wf.len(), wf.sample_rate(), beta2, -1.0e3);

            let mut score = 0.0;
            for spec in spectra.iter() {
                let mut buf: Vec<Sample> = spec
                    .iter()
                    .zip(response.iter())
                    .map(|(a, b)| a * b)
                    .collect();
                self.ifft(&mut buf);
                let n = buf.len() as f64;
                let m2 = buf.iter().map(|y| y.norm_sqr()).sum::<f64>() / n;
                let m4 = buf.iter().map(|y| y.norm_sqr().powi(2)).sum::<f64>() / n;
                if m2 > 0.0 {
                    score += m4 / (m2 * m2);
                }
            }
            metric.push(score);
        }

        Ok(DispersionScan { candidates, metric })
    }

    /// Linear ("same") convolution with a centred time kernel
    ///
    /// The input is zero-padded so that nothing wraps around.
    /// The output has the same length as `wf` and is aligned
    /// with it. Fails with [`DspError::InvalidParameter`] if the
    /// kernel is not in the time domain.
    pub fn linear(&self, wf: &Waveform, kernel: &FilterKernel) -> Result<Waveform> {
        if kernel.domain() != KernelDomain::Time {
            return Err(DspError::InvalidParameter(
                "linear convolution requires a time-domain kernel",
            ));
        }
        if wf.is_empty() || kernel.is_empty() {
            return Ok(wf.clone());
        }

        let padded_len = (wf.len() + kernel.len() - 1).next_power_of_two();
        let response = self.response(kernel, padded_len)?;
        let (fwd, inv) = self.plans(padded_len);

        let mut pols = [Vec::new(), Vec::new()];
        for (out, input) in pols.iter_mut().zip([wf.x(), wf.y()]) {
            let mut buf = input.to_vec();
            buf.resize(padded_len, Sample::new(0.0, 0.0));
            fwd.process(&mut buf);
            for (sa, h) in buf.iter_mut().zip(response.iter()) {
                *sa *= *h;
            }
            inverse_normalized(inv.as_ref(), &mut buf);
            buf.truncate(wf.len());
            *out = buf;
        }
        let [x, y] = pols;
        wf.with_samples(x, y)
    }

    /// In-place forward FFT of `data`
    pub fn fft(&self, data: &mut [Sample]) {
        if data.is_empty() {
            return;
        }
        let (fwd, _) = self.plans(data.len());
        fwd.process(data);
    }

    /// In-place inverse FFT of `data`, scaled by `1/len`
    pub fn ifft(&self, data: &mut [Sample]) {
        if data.is_empty() {
            return;
        }
        let (_, inv) = self.plans(data.len());
        inverse_normalized(inv.as_ref(), data);
    }

    /// Frequency response of `kernel` on an FFT grid of `len` bins
    pub fn response(&self, kernel: &FilterKernel, len: usize) -> Result<Vec<Sample>> {
        match kernel.domain() {
            KernelDomain::Frequency => {
                if kernel.len() != len {
                    return Err(DspError::shape("frequency kernel length", len, kernel.len()));
                }
                Ok(kernel.coeffs().to_vec())
            }
            KernelDomain::Time => {
                if kernel.len() > len {
                    return Err(DspError::shape("time kernel length", len, kernel.len()));
                }
                let mut buf = vec![Sample::new(0.0, 0.0); len];
                let centre = centre_tap(kernel.len());
                for (k, h) in kernel.coeffs().iter().enumerate() {
                    buf[(k + len - centre) % len] = *h;
                }
                self.fft(&mut buf);
                Ok(buf)
            }
        }
    }

    /// Truncated impulse response of a frequency response
    ///
    /// Returns the `taps` centred coefficients of the inverse
    /// FFT of `response(n)`, where the grid length `n` is
    /// generously larger than `taps` to limit aliasing.
    pub fn impulse_response<F>(&self, taps: usize, response: F) -> FilterKernel
    where
        F: FnOnce(usize) -> Vec<Sample>,
    {
        let grid = usize::max(256, 8 * taps.next_power_of_two());
        let mut buf = response(grid);
        buf.resize(grid, Sample::new(0.0, 0.0));
        self.ifft(&mut buf);

        let centre = centre_tap(taps);
        let coeffs: Vec<Sample> = (0..taps)
            .map(|k| buf[(k + grid - centre) % grid])
            .collect();
        FilterKernel::time(coeffs)
    }

    // Forward and inverse plans for `len`
    fn plans(&self, len: usize) -> (Arc<dyn Fft<f64>>, Arc<dyn Fft<f64>>) {
        let mut planner = self
            .planner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (planner.plan_fft_forward(len), planner.plan_fft_inverse(len))
    }
}

/// Result of [`SpectralFilter::estimate_dispersion()`]
#[derive(Clone, Debug, PartialEq)]
pub struct DispersionScan {
    /// Candidate accumulated dispersion (ps/nm)
    pub candidates: Vec<f64>,

    /// Normalized fourth moment after compensating each candidate
    pub metric: Vec<f64>,
}

impl DispersionScan {
    /// Candidate with the smallest metric
    pub fn estimate(&self) -> f64 {
        self.metric
            .iter()
            .zip(self.candidates.iter())
            .min_by(|a, b| a.0.total_cmp(b.0))
            .map(|(_, c)| *c)
            .unwrap_or(0.0)
    }
}

impl Default for SpectralFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SpectralFilter {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpectralFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralFilter").finish_non_exhaustive()
    }
}

// rustfft does not normalize its inverse transform
fn inverse_normalized(inv: &dyn Fft<f64>, data: &mut [Sample]) {
    inv.process(data);
    let scale = 1.0 / data.len() as f64;
    for sa in data.iter_mut() {
        *sa *= scale;
    }
}
