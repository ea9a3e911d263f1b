//! Deterministic test signals
//!
//! Building blocks for a simulated coherent link:
//!
//! ```txt
//! symbols ─▶ upsample ─▶ fiber ─▶ polarization rotation ─▶ carrier offset ─▶ noise
//! ```
//!
//! The fiber itself is a [`SplitStepPropagator`](crate::SplitStepPropagator)
//! run forward. All randomness comes from seeded ChaCha
//! generators, so every signal is reproducible.

use std::f64::consts::PI;

use nalgebra::{Matrix2, Vector2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::constellation::Constellation;
use crate::error::{DspError, Result};
use crate::spectral::SpectralFilter;
use crate::waveform::{Sample, Waveform};

/// Uniformly-drawn constellation points
pub fn random_symbols<R>(constellation: &Constellation, len: usize, rng: &mut R) -> Vec<Sample>
where
    R: Rng + ?Sized,
{
    let points = constellation.points();
    (0..len)
        .map(|_| points[rng.gen_range(0..points.len())])
        .collect()
}

/// Independent random symbols on both polarizations
///
/// The result has one sample per symbol.
pub fn dual_pol_symbols(
    constellation: &Constellation,
    len: usize,
    symbol_rate: f64,
    seed: u64,
) -> Result<Waveform> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let x = random_symbols(constellation, len, &mut rng);
    let y = random_symbols(constellation, len, &mut rng);
    Waveform::symbols(x, y, symbol_rate)
}

/// Band-limited upsampling by an integer factor
///
/// Zero-pads the spectrum, splitting the Nyquist bin of
/// even-length inputs between both band edges. Every `sps`-th
/// output sample equals the corresponding input sample.
pub fn upsample(wf: &Waveform, sps: usize, filter: &SpectralFilter) -> Result<Waveform> {
    if sps == 0 {
        return Err(DspError::InvalidParameter("upsampling factor must be positive"));
    }

    let n = wf.len();
    let m = n * sps;
    let mut pols = [Vec::new(), Vec::new()];
    for (out, input) in pols.iter_mut().zip([wf.x(), wf.y()]) {
        let mut spec = input.to_vec();
        filter.fft(&mut spec);

        let mut wide = vec![Sample::new(0.0, 0.0); m];
        for (k, val) in spec.iter().enumerate() {
            if 2 * k < n {
                wide[k] = *val;
            } else if 2 * k == n && sps > 1 {
                wide[k] += *val * 0.5;
                wide[m - k] += *val * 0.5;
            } else {
                wide[m - n + k] = *val;
            }
        }

        filter.ifft(&mut wide);
        let gain = sps as f64;
        for sa in wide.iter_mut() {
            *sa *= gain;
        }
        *out = wide;
    }

    let [x, y] = pols;
    let out = Waveform::new(x, y, wf.sample_rate() * sps as f64, wf.symbol_rate())?;
    Ok(match wf.time_origin() {
        Some(t0) => out.with_time_origin(t0),
        None => out,
    })
}

/// Unitary polarization rotation
///
/// ```txt
/// ⎡ cos θ           -sin θ · e^(-jφ) ⎤
/// ⎣ sin θ · e^(jφ)   cos θ           ⎦
/// ```
pub fn polarization_rotation(theta: f64, phi: f64) -> Matrix2<Sample> {
    let c = Sample::new(theta.cos(), 0.0);
    let s = theta.sin();
    Matrix2::new(
        c,
        -Sample::from_polar(s, -phi),
        Sample::from_polar(s, phi),
        c,
    )
}

/// Mix the polarizations with a 2×2 Jones matrix
pub fn rotate_polarization(wf: &Waveform, jones: &Matrix2<Sample>) -> Waveform {
    wf.map_pairs(|[x, y]| {
        let out = jones * Vector2::new(x, y);
        [out[0], out[1]]
    })
}

/// Apply a carrier phase offset (rad) and frequency offset (Hz)
pub fn carrier_offset(wf: &Waveform, phase: f64, frequency: f64) -> Waveform {
    let step = 2.0 * PI * frequency / wf.sample_rate();
    let mut n = 0.0f64;
    wf.map_pairs(|[x, y]| {
        let rot = Sample::from_polar(1.0, phase + step * n);
        n += 1.0;
        [x * rot, y * rot]
    })
}

/// Add white Gaussian noise at `snr_db` per polarization
///
/// SNR is measured per sample against each polarization's
/// mean power.
pub fn add_noise(wf: &Waveform, snr_db: f64, seed: u64) -> Waveform {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let snr = f64::powf(10.0, snr_db / 10.0);
    let sigma = wf.power().map(|pwr| (pwr / snr / 2.0).sqrt());
    wf.map_pairs(|[x, y]| {
        let mut noise = |sd: f64| {
            let re: f64 = rng.sample(StandardNormal);
            let im: f64 = rng.sample(StandardNormal);
            Sample::new(sd * re, sd * im)
        };
        [x + noise(sigma[0]), y + noise(sigma[1])]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    use crate::metrics::normalized_mse;

    #[test]
    fn test_symbols_are_reproducible() {
        let qpsk = Constellation::qpsk();
        let a = dual_pol_symbols(&qpsk, 100, 1.0e9, 42).unwrap();
        let b = dual_pol_symbols(&qpsk, 100, 1.0e9, 42).unwrap();
        let c = dual_pol_symbols(&qpsk, 100, 1.0e9, 43).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(1, a.samples_per_symbol().unwrap());
        assert!(a.x().iter().all(|s| (s.norm() - 1.0).abs() < 1.0e-12));
    }

    #[test]
    fn test_upsample_keeps_symbols() {
        let qpsk = Constellation::qpsk();
        let filt = SpectralFilter::new();
        for len in [64usize, 65] {
            let syms = dual_pol_symbols(&qpsk, len, 32.0e9, 1).unwrap();
            let up = upsample(&syms, 2, &filt).unwrap();
            assert_eq!(2 * len, up.len());
            assert_eq!(2, up.samples_per_symbol().unwrap());
            for k in 0..len {
                assert_approx_eq!(up.x()[2 * k].re, syms.x()[k].re, 1.0e-9);
                assert_approx_eq!(up.y()[2 * k].im, syms.y()[k].im, 1.0e-9);
            }
            // power is kept, less half of any Nyquist bin
            assert_approx_eq!(up.total_power(), syms.total_power(), 0.1);
        }

        assert!(upsample(&dual_pol_symbols(&qpsk, 4, 1.0, 0).unwrap(), 0, &filt).is_err());
    }

    #[test]
    fn test_rotation_is_unitary() {
        let qpsk = Constellation::qpsk();
        let syms = dual_pol_symbols(&qpsk, 256, 32.0e9, 3).unwrap();
        let jones = polarization_rotation(0.6, 1.1);
        let rotated = rotate_polarization(&syms, &jones);
        assert_approx_eq!(rotated.total_power(), syms.total_power(), 1.0e-9);

        let back = rotate_polarization(&rotated, &jones.adjoint());
        assert!(normalized_mse(&back, &syms) < 1.0e-24);
    }

    #[test]
    fn test_noise_level() {
        let qpsk = Constellation::qpsk();
        let syms = dual_pol_symbols(&qpsk, 20000, 32.0e9, 4).unwrap();
        let noisy = add_noise(&syms, 10.0, 5);
        assert_approx_eq!(normalized_mse(&noisy, &syms), 0.1, 0.01);
    }

    #[test]
    fn test_carrier_offset() {
        let syms = Waveform::symbols(
            vec![Sample::new(1.0, 0.0); 4],
            vec![Sample::new(0.0, 1.0); 4],
            4.0,
        )
        .unwrap();
        let out = carrier_offset(&syms, 0.5, 1.0);
        // quarter turn per sample
        assert_approx_eq!(out.x()[0].arg(), 0.5);
        assert_approx_eq!(out.x()[1].arg(), 0.5 + PI / 2.0);
        assert_approx_eq!(out.y()[0].arg(), 0.5 + PI / 2.0);
    }
}
