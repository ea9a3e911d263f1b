//! Signal quality metrics
//!
//! Blind receivers recover symbols only up to the symmetries of
//! the constellation and the channel: a quarter-turn phase
//! ambiguity for square constellations, an exchange of the two
//! polarizations, and a small timing offset if the equalizer
//! settles on a neighboring tap. [`align()`] searches these
//! ambiguities and reports the symbol error rate of the best
//! alignment.

use std::f64::consts::FRAC_PI_2;

use crate::constellation::Constellation;
use crate::waveform::{Sample, Waveform, POLARIZATIONS};

/// Normalized mean-square error, `Σ|a − r|² / Σ|r|²`
///
/// Sums over both polarizations and the common length of the
/// two waveforms. Returns 0.0 if the reference has no energy.
pub fn normalized_mse(actual: &Waveform, reference: &Waveform) -> f64 {
    let mut err = 0.0f64;
    let mut energy = 0.0f64;
    for (a, r) in actual.pairs().zip(reference.pairs()) {
        for p in 0..POLARIZATIONS {
            err += (a[p] - r[p]).norm_sqr();
            energy += r[p].norm_sqr();
        }
    }
    if energy > 0.0 {
        err / energy
    } else {
        0.0
    }
}

/// Number of hard-decision errors of `rx` against `tx`
///
/// Compares the common length of the two sequences.
pub fn symbol_errors(rx: &[Sample], tx: &[Sample], constellation: &Constellation) -> usize {
    rx.iter()
        .zip(tx.iter())
        .filter(|(r, t)| constellation.nearest_index(**r) != constellation.nearest_index(**t))
        .count()
}

/// Symbol error rate of `rx` against `tx`
pub fn symbol_error_rate(rx: &[Sample], tx: &[Sample], constellation: &Constellation) -> f64 {
    let len = usize::min(rx.len(), tx.len());
    if len == 0 {
        return 0.0;
    }
    symbol_errors(rx, tx, constellation) as f64 / len as f64
}

/// Signal-to-noise ratio of `rx` against `tx` (dB)
///
/// `E|tx|² / E|rx − tx|²`. Returns infinity for a perfect match.
pub fn snr_db(rx: &[Sample], tx: &[Sample]) -> f64 {
    let mut sig = 0.0f64;
    let mut noise = 0.0f64;
    for (r, t) in rx.iter().zip(tx.iter()) {
        sig += t.norm_sqr();
        noise += (r - t).norm_sqr();
    }
    10.0 * f64::log10(sig / noise)
}

/// RMS error vector magnitude of `rx` against `tx`
///
/// As a fraction of the reference RMS amplitude.
pub fn evm_rms(rx: &[Sample], tx: &[Sample]) -> f64 {
    f64::powf(10.0, -snr_db(rx, tx) / 20.0)
}

/// Best alignment of one recovered polarization
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PolAlignment {
    /// Quarter turns applied to the received symbols
    pub quarter_turns: u8,

    /// Received symbol `i` matches transmitted symbol `i + lag`
    pub lag: isize,

    /// Symbol errors at this alignment
    pub errors: usize,

    /// Symbols compared
    pub symbols: usize,
}

impl PolAlignment {
    /// Symbol error rate
    pub fn ser(&self) -> f64 {
        if self.symbols == 0 {
            0.0
        } else {
            self.errors as f64 / self.symbols as f64
        }
    }

    /// Rotate and shift `rx` into alignment with `tx`
    ///
    /// Returns the aligned `(rx, tx)` pairs.
    pub fn apply(&self, rx: &[Sample], tx: &[Sample]) -> (Vec<Sample>, Vec<Sample>) {
        let rot = Sample::from_polar(1.0, FRAC_PI_2 * self.quarter_turns as f64);
        overlap(rx, tx, self.lag)
            .map(|(r, t)| (r * rot, t))
            .unzip()
    }

    // SER, or worse than anything for the initial search state
    fn ser_or_worst(&self) -> f64 {
        if self.errors == usize::MAX {
            f64::INFINITY
        } else {
            self.ser()
        }
    }
}

/// Best alignment of a dual-polarization symbol stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Alignment {
    /// True if received X matches transmitted Y
    pub swapped: bool,

    /// Alignment of each received polarization
    pub pols: [PolAlignment; POLARIZATIONS],
}

impl Alignment {
    /// Total symbol error rate over both polarizations
    pub fn ser(&self) -> f64 {
        let errors: usize = self.pols.iter().map(|p| p.errors).sum();
        let symbols: usize = self.pols.iter().map(|p| p.symbols).sum();
        if symbols == 0 {
            0.0
        } else {
            errors as f64 / symbols as f64
        }
    }
}

/// Resolve phase ambiguity and lag for one polarization
///
/// Tries every quarter-turn rotation and every lag in
/// `-max_lag..=max_lag`, keeping the one with the fewest
/// errors.
pub fn align_pol(
    rx: &[Sample],
    tx: &[Sample],
    constellation: &Constellation,
    max_lag: usize,
) -> PolAlignment {
    let max_lag = max_lag as isize;
    let mut best = PolAlignment {
        quarter_turns: 0,
        lag: 0,
        errors: usize::MAX,
        symbols: 0,
    };
    for lag in -max_lag..=max_lag {
        for quarter_turns in 0..4u8 {
            let rot = Sample::from_polar(1.0, FRAC_PI_2 * quarter_turns as f64);
            let mut errors = 0;
            let mut symbols = 0;
            for (r, t) in overlap(rx, tx, lag) {
                symbols += 1;
                if constellation.nearest_index(r * rot) != constellation.nearest_index(t) {
                    errors += 1;
                }
            }
            let candidate = PolAlignment {
                quarter_turns,
                lag,
                errors,
                symbols,
            };
            if symbols > 0 && candidate.ser() < best.ser_or_worst() {
                best = candidate;
            }
        }
    }
    if best.errors == usize::MAX {
        best.errors = 0;
    }
    best
}

/// Resolve phase, lag and polarization-swap ambiguities
pub fn align(
    rx: &Waveform,
    tx: &Waveform,
    constellation: &Constellation,
    max_lag: usize,
) -> Alignment {
    let straight = Alignment {
        swapped: false,
        pols: [
            align_pol(rx.x(), tx.x(), constellation, max_lag),
            align_pol(rx.y(), tx.y(), constellation, max_lag),
        ],
    };
    let swapped = Alignment {
        swapped: true,
        pols: [
            align_pol(rx.x(), tx.y(), constellation, max_lag),
            align_pol(rx.y(), tx.x(), constellation, max_lag),
        ],
    };
    if swapped.ser() < straight.ser() {
        swapped
    } else {
        straight
    }
}

// Pairs of (rx[i], tx[i + lag]) where both exist
fn overlap<'a>(
    rx: &'a [Sample],
    tx: &'a [Sample],
    lag: isize,
) -> impl Iterator<Item = (Sample, Sample)> + 'a {
    let (rx_start, tx_start) = if lag >= 0 {
        (0usize, lag as usize)
    } else {
        ((-lag) as usize, 0usize)
    };
    let rx = rx.get(rx_start..).unwrap_or(&[]);
    let tx = tx.get(tx_start..).unwrap_or(&[]);
    rx.iter().copied().zip(tx.iter().copied())
}
