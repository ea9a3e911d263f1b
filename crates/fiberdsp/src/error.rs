//! Errors raised at stage boundaries

use thiserror::Error;

/// Result type for `fiberdsp` operations
pub type Result<T> = std::result::Result<T, DspError>;

/// A rejected DSP call
///
/// Every error indicates a misconfiguration or an unusable
/// input. No stage retries or corrects itself; the caller
/// decides what to do. After a [`NumericDivergence`](DspError::NumericDivergence),
/// restart the equalizer from a fresh state.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum DspError {
    /// Buffer or polarization lengths disagree
    #[error("shape mismatch: {what} (expected {expected}, got {actual})")]
    ShapeMismatch {
        /// What was being compared
        what: &'static str,
        /// Required length
        expected: usize,
        /// Length actually supplied
        actual: usize,
    },

    /// Split-step propagation needs at least one step
    #[error("invalid step count: split-step propagation requires at least one step")]
    InvalidStepCount,

    /// Equalizer tap length is zero or longer than the input block
    #[error("invalid tap length {taps}: must be between 1 and the block length ({block})")]
    TapLengthInvalid {
        /// Requested taps
        taps: usize,
        /// Input block length, in samples
        block: usize,
    },

    /// Decision-directed operation needs reference points
    #[error("decision-directed mode selected without a reference constellation")]
    EmptyConstellation,

    /// Adaptive filter left its sanity bounds
    #[error("adaptive filter diverged after {updates} updates: {what} = {value:e}")]
    NumericDivergence {
        /// Quantity which diverged
        what: &'static str,
        /// Offending value
        value: f64,
        /// Number of updates performed before divergence
        updates: u64,
    },

    /// Sample rate is not a positive integer multiple of the symbol rate
    #[error("sample rate {sample_rate} Hz is not an integer multiple of symbol rate {symbol_rate} Hz")]
    Oversampling {
        /// Sampling rate (Hz)
        sample_rate: f64,
        /// Symbol rate (Hz)
        symbol_rate: f64,
    },

    /// A parameter is outside its permitted range
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

impl DspError {
    /// Convenience constructor for length disagreements
    pub(crate) fn shape(what: &'static str, expected: usize, actual: usize) -> Self {
        DspError::ShapeMismatch {
            what,
            expected,
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = DspError::shape("polarization Y length", 4, 3);
        assert_eq!(
            "shape mismatch: polarization Y length (expected 4, got 3)",
            err.to_string()
        );

        let err = DspError::TapLengthInvalid { taps: 0, block: 16 };
        assert!(err.to_string().contains("invalid tap length 0"));
    }
}
