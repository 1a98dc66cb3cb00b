//! Error types for the ternify workspace.
//!
//! Pure tensor code (quantise, forward passes) stays on `candle_core::Result`.
//! Everything that crosses an API boundary (calibration, graph rewriting,
//! adapter construction) returns [`Result`] so callers can match on the
//! failure class instead of parsing strings.

use thiserror::Error;

/// Result type for ternify operations.
pub type Result<T> = std::result::Result<T, TernifyError>;

/// Errors that can occur during conversion, calibration, or adaptation.
#[derive(Debug, Error)]
pub enum TernifyError {
    /// Calibration invoked with zero activation samples. Fatal to that call;
    /// never retried internally.
    #[error("calibration requires non-empty activation samples")]
    EmptyCalibrationData,

    /// A dotted module path could not be resolved to an existing parent/child
    /// pair. Indicates a structural inconsistency in the module tree.
    #[error("unresolved module path: {0}")]
    UnresolvedPath(String),

    /// Dimension disagreement detected at construction time (adapter rank vs
    /// base features, `load_state` buffers vs module shape).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Invalid configuration value (dropout outside [0, 1), zero layer width).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor operation failed.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TernifyError {
    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        let e = TernifyError::UnresolvedPath("block.0.proj".into());
        assert_eq!(e.to_string(), "unresolved module path: block.0.proj");

        let e = TernifyError::shape_mismatch("(4, 8)", "(4, 6)");
        assert_eq!(e.to_string(), "shape mismatch: expected (4, 8), got (4, 6)");
    }
}
