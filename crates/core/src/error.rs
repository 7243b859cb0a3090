//! Error taxonomy shared by every DP-SGD crate.

/// Errors raised by clipping, noise, accounting and calibration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DpError {
    /// Malformed or out-of-range parameters.
    #[error("invalid configuration: {msg}")]
    InvalidConfig {
        /// Human-readable error description.
        msg: String,
    },

    /// Gradient, parameter or batch structures disagree.
    #[error("shape mismatch: {msg}")]
    ShapeMismatch {
        /// Human-readable error description.
        msg: String,
    },

    /// No noise multiplier in the search range meets the privacy target.
    #[error("calibration failed: {msg}")]
    CalibrationFailed {
        /// Human-readable error description.
        msg: String,
    },

    /// A privacy loss distribution grew past the supported support size.
    #[error("numeric overflow: {msg}")]
    NumericOverflow {
        /// Human-readable error description.
        msg: String,
    },
}

/// Result type for DP operations.
pub type Result<T> = std::result::Result<T, DpError>;

impl DpError {
    /// Create an invalid configuration error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig { msg: msg.into() }
    }

    /// Create a shape mismatch error.
    pub fn shape<S: Into<String>>(msg: S) -> Self {
        Self::ShapeMismatch { msg: msg.into() }
    }

    /// Create a calibration failure.
    pub fn calibration<S: Into<String>>(msg: S) -> Self {
        Self::CalibrationFailed { msg: msg.into() }
    }

    /// Create a numeric overflow error.
    pub fn overflow<S: Into<String>>(msg: S) -> Self {
        Self::NumericOverflow { msg: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = DpError::invalid("clipping_norm must be positive, got -1");
        assert_eq!(
            err.to_string(),
            "invalid configuration: clipping_norm must be positive, got -1"
        );
        assert!(matches!(
            DpError::overflow("too many bins"),
            DpError::NumericOverflow { .. }
        ));
    }
}
