//! Error types for engine operations
//!
//! Only caller mistakes surface as errors. Numerically degenerate situations
//! (singular matrices, zero-norm vectors, empty batches) are absorbed by the
//! engines and reported through low-confidence results instead.

use std::fmt;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error type for forecasting engine operations
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// An operation was called before weights exist
    NotInitialized { operation: String },

    /// A state dimension name did not match any known dimension
    UnknownDimension { name: String },

    /// A dimension index is outside the configured state size
    InvalidDimension { index: usize, dimensions: usize },

    /// A vector did not have the configured dimensionality
    DimensionMismatch {
        expected: usize,
        got: usize,
        context: String,
    },

    /// Invalid configuration parameter
    InvalidConfiguration {
        parameter: String,
        value: String,
        reason: String,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotInitialized { operation } => {
                write!(
                    f,
                    "Engine not initialized: operation '{}' requires weights. Call initialize() or load_weights() first.",
                    operation
                )
            }
            EngineError::UnknownDimension { name } => {
                write!(f, "Unknown state dimension '{}'", name)
            }
            EngineError::InvalidDimension { index, dimensions } => {
                write!(
                    f,
                    "Dimension index {} is out of range for a {}-dimensional state",
                    index, dimensions
                )
            }
            EngineError::DimensionMismatch {
                expected,
                got,
                context,
            } => {
                write!(
                    f,
                    "Dimension mismatch in {}: expected {} dimensions, got {}",
                    context, expected, got
                )
            }
            EngineError::InvalidConfiguration {
                parameter,
                value,
                reason,
            } => {
                write!(
                    f,
                    "Invalid configuration for parameter '{}' with value '{}': {}",
                    parameter, value, reason
                )
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    pub fn not_initialized(operation: impl Into<String>) -> Self {
        EngineError::NotInitialized {
            operation: operation.into(),
        }
    }

    pub fn unknown_dimension(name: impl Into<String>) -> Self {
        EngineError::UnknownDimension { name: name.into() }
    }

    pub fn dimension_mismatch(expected: usize, got: usize, context: impl Into<String>) -> Self {
        EngineError::DimensionMismatch {
            expected,
            got,
            context: context.into(),
        }
    }

    pub fn invalid_config(
        parameter: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        EngineError::InvalidConfiguration {
            parameter: parameter.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Fail with [`EngineError::DimensionMismatch`] unless `got == expected`.
pub(crate) fn ensure_dim(expected: usize, got: usize, context: &str) -> EngineResult<()> {
    if expected == got {
        Ok(())
    } else {
        Err(EngineError::dimension_mismatch(expected, got, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_initialized_display() {
        let err = EngineError::not_initialized("predict");
        let msg = err.to_string();
        assert!(msg.contains("predict"));
        assert!(msg.contains("initialize()"));
    }

    #[test]
    fn test_dimension_mismatch_display() {
        let err = EngineError::dimension_mismatch(5, 3, "forward input");
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains('3'));
        assert!(msg.contains("forward input"));
    }

    #[test]
    fn test_unknown_dimension_display() {
        let err = EngineError::unknown_dimension("mood");
        assert!(err.to_string().contains("mood"));
    }

    #[test]
    fn test_ensure_dim() {
        assert!(ensure_dim(5, 5, "x").is_ok());
        assert_eq!(
            ensure_dim(5, 4, "x"),
            Err(EngineError::dimension_mismatch(5, 4, "x"))
        );
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineError>();
    }
}
