//! Error taxonomy for the conformance run
//!
//! Only the fatal stages produce errors. A numerical mismatch is not an
//! error: it is reported through [`crate::debug::ComparisonReport`].

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors raised before a verdict can be reached
#[derive(Debug, Error)]
pub enum ConformanceError {
    /// A case violates its construction invariants
    #[error("invalid configuration `{case}`: {reason}")]
    Configuration {
        /// Case name
        case: String,
        /// What is wrong with it
        reason: String,
    },

    /// The trace artifact could not be written
    #[error("export to {path:?} failed: {reason}")]
    Export {
        /// Target artifact path
        path: PathBuf,
        /// Underlying cause
        reason: String,
    },

    /// The external conversion tool failed or produced nothing usable
    #[error("conversion of {artifact:?} failed: {reason}")]
    Conversion {
        /// Artifact handed to the converter
        artifact: PathBuf,
        /// Underlying cause
        reason: String,
    },

    /// The converted model could not be executed
    #[error("execution failed: {0}")]
    Execution(String),

    /// The reference evaluation or the comparison itself could not run
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// Tensor operation error
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    /// Filesystem error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConformanceError {
    /// Shorthand for a configuration error
    pub fn configuration(case: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            case: case.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a conversion error
    pub fn conversion(artifact: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Conversion {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for adapter and construction boundaries
pub type Result<T> = std::result::Result<T, ConformanceError>;
