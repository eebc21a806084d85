//! Error types for the solver wrapper.
//!
//! Every fallible operation returns `Result<T, WrapperError>`; library code
//! never panics on bad input.

use thiserror::Error;

/// Result type alias for wrapper operations.
pub type WrapperResult<T> = Result<T, WrapperError>;

/// Unified error type for all wrapper operations.
///
/// # Taxonomy
///
/// 1. Fatal configuration problems (`Config`, `ShapeMismatch`) are raised at
///    construction or aggregation time and are never recoverable.
/// 2. `RefinementFailure` marks one failed sample; the caller decides whether
///    to retry with a fresh sample.
/// 3. Everything else is plumbing (state store, task runtime, I/O).
#[derive(Debug, Error)]
pub enum WrapperError {
    // ===== Configuration Errors =====
    /// Invalid configuration value.
    #[error("Configuration error: {message}")]
    Config {
        /// Description including the offending value.
        message: String,
    },

    /// Validation error raised by the config schema.
    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// Raw contribution length does not match the declared output width.
    #[error("Shape mismatch: contribution {index} has length {found}, expected {expected}")]
    ShapeMismatch {
        /// Position of the offending contribution in its batch.
        index: usize,
        /// Declared number of scalar outputs.
        expected: usize,
        /// Actual length.
        found: usize,
    },

    // ===== Execution Errors =====
    /// A refinement or solve step failed; the sample is lost.
    #[error("Refinement failure at level {level}: {message}")]
    RefinementFailure {
        /// Local level at which the chain aborted.
        level: usize,
        /// Collaborator-provided reason.
        message: String,
    },

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid wrapper state: expected {expected}, found {found}")]
    InvalidState {
        /// State required by the operation.
        expected: String,
        /// Current state.
        found: String,
    },

    /// A dispatched task panicked or its result slot was lost.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    // ===== State Store Errors =====
    /// Serialized state failed its digest check.
    #[error("State integrity violation for run {run_id} level {level}: hash mismatch")]
    StateIntegrity {
        /// Run identifier of the blob.
        run_id: u64,
        /// Level of the blob.
        level: usize,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== I/O Errors =====
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WrapperError {
    /// Create a configuration error with a message.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a refinement failure for the given level.
    #[must_use]
    pub fn refinement(level: usize, message: impl Into<String>) -> Self {
        Self::RefinementFailure {
            level,
            message: message.into(),
        }
    }

    /// Create a lifecycle error.
    #[must_use]
    pub fn invalid_state(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create a task failure.
    #[must_use]
    pub fn task(message: impl Into<String>) -> Self {
        Self::TaskFailed(message.into())
    }

    /// Check if this error is a fatal configuration problem.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::Validation(_) | Self::ShapeMismatch { .. }
        )
    }

    /// Check if the failed sample may be retried by the caller.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RefinementFailure { .. })
    }
}
