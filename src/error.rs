//! Error types for model construction and training.

use thiserror::Error;

/// Errors surfaced by configuration validation and training.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AirError {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the offending value.
        reason: String,
    },

    /// A distribution parameter or probability turned non-finite.
    ///
    /// Only raised when the model runs with `debug` enabled.
    #[error("non-finite values in {what}")]
    NonFinite {
        /// The quantity that failed the check.
        what: String,
    },
}

impl AirError {
    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a non-finite value error.
    pub fn non_finite(what: impl Into<String>) -> Self {
        Self::NonFinite { what: what.into() }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AirError>;
