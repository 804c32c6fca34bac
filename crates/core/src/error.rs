//! Core error types

use thiserror::Error;

/// Core error type for Meshgate
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configuration value failed validation
    #[error("Invalid configuration value for `{field}`: {reason}")]
    Validation {
        /// Dotted path of the offending field
        field: String,
        /// Human-readable reason
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CoreError {
    /// Shorthand for a validation failure on `field`.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
