//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// A request being throttled is not an error; it is reported through
/// [`Verdict`](crate::ratelimit::Verdict).
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors while assembling configuration sources
    #[error("Configuration source error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
