//! Error types shared across dosepilot crates.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading configuration or checking therapy data.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is present but not usable.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid TOML.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Therapy data (profile, readings) failed a consistency check.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Other error.
    #[error("Other: {0}")]
    Other(#[from] anyhow::Error),
}
