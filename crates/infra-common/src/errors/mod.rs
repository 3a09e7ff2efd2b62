//! Error types for infra-common

use thiserror::Error;

/// Result alias for infra-common operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared helpers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A configuration value could not be interpreted
    #[error("Configuration error: {0}")]
    Config(String),

    /// The global logging subscriber could not be installed
    #[error("Logging setup failed: {0}")]
    Logging(String),
}
