//! Transport layer errors.

use thiserror::Error;

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Endpoint setup or connection establishment failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid transport configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Protocol error from core.
    #[error("Protocol error: {0}")]
    Protocol(#[from] wn_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
