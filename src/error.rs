//! Canonical error type for the crate.

use thiserror::Error;

/// Top-level error type exposed by `seawire`.
#[derive(Debug, Error)]
pub enum SeawireError {
    /// Codec-layer failure.
    #[error("codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    /// Configuration failure.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Module loader failure.
    #[cfg(unix)]
    #[error("module error: {0}")]
    Module(#[from] crate::module::ModuleError),

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Canonical result alias used by `seawire` public APIs.
pub type Result<T> = std::result::Result<T, SeawireError>;
