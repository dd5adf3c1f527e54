use thiserror::Error;

use crate::ids::PayloadId;

/// Failures of the storage collaborator.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("payload not found: {0}")]
    NotFound(PayloadId),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
