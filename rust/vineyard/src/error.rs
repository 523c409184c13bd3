use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use vineyard_wire::{CodecError, RemoteError};

/// Startup-time registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("service {0:?} is already registered")]
    DuplicateRegistration(String),

    #[error("service name is empty")]
    EmptyServiceName,
}

/// Failures surfaced to a client caller.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("call {opaque} timed out after {timeout:?}")]
    Timeout { opaque: i32, timeout: Duration },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("call {opaque} was superseded by a newer call with the same opaque")]
    Superseded { opaque: i32 },

    #[error("no live connection")]
    NoConnection,

    /// The server answered with an error response.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CallError {
    /// The remote error, if the server answered with one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            CallError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
