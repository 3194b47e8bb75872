//! Unified error handling for the client.

use crate::config::ConfigError;
use perch_engine::TransportError;

/// Client error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Engine error: {0}")]
    Engine(#[from] perch_engine::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// The transport error, if this is one.
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for service calls.
pub type Result<T> = std::result::Result<T, Error>;
