//! Client error types.

use cask_core::{CodecError, ErrorKind, WireError};

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The broker answered with an error.
    #[error("{0}")]
    Broker(WireError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection to broker closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid parameters: {0}")]
    Params(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker error: {0}")]
    Setup(#[from] cask_broker::BrokerError),
}

impl ClientError {
    /// Failure category of a broker-reported error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Broker(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        Self::Broker(err)
    }
}

impl From<cask_core::Error> for ClientError {
    fn from(err: cask_core::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
