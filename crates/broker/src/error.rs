//! Broker error types.

use cask_core::{CodecError, ErrorKind, WireError};
use cask_provision::ProvisionError;
use cask_runtime::{RuntimeError, StartupFailure};

/// Broker error type.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Startup(#[from] StartupFailure),

    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl BrokerError {
    /// Failure category reported to calling contexts.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Startup(_) | Self::Config(_) => ErrorKind::ServerStartup,
            Self::Provision(_) => ErrorKind::Provision,
            Self::Runtime(RuntimeError::Exec(_)) => ErrorKind::Exec,
            Self::Runtime(_) => ErrorKind::ServerStartup,
            Self::Protocol(_) | Self::Codec(_) => ErrorKind::ProtocolViolation,
            Self::Io(_) => ErrorKind::ContextVanished,
            Self::Wire(e) => e.kind,
        }
    }

    /// Convert into the form sent over the wire.
    pub fn to_wire(&self) -> WireError {
        match self {
            Self::Wire(e) => e.clone(),
            other => WireError::new(other.kind(), other.to_string()),
        }
    }
}

impl From<BrokerError> for WireError {
    fn from(err: BrokerError) -> Self {
        err.to_wire()
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
