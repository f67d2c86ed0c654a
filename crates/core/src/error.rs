//! Error types for the core domain.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid database name: {0}")]
    InvalidName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broker failure categories, as reported to calling contexts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The shared server could not be started; the broker is unusable.
    ServerStartup,
    /// The fixture hook (or the build around it) failed for this fingerprint.
    TemplateBuild,
    /// The fixture hook returned data that is not plain serializable data.
    NonSerializableResult,
    /// A frame had an unexpected type or shape.
    ProtocolViolation,
    /// The calling context's channel closed while the broker waited on it.
    ContextVanished,
    /// A database could not be dropped during teardown.
    DropFailure,
    /// Creating or cloning a database failed.
    Provision,
    /// The opening handshake asked for a protocol version the broker does not speak.
    UnsupportedVersion,
    /// A command could not be executed inside the server environment.
    Exec,
}

impl ErrorKind {
    /// Stable snake_case name, used as a metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerStartup => "server_startup",
            Self::TemplateBuild => "template_build",
            Self::NonSerializableResult => "non_serializable_result",
            Self::ProtocolViolation => "protocol_violation",
            Self::ContextVanished => "context_vanished",
            Self::DropFailure => "drop_failure",
            Self::Provision => "provision",
            Self::UnsupportedVersion => "unsupported_version",
            Self::Exec => "exec",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error as it travels over the wire.
///
/// Displays as the bare message so that a hook's own error text reaches the
/// test unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, message)
    }
}
