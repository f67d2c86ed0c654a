//! Runtime error types.

use std::time::Duration;
use thiserror::Error;

/// Container runtime and server lifecycle errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container error: {0}")]
    Container(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("server not ready after {0:?}")]
    NotReady(Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<testcontainers::TestcontainersError> for RuntimeError {
    fn from(err: testcontainers::TestcontainersError) -> Self {
        Self::Container(err.to_string())
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// A cached server startup failure.
///
/// Cloned to every caller of [`crate::ServerManager::start`] once startup failed.
#[derive(Clone, Debug, Error)]
#[error("server startup failed: {message}")]
pub struct StartupFailure {
    pub message: String,
}

impl From<RuntimeError> for StartupFailure {
    fn from(err: RuntimeError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}
