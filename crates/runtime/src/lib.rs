//! Container runtime abstraction and shared server lifecycle for Cask.
//!
//! This crate provides:
//! - The `ContainerRuntime` / `RunningContainer` traits
//! - Backends: Docker (testcontainers) and in-memory
//! - `ServerManager`, which starts the shared PostgreSQL server exactly once

pub mod backends;
pub mod error;
pub mod lifecycle;
pub mod traits;

pub use backends::{docker::DockerRuntime, memory::MemoryRuntime};
pub use error::{RuntimeError, RuntimeResult, StartupFailure};
pub use lifecycle::{ServerHandle, ServerManager};
pub use traits::{ContainerRuntime, ContainerSpec, ExecOutput, RunningContainer};

use cask_core::config::{ProxyConfig, ServerConfig};
use std::sync::Arc;

/// Create a server manager backed by Docker from configuration.
pub fn from_config(server: &ServerConfig, proxy: &ProxyConfig) -> RuntimeResult<ServerManager> {
    server.validate().map_err(RuntimeError::Config)?;
    Ok(ServerManager::new(
        Arc::new(DockerRuntime::new()),
        server.clone(),
        proxy.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_rejects_invalid_server() {
        let server = ServerConfig {
            postgres_version: " ".to_string(),
            ..Default::default()
        };
        match from_config(&server, &ProxyConfig::default()) {
            Ok(_) => panic!("expected error"),
            Err(RuntimeError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn from_config_ok() {
        let manager = from_config(&ServerConfig::default(), &ProxyConfig::default()).unwrap();
        assert!(manager.get().is_none());
    }
}
