//! Container runtime trait definitions.

use crate::error::RuntimeResult;
use async_trait::async_trait;
use cask_core::config::BindMount;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything needed to launch one container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub tag: String,
    /// Container name; doubles as its host name on the private network.
    pub name: String,
    pub network: Option<String>,
    pub env: Vec<(String, String)>,
    pub cmd: Vec<String>,
    /// Port inside the container to publish on the host.
    pub exposed_port: u16,
    pub bind_mounts: Vec<BindMount>,
    /// Paths mounted as tmpfs.
    pub tmpfs: Vec<String>,
    pub startup_timeout: Duration,
}

impl ContainerSpec {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Output of a command executed inside a container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Launches isolated containers on private networks.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Allocate a private network and return its id.
    async fn create_network(&self) -> RuntimeResult<String>;

    /// Start a container; returns once the container process is running.
    async fn start(&self, spec: ContainerSpec) -> RuntimeResult<Box<dyn RunningContainer>>;
}

/// A running container.
#[async_trait]
pub trait RunningContainer: Send + Sync {
    /// Container name (its host name on the private network).
    fn name(&self) -> &str;

    /// Host through which published ports are reachable.
    async fn host(&self) -> RuntimeResult<String>;

    /// Host port published for `port` inside the container.
    async fn mapped_port(&self, port: u16) -> RuntimeResult<u16>;

    /// Run a command to completion inside the container.
    async fn exec(&self, command: &[String]) -> RuntimeResult<ExecOutput>;

    /// Stop the container. Stopping twice is not an error.
    async fn stop(&self) -> RuntimeResult<()>;
}
