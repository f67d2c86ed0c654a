//! Broker test utilities.

use cask_broker::{Broker, FixedAdmin};
use cask_core::config::{AppConfig, ServerConfig};
use cask_provision::{DatabaseAdmin, MemoryAdmin};
use cask_runtime::MemoryRuntime;
use std::sync::Arc;

/// A broker over in-memory backends.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub runtime: MemoryRuntime,
    pub admin: Arc<MemoryAdmin>,
}

#[allow(dead_code)]
impl TestBroker {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let runtime = MemoryRuntime::new();
        let admin = Arc::new(MemoryAdmin::new());
        let broker = Broker::new(
            &config,
            Arc::new(runtime.clone()),
            Arc::new(FixedAdmin(admin.clone() as Arc<dyn DatabaseAdmin>)),
        );
        Self {
            broker,
            runtime,
            admin,
        }
    }

    /// Non-template databases that currently exist.
    pub async fn scratch_databases(&self) -> Vec<String> {
        self.admin.list_databases(false).await.unwrap()
    }

    /// Templates that currently exist.
    pub async fn templates(&self) -> Vec<String> {
        self.admin.list_databases(true).await.unwrap()
    }
}

/// Configuration with short timeouts for in-memory tests.
#[allow(dead_code)]
pub fn fast_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            startup_timeout_secs: 1,
            readiness_poll_ms: 10,
            liveness_interval_secs: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}
