use cask_core::config::{ProxyConfig, ServerConfig};
use cask_runtime::{MemoryRuntime, ServerManager};
use std::sync::Arc;

/// Server configuration with short timeouts for in-memory tests.
pub fn fast_server_config() -> ServerConfig {
    ServerConfig {
        startup_timeout_secs: 1,
        readiness_poll_ms: 10,
        liveness_interval_secs: 1,
        ..Default::default()
    }
}

/// A manager over a fresh in-memory runtime.
#[allow(dead_code)]
pub fn memory_manager(proxy: ProxyConfig) -> (MemoryRuntime, ServerManager) {
    let runtime = MemoryRuntime::new();
    let manager = ServerManager::new(Arc::new(runtime.clone()), fast_server_config(), proxy);
    (runtime, manager)
}
