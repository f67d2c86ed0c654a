//! Factories over an in-memory broker.

use cask_broker::{Broker, FixedAdmin};
use cask_client::{BrokerTarget, TestDatabaseFactory, TestDatabaseFactoryBuilder};
use cask_core::config::{AppConfig, ServerConfig};
use cask_provision::{DatabaseAdmin, MemoryAdmin};
use cask_runtime::MemoryRuntime;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A broker over in-memory backends.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct MemoryBroker {
    pub broker: Arc<Broker>,
    pub runtime: MemoryRuntime,
    pub admin: Arc<MemoryAdmin>,
}

#[allow(dead_code)]
impl MemoryBroker {
    pub fn new() -> Self {
        let config = AppConfig {
            server: ServerConfig {
                startup_timeout_secs: 1,
                readiness_poll_ms: 10,
                liveness_interval_secs: 1,
                ..Default::default()
            },
            ..Default::default()
        };
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

    /// A factory builder talking to this broker in-process.
    pub fn factory(&self) -> TestDatabaseFactoryBuilder {
        TestDatabaseFactory::builder()
            .broker(BrokerTarget::Embedded(self.broker.clone()))
            .label("client-test")
    }

    /// Non-template databases that currently exist.
    pub async fn scratch_databases(&self) -> Vec<String> {
        self.admin.list_databases(false).await.unwrap()
    }

    /// Templates that currently exist.
    pub async fn templates(&self) -> Vec<String> {
        self.admin.list_databases(true).await.unwrap()
    }

    /// Wait until no non-template database is left.
    pub async fn wait_for_teardown(&self) {
        for _ in 0..100 {
            if self.scratch_databases().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "databases left after teardown: {:?}",
            self.scratch_databases().await
        );
    }
}

/// Counts hook invocations.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

#[allow(dead_code)]
impl Counter {
    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
