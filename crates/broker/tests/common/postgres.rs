//! Docker-backed broker utilities.

use cask_broker::Broker;
use cask_core::ErrorKind;
use cask_core::config::AppConfig;
use std::sync::Arc;

/// Start a Docker-backed broker, skipping if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only server startup failures cause a skip; other errors still panic.
#[allow(dead_code)]
pub async fn docker_broker_or_skip(config: AppConfig) -> Option<Arc<Broker>> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    let broker = Broker::from_config(&config).expect("valid configuration");
    match broker.services().await {
        Ok(_) => Some(broker),
        Err(err) if err.kind == ErrorKind::ServerStartup => {
            eprintln!("Skipping PostgreSQL test (Docker unavailable): {err}");
            None
        }
        Err(err) => panic!("broker setup failed: {err}"),
    }
}
