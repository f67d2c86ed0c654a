//! Docker-backed factory utilities.

use cask_broker::Broker;
use cask_client::FactoryOptions;
use cask_core::ErrorKind;
use std::sync::Arc;

/// Start a Docker-backed broker for `options`, skipping if Docker is
/// unavailable or SKIP_POSTGRES_TESTS is set.
#[allow(dead_code)]
pub async fn docker_broker_or_skip(options: &FactoryOptions) -> Option<Arc<Broker>> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    let broker = Broker::from_config(&options.to_config()).expect("valid configuration");
    match broker.services().await {
        Ok(_) => Some(broker),
        Err(err) if err.kind == ErrorKind::ServerStartup => {
            eprintln!("Skipping PostgreSQL test (Docker unavailable): {err}");
            None
        }
        Err(err) => panic!("broker setup failed: {err}"),
    }
}
