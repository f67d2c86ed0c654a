//! The Cask broker.
//!
//! This crate owns the shared coordinator state:
//! - Template builds, deduplicated per parameter fingerprint
//! - Keyed reuse of databases across calling contexts
//! - Teardown of each context's databases when it disconnects
//! - Protocol sessions over TCP or in-process streams
//! - Health and Prometheus metrics over HTTP

pub mod broker;
pub mod error;
pub mod keyed;
pub mod launcher;
pub mod metrics;
pub mod routes;
pub mod session;
pub mod teardown;
pub mod templates;

pub use broker::{
    AdminConnector, Broker, DatabaseGrant, DatabaseRequest, FixedAdmin, HealthStatus, HookRunner,
    NoHook, PostgresConnector, Services,
};
pub use error::{BrokerError, BrokerResult};
pub use launcher::{connect_in_process, serve_tcp};
pub use routes::create_router;
pub use teardown::TeardownReport;
pub use templates::{BuildState, TemplateRecord};

use cask_core::config::AppConfig;
use std::sync::Arc;

/// Create a Docker-backed broker from configuration.
pub fn from_config(config: &AppConfig) -> BrokerResult<Arc<Broker>> {
    Broker::from_config(config)
}
