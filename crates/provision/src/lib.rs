//! Database provisioning for Cask.
//!
//! This crate provides:
//! - The `DatabaseAdmin` trait: create, clone, disconnect, drop, freeze
//! - `PostgresAdmin`, backed by an sqlx pool on the maintenance database
//! - `MemoryAdmin`, an in-memory implementation for tests

pub mod admin;
pub mod error;
pub mod memory;
pub mod postgres;

pub use admin::DatabaseAdmin;
pub use error::{ProvisionError, ProvisionResult};
pub use memory::MemoryAdmin;
pub use postgres::PostgresAdmin;

use std::sync::Arc;

/// Connect a PostgreSQL admin to the maintenance database at `url`.
pub async fn from_url(url: &str, max_connections: u32) -> ProvisionResult<Arc<dyn DatabaseAdmin>> {
    tracing::info!(max_connections, "connecting admin pool");
    let admin = PostgresAdmin::connect(url, max_connections).await?;
    admin.health_check().await?;
    Ok(Arc::new(admin) as Arc<dyn DatabaseAdmin>)
}
