//! PostgreSQL test utilities.

use cask_provision::{PostgresAdmin, ProvisionError, ProvisionResult};
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A PostgreSQL admin wired to a throwaway container.
pub struct PostgresTestAdmin {
    pub admin: PostgresAdmin,
    pub host: String,
    pub port: u16,
    _container: ContainerAsync<Postgres>,
}

impl PostgresTestAdmin {
    pub async fn new() -> ProvisionResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                ProvisionError::Internal(format!(
                    "{POSTGRES_CONTAINER_START_ERR_PREFIX} Failed to start PostgreSQL container: {e}"
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host").to_string();
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        // Default credentials from testcontainers-modules postgres
        let admin = PostgresAdmin::connect(&Self::url_for(&host, port, "postgres"), 5).await?;
        Ok(Self {
            admin,
            host,
            port,
            _container: container,
        })
    }

    pub fn url(&self, database: &str) -> String {
        Self::url_for(&self.host, self.port, database)
    }

    fn url_for(host: &str, port: u16, database: &str) -> String {
        format!("postgres://postgres:postgres@{host}:{port}/{database}")
    }
}

/// Try to start PostgreSQL, skipping if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures cause a skip; connection errors still panic.
pub async fn postgres_or_skip() -> Option<PostgresTestAdmin> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestAdmin::new().await {
        Ok(admin) => Some(admin),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}
