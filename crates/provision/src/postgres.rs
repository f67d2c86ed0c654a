//! PostgreSQL-backed database administration.

use crate::admin::{BUILTIN_DATABASES, DatabaseAdmin};
use crate::error::{
    ProvisionError, ProvisionResult, SQLSTATE_DUPLICATE_DATABASE, SQLSTATE_INVALID_CATALOG_NAME,
    SQLSTATE_OBJECT_IN_USE,
};
use async_trait::async_trait;
use cask_core::names::validate_identifier;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Quote a validated identifier for use in DDL.
fn quoted(name: &str) -> ProvisionResult<String> {
    validate_identifier(name)?;
    Ok(format!("\"{name}\""))
}

/// Administers databases through a pool on the server's maintenance database.
pub struct PostgresAdmin {
    pool: Pool<Postgres>,
}

impl PostgresAdmin {
    /// Connect to the maintenance database at `url`.
    pub async fn connect(url: &str, max_connections: u32) -> ProvisionResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    async fn execute(&self, sql: &str) -> ProvisionResult<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn signal_backends(&self, function: &str, name: &str) -> ProvisionResult<u64> {
        let sql = format!(
            "SELECT {function}(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()"
        );
        let signalled = sqlx::query(&sql).bind(name).execute(&self.pool).await?;
        Ok(signalled.rows_affected())
    }
}

#[async_trait]
impl DatabaseAdmin for PostgresAdmin {
    #[instrument(skip(self))]
    async fn create_database(&self, name: &str) -> ProvisionResult<()> {
        let sql = format!("CREATE DATABASE {}", quoted(name)?);
        self.execute(&sql).await.map_err(|e| match e.sqlstate().as_deref() {
            Some(SQLSTATE_DUPLICATE_DATABASE) => ProvisionError::AlreadyExists(name.to_string()),
            _ => e,
        })
    }

    #[instrument(skip(self))]
    async fn create_from_template(&self, name: &str, template: &str) -> ProvisionResult<()> {
        let sql = format!(
            "CREATE DATABASE {} WITH TEMPLATE {}",
            quoted(name)?,
            quoted(template)?
        );
        self.execute(&sql).await.map_err(|e| match e.sqlstate().as_deref() {
            Some(SQLSTATE_OBJECT_IN_USE) => ProvisionError::SourceBusy(template.to_string()),
            Some(SQLSTATE_INVALID_CATALOG_NAME) => ProvisionError::NotFound(template.to_string()),
            Some(SQLSTATE_DUPLICATE_DATABASE) => ProvisionError::AlreadyExists(name.to_string()),
            _ => e,
        })
    }

    #[instrument(skip(self))]
    async fn force_disconnect(&self, name: &str) -> ProvisionResult<()> {
        let revoke = format!("REVOKE CONNECT ON DATABASE {} FROM PUBLIC", quoted(name)?);
        if let Err(e) = self.execute(&revoke).await {
            warn!(database = %name, error = %e, "failed to revoke connect");
        }
        for function in ["pg_cancel_backend", "pg_terminate_backend"] {
            match self.signal_backends(function, name).await {
                Ok(count) => debug!(database = %name, function, count, "signalled backends"),
                Err(e) => warn!(database = %name, function, error = %e, "failed to signal backends"),
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn drop_database(&self, name: &str) -> ProvisionResult<()> {
        let sql = format!("DROP DATABASE IF EXISTS {}", quoted(name)?);
        self.execute(&sql).await
    }

    #[instrument(skip(self))]
    async fn convert_to_template(&self, name: &str) -> ProvisionResult<()> {
        let sql = format!("ALTER DATABASE {} WITH is_template TRUE", quoted(name)?);
        self.execute(&sql).await.map_err(|e| match e.sqlstate().as_deref() {
            Some(SQLSTATE_INVALID_CATALOG_NAME) => ProvisionError::NotFound(name.to_string()),
            _ => e,
        })
    }

    async fn database_exists(&self, name: &str) -> ProvisionResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn list_databases(&self, is_template: bool) -> ProvisionResult<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT datname FROM pg_database \
             WHERE datistemplate = $1 AND NOT (datname = ANY($2)) \
             ORDER BY datname",
        )
        .bind(is_template)
        .bind(&BUILTIN_DATABASES[..])
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn health_check(&self) -> ProvisionResult<()> {
        self.execute("SELECT 1").await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
