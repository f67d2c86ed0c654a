//! Calling contexts and the databases handed out to them.

use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::factory::lazy_pool;
use cask_core::{ConnectionDetails, ContextId};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;

/// One unit of test execution.
///
/// Every database requested through a context is dropped when the context
/// ends, whether through [`TestContext::end`] or by being dropped.
pub struct TestContext {
    connection: Connection,
}

impl TestContext {
    pub(crate) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn id(&self) -> ContextId {
        self.connection.context_id()
    }

    /// End the context and wait until the broker has torn it down.
    pub async fn end(self) {
        self.connection.close();
        self.connection.closed().await;
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.connection.close();
    }
}

/// An isolated database cloned from a template.
pub struct TestDatabase {
    pub connection: ConnectionDetails,
    /// Lazily connecting pool on the database.
    pub pool: PgPool,
    /// Pool through the connection-pooling proxy, when one is enabled.
    pub proxy_pool: Option<PgPool>,
    /// Value returned by the hook that built the template.
    pub hook_result: Value,
}

impl TestDatabase {
    pub(crate) fn open(
        connection: ConnectionDetails,
        hook_result: Value,
        max_connections: u32,
    ) -> ClientResult<Self> {
        let pool = lazy_pool(&connection.connection_string, max_connections)?;
        let proxy_pool = connection
            .proxy_connection_string
            .as_deref()
            .map(|url| lazy_pool(url, max_connections))
            .transpose()?;
        Ok(Self {
            connection,
            pool,
            proxy_pool,
            hook_result,
        })
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.connection.database
    }

    pub fn hook_result_as<T: DeserializeOwned>(&self) -> ClientResult<T> {
        serde_json::from_value(self.hook_result.clone()).map_err(ClientError::from)
    }

    /// Close the pools. The database itself lives until its context ends.
    pub async fn close(&self) {
        self.pool.close().await;
        if let Some(proxy_pool) = &self.proxy_pool {
            proxy_pool.close().await;
        }
    }
}
