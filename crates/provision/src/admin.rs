//! Administrative database operations.

use crate::error::ProvisionResult;
use async_trait::async_trait;

/// Creates, clones, freezes and drops databases on the shared server.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Create an empty database.
    async fn create_database(&self, name: &str) -> ProvisionResult<()>;

    /// Clone `template` into a new database `name`.
    ///
    /// Fails with `SourceBusy` while the template has open connections and
    /// with `NotFound` when it does not exist.
    async fn create_from_template(&self, name: &str, template: &str) -> ProvisionResult<()>;

    /// Forbid new connections to `name`, then cancel and terminate existing ones.
    ///
    /// Each step is best-effort; failures are logged, not returned.
    async fn force_disconnect(&self, name: &str) -> ProvisionResult<()>;

    /// Drop `name`. Dropping a missing database succeeds.
    async fn drop_database(&self, name: &str) -> ProvisionResult<()>;

    /// Mark `name` as a template. There is no way back.
    async fn convert_to_template(&self, name: &str) -> ProvisionResult<()>;

    async fn database_exists(&self, name: &str) -> ProvisionResult<bool>;

    /// Names of user databases (built-in ones excluded) with the given template flag.
    async fn list_databases(&self, is_template: bool) -> ProvisionResult<Vec<String>>;

    async fn count_databases(&self, is_template: bool) -> ProvisionResult<usize> {
        Ok(self.list_databases(is_template).await?.len())
    }

    async fn health_check(&self) -> ProvisionResult<()>;

    /// Release connections held by the admin. Closing twice is harmless.
    async fn close(&self);
}

/// Databases every server has and that are never listed.
pub const BUILTIN_DATABASES: [&str; 3] = ["postgres", "template0", "template1"];
