//! Calling-context side of Cask.
//!
//! A [`TestDatabaseFactory`] hands out isolated PostgreSQL databases to tests.
//! Each distinct parameter value is populated once by the factory's fixture
//! hook and frozen into a template; every request clones that template.
//!
//! ```no_run
//! use cask_client::{GetTestDatabaseOptions, HookContext, TestDatabaseFactory};
//!
//! # async fn example() -> Result<(), cask_client::ClientError> {
//! let factory = TestDatabaseFactory::builder()
//!     .before_template_is_baked(|ctx: HookContext| async move {
//!         sqlx::query("CREATE TABLE users (id INT PRIMARY KEY)")
//!             .execute(&ctx.pool)
//!             .await?;
//!         Ok::<_, anyhow::Error>(())
//!     })
//!     .build()?;
//!
//! let ctx = factory.context().await?;
//! let db = factory
//!     .get_test_database(&ctx, Some(&"users"), GetTestDatabaseOptions::default())
//!     .await?;
//! sqlx::query("SELECT * FROM users").execute(&db.pool).await?;
//! ctx.end().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod context;
pub mod error;
pub mod factory;
pub mod hook;
pub mod shared;

pub use connection::{Connection, Exchange};
pub use context::{TestContext, TestDatabase};
pub use error::{ClientError, ClientResult};
pub use factory::{
    BrokerTarget, ContainerOptions, DEFAULT_POOL_MAX_CONNECTIONS, FactoryOptions,
    GetTestDatabaseOptions, PgbouncerOptions, TestDatabaseFactory, TestDatabaseFactoryBuilder,
};
pub use hook::{AdditionalTemplate, FixtureHook, HookContext};
pub use shared::{SharedBroker, shared_broker, shutdown_shared_brokers};

pub use cask_core::config::{BindMode, BindMount, PoolMode};
pub use cask_core::{ConnectionDetails, ErrorKind, WireError};
pub use cask_runtime::ExecOutput;

/// No parameters, for calls that take `Option<&P>`.
pub const NO_PARAMS: Option<&'static serde_json::Value> = None;
