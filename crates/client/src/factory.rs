//! Test database factory.

use crate::connection::Connection;
use crate::context::{TestContext, TestDatabase};
use crate::error::{ClientError, ClientResult};
use crate::hook::{BoxedHook, FixtureHook, HookChannel, HookContext, boxed};
use crate::shared;
use cask_broker::{Broker, connect_in_process};
use cask_core::config::{AppConfig, BindMount, PoolMode, ProxyConfig};
use cask_core::{BrokerMessage, ClientMessage, ConnectionDetails, FrameId, HookOutcome};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Default size of the pools handed out with test databases.
pub const DEFAULT_POOL_MAX_CONNECTIONS: u32 = 5;

/// Server container options.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContainerOptions {
    pub bind_mounts: Vec<BindMount>,
}

/// Connection-pooling proxy options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PgbouncerOptions {
    pub enabled: bool,
    pub version: String,
    pub pool_mode: PoolMode,
}

impl Default for PgbouncerOptions {
    fn default() -> Self {
        let proxy = ProxyConfig::default();
        Self {
            enabled: proxy.enabled,
            version: proxy.version,
            pool_mode: proxy.pool_mode,
        }
    }
}

/// Options selecting which shared broker a factory talks to.
///
/// Factories with equal options share one broker (and so one server and one
/// template cache) per process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FactoryOptions {
    pub postgres_version: String,
    pub container: ContainerOptions,
    pub pgbouncer: PgbouncerOptions,
    /// Splits otherwise identical options into separate brokers.
    pub worker_dedupe_key: Option<String>,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            postgres_version: cask_core::DEFAULT_POSTGRES_VERSION.to_string(),
            container: ContainerOptions::default(),
            pgbouncer: PgbouncerOptions::default(),
            worker_dedupe_key: None,
        }
    }
}

impl FactoryOptions {
    /// Broker configuration these options select.
    pub fn to_config(&self) -> AppConfig {
        let mut config = AppConfig::default();
        config.server.postgres_version = self.postgres_version.clone();
        config.server.bind_mounts = self.container.bind_mounts.clone();
        config.proxy.enabled = self.pgbouncer.enabled;
        config.proxy.version = self.pgbouncer.version.clone();
        config.proxy.pool_mode = self.pgbouncer.pool_mode;
        config
    }
}

/// Where a factory finds its broker.
#[derive(Clone, Default)]
pub enum BrokerTarget {
    /// The process-wide broker for the factory's options.
    #[default]
    Shared,
    /// A `caskd` daemon listening at this address.
    Tcp(String),
    /// A broker owned by the caller.
    Embedded(Arc<Broker>),
}

/// Per-request options.
#[derive(Clone, Debug, Default)]
pub struct GetTestDatabaseOptions {
    /// Requests with the same parameters and key get the same database across
    /// every context of the broker. Keyed databases outlive the context that
    /// created them.
    pub database_dedupe_key: Option<String>,
}

impl GetTestDatabaseOptions {
    pub fn dedupe_key(key: impl Into<String>) -> Self {
        Self {
            database_dedupe_key: Some(key.into()),
        }
    }
}

/// Builder for [`TestDatabaseFactory`].
pub struct TestDatabaseFactoryBuilder {
    options: FactoryOptions,
    target: BrokerTarget,
    hook: Option<BoxedHook>,
    pool_max_connections: u32,
    label: Option<String>,
}

impl Default for TestDatabaseFactoryBuilder {
    fn default() -> Self {
        Self {
            options: FactoryOptions::default(),
            target: BrokerTarget::default(),
            hook: None,
            pool_max_connections: DEFAULT_POOL_MAX_CONNECTIONS,
            label: None,
        }
    }
}

impl TestDatabaseFactoryBuilder {
    pub fn options(mut self, options: FactoryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn postgres_version(mut self, version: impl Into<String>) -> Self {
        self.options.postgres_version = version.into();
        self
    }

    pub fn bind_mount(mut self, mount: BindMount) -> Self {
        self.options.container.bind_mounts.push(mount);
        self
    }

    pub fn pgbouncer(mut self, pgbouncer: PgbouncerOptions) -> Self {
        self.options.pgbouncer = pgbouncer;
        self
    }

    pub fn worker_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.options.worker_dedupe_key = Some(key.into());
        self
    }

    /// Hook run once per distinct parameter value before its template is frozen.
    pub fn before_template_is_baked<H: FixtureHook>(mut self, hook: H) -> Self {
        self.hook = Some(boxed(hook));
        self
    }

    pub fn broker(mut self, target: BrokerTarget) -> Self {
        self.target = target;
        self
    }

    pub fn pool_max_connections(mut self, max: u32) -> Self {
        self.pool_max_connections = max;
        self
    }

    /// Label reported to the broker in the handshake, for its logs.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn build(self) -> ClientResult<TestDatabaseFactory> {
        self.options
            .to_config()
            .validate()
            .map_err(ClientError::Config)?;
        if self.pool_max_connections == 0 {
            return Err(ClientError::Config(
                "pool_max_connections cannot be 0".to_string(),
            ));
        }
        Ok(TestDatabaseFactory {
            inner: Arc::new(FactoryInner {
                options: self.options,
                target: self.target,
                hook: self.hook,
                pool_max_connections: self.pool_max_connections,
                label: self.label,
            }),
        })
    }
}

struct FactoryInner {
    options: FactoryOptions,
    target: BrokerTarget,
    hook: Option<BoxedHook>,
    pool_max_connections: u32,
    label: Option<String>,
}

/// Hands out isolated test databases built from hook-populated templates.
#[derive(Clone)]
pub struct TestDatabaseFactory {
    inner: Arc<FactoryInner>,
}

impl TestDatabaseFactory {
    pub fn builder() -> TestDatabaseFactoryBuilder {
        TestDatabaseFactoryBuilder::default()
    }

    pub fn options(&self) -> &FactoryOptions {
        &self.inner.options
    }

    pub(crate) fn pool_max_connections(&self) -> u32 {
        self.inner.pool_max_connections
    }

    /// Open a calling context. Databases requested through it are dropped
    /// when it ends.
    pub async fn context(&self) -> ClientResult<TestContext> {
        let label = self.inner.label.clone();
        let connection = match &self.inner.target {
            BrokerTarget::Shared => {
                let broker = shared::shared_broker(&self.inner.options)?;
                Connection::open(broker.connect(), label).await?
            }
            BrokerTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Connection::open(stream, label).await?
            }
            BrokerTarget::Embedded(broker) => {
                Connection::open(connect_in_process(broker), label).await?
            }
        };
        Ok(TestContext::new(connection))
    }

    /// Get a test database for `params`.
    ///
    /// Pass `None` for no parameters; `Some(&Value::Null)` is a distinct value.
    pub async fn get_test_database<P: Serialize + ?Sized>(
        &self,
        ctx: &TestContext,
        params: Option<&P>,
        options: GetTestDatabaseOptions,
    ) -> ClientResult<TestDatabase> {
        let params = params.map(serde_json::to_value).transpose()?;
        self.request_database(ctx.connection(), params, options.database_dedupe_key, 0)
            .await
    }

    /// Clone a database from a template finished inside a hook.
    pub async fn from_template(
        &self,
        ctx: &TestContext,
        template: &str,
    ) -> ClientResult<TestDatabase> {
        let mut exchange = ctx
            .connection()
            .request(ClientMessage::CreateFromTemplate {
                template: template.to_string(),
            })?;
        let frame = exchange.next().await?;
        self.ready(frame.body)
    }

    pub(crate) fn request_database<'a>(
        &'a self,
        connection: &'a Connection,
        params: Option<Value>,
        key: Option<String>,
        depth: u32,
    ) -> BoxFuture<'a, ClientResult<TestDatabase>> {
        async move {
            let mut exchange = connection.request(ClientMessage::GetTestDatabase {
                params: params.clone(),
                key,
                depth,
            })?;
            loop {
                let frame = exchange.next().await?;
                match frame.body {
                    BrokerMessage::RunHook {
                        connection: scratch,
                    } => {
                        let outcome = self
                            .run_hook(connection, frame.id, scratch, params.clone(), depth)
                            .await;
                        connection.notify(frame.id, ClientMessage::HookFinished { outcome })?;
                    }
                    body => return self.ready(body),
                }
            }
        }
        .boxed()
    }

    async fn run_hook(
        &self,
        connection: &Connection,
        run_hook: FrameId,
        scratch: ConnectionDetails,
        params: Option<Value>,
        depth: u32,
    ) -> HookOutcome {
        let Some(hook) = &self.inner.hook else {
            return HookOutcome::Ok {
                result: Value::Null,
            };
        };
        let pool = match lazy_pool(&scratch.connection_string, self.inner.pool_max_connections) {
            Ok(pool) => pool,
            Err(e) => {
                return HookOutcome::Failed {
                    message: e.to_string(),
                };
            }
        };

        debug!(database = %scratch.database, depth, "running fixture hook");
        let ctx = HookContext {
            connection: scratch,
            pool: pool.clone(),
            params,
            depth,
            channel: HookChannel {
                connection: connection.clone(),
                run_hook,
                factory: self.clone(),
            },
        };
        let outcome = (**hook)(ctx).await;
        pool.close().await;
        if let HookOutcome::Failed { message } = &outcome {
            warn!(error = %message, "fixture hook failed");
        }
        outcome
    }

    fn ready(&self, body: BrokerMessage) -> ClientResult<TestDatabase> {
        match body {
            BrokerMessage::DatabaseReady {
                connection,
                hook_result,
            } => TestDatabase::open(connection, hook_result, self.inner.pool_max_connections),
            BrokerMessage::Error { error } => Err(ClientError::Broker(error)),
            other => Err(ClientError::Protocol(format!(
                "unexpected {} from broker",
                other.name()
            ))),
        }
    }
}

/// Pool that connects on first use.
pub(crate) fn lazy_pool(url: &str, max_connections: u32) -> ClientResult<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_lazy(url)?)
}
