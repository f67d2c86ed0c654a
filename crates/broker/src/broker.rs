//! The broker: shared state and the operations sessions call into.

use crate::error::{BrokerError, BrokerResult};
use crate::keyed::KeyedCache;
use crate::metrics;
use crate::teardown::{self, TeardownReport, TeardownTracker};
use crate::templates::{BuildResult, TemplateCoordinator, TemplateRecord};
use async_trait::async_trait;
use cask_core::config::{AppConfig, BrokerSettings};
use cask_core::names::{random_database_name, validate_identifier};
use cask_core::plain::check_plain;
use cask_core::{
    BrokerMessage, ConnectionDetails, ContextId, ErrorKind, Fingerprint, KeyedId, WireError,
};
use cask_provision::{DatabaseAdmin, ProvisionError, ProvisionResult};
use cask_runtime::{ContainerRuntime, DockerRuntime, ExecOutput, ServerHandle, ServerManager};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

/// Runs a calling context's fixture hook.
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Run the hook against the scratch database at `connection` and return
    /// its plain-data result.
    async fn run_hook(&self, connection: ConnectionDetails) -> Result<Value, WireError>;
}

/// A hook that does nothing and returns `null`.
pub struct NoHook;

#[async_trait]
impl HookRunner for NoHook {
    async fn run_hook(&self, _connection: ConnectionDetails) -> Result<Value, WireError> {
        Ok(Value::Null)
    }
}

/// Opens the administrative connection once the server is up.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    async fn connect(
        &self,
        server: &ServerHandle,
        pool_size: u32,
    ) -> ProvisionResult<Arc<dyn DatabaseAdmin>>;
}

/// Connects a [`cask_provision::PostgresAdmin`] to the server's maintenance database.
pub struct PostgresConnector;

#[async_trait]
impl AdminConnector for PostgresConnector {
    async fn connect(
        &self,
        server: &ServerHandle,
        pool_size: u32,
    ) -> ProvisionResult<Arc<dyn DatabaseAdmin>> {
        cask_provision::from_url(&server.admin_url(), pool_size).await
    }
}

/// Hands out an admin that already exists (e.g. `MemoryAdmin`).
pub struct FixedAdmin(pub Arc<dyn DatabaseAdmin>);

#[async_trait]
impl AdminConnector for FixedAdmin {
    async fn connect(
        &self,
        _server: &ServerHandle,
        _pool_size: u32,
    ) -> ProvisionResult<Arc<dyn DatabaseAdmin>> {
        Ok(self.0.clone())
    }
}

/// The running server and its admin connection.
#[derive(Clone)]
pub struct Services {
    pub server: Arc<ServerHandle>,
    pub admin: Arc<dyn DatabaseAdmin>,
}

/// A request for a test database.
#[derive(Clone, Debug, Default)]
pub struct DatabaseRequest {
    pub params: Option<Value>,
    pub key: Option<String>,
    pub depth: u32,
}

/// A database handed to a calling context.
#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseGrant {
    pub connection: ConnectionDetails,
    pub hook_result: Value,
}

impl From<DatabaseGrant> for BrokerMessage {
    fn from(grant: DatabaseGrant) -> Self {
        BrokerMessage::DatabaseReady {
            connection: grant.connection,
            hook_result: grant.hook_result,
        }
    }
}

/// Health summary served at `/health`.
#[derive(Clone, Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub server_started: bool,
    pub server_healthy: bool,
    pub admin_ok: bool,
    pub templates: usize,
    pub keyed_databases: usize,
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self.status, "ok" | "starting")
    }
}

fn provision_error(err: ProvisionError) -> WireError {
    BrokerError::from(err).to_wire()
}

/// Coordinator state for one shared server.
pub struct Broker {
    settings: BrokerSettings,
    admin_pool_size: u32,
    manager: ServerManager,
    connector: Arc<dyn AdminConnector>,
    services: OnceCell<Result<Services, WireError>>,
    templates: TemplateCoordinator,
    keyed: KeyedCache,
    teardown: TeardownTracker,
}

impl Broker {
    pub fn new(
        config: &AppConfig,
        runtime: Arc<dyn ContainerRuntime>,
        connector: Arc<dyn AdminConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings: config.broker.clone(),
            admin_pool_size: config.server.admin_pool_size,
            manager: ServerManager::new(runtime, config.server.clone(), config.proxy.clone()),
            connector,
            services: OnceCell::new(),
            templates: TemplateCoordinator::new(),
            keyed: KeyedCache::new(),
            teardown: TeardownTracker::new(),
        })
    }

    /// A broker running PostgreSQL in Docker.
    pub fn from_config(config: &AppConfig) -> BrokerResult<Arc<Self>> {
        config.validate().map_err(BrokerError::Config)?;
        Ok(Self::new(
            config,
            Arc::new(DockerRuntime::new()),
            Arc::new(PostgresConnector),
        ))
    }

    pub fn templates(&self) -> &TemplateCoordinator {
        &self.templates
    }

    pub fn keyed(&self) -> &KeyedCache {
        &self.keyed
    }

    pub fn teardown(&self) -> &TeardownTracker {
        &self.teardown
    }

    /// Start the server and connect the admin, once. Failures are cached.
    pub async fn services(&self) -> Result<Services, WireError> {
        self.services
            .get_or_init(|| async {
                let server = self
                    .manager
                    .start()
                    .await
                    .map_err(|e| WireError::new(ErrorKind::ServerStartup, e.to_string()))?;
                let admin = self
                    .connector
                    .connect(&server, self.admin_pool_size)
                    .await
                    .map_err(|e| {
                        WireError::new(
                            ErrorKind::ServerStartup,
                            format!("admin connection failed: {e}"),
                        )
                    })?;
                Ok(Services { server, admin })
            })
            .await
            .clone()
    }

    /// Services, if startup already completed successfully.
    pub fn started_services(&self) -> Option<Services> {
        self.services.get().and_then(|r| r.as_ref().ok().cloned())
    }

    /// Serve a database for `request`, building its template first if needed.
    #[instrument(skip_all, fields(context_id = %context, key = ?request.key, depth = request.depth))]
    pub async fn get_test_database(
        self: &Arc<Self>,
        context: ContextId,
        request: DatabaseRequest,
        hooks: Arc<dyn HookRunner>,
    ) -> Result<DatabaseGrant, WireError> {
        let _request = self.teardown.begin_request(context);
        let services = self.services().await?;
        if request.depth > self.settings.nesting_warn_depth {
            warn!(
                depth = request.depth,
                limit = self.settings.nesting_warn_depth,
                "deeply nested database request; check for hook recursion"
            );
        }

        let fingerprint = Fingerprint::of(request.params.as_ref());
        let template = self
            .templates
            .get_or_build(fingerprint, context, || {
                let broker = self.clone();
                let services = services.clone();
                let hooks = hooks.clone();
                async move {
                    broker
                        .build_template(&services, fingerprint, hooks.as_ref())
                        .await
                }
                .boxed()
            })
            .await?;

        let database = match request.key {
            Some(key) => {
                let id = KeyedId::new(fingerprint, key);
                self.keyed
                    .get_or_create(&id, || {
                        self.clone_template(&services, &template.template_name)
                    })
                    .await?
            }
            None => {
                let database = self
                    .clone_template(&services, &template.template_name)
                    .await?;
                self.own(&services, context, &database).await?;
                database
            }
        };

        Ok(DatabaseGrant {
            connection: services.server.connection_details(&database),
            hook_result: template.hook_result.clone(),
        })
    }

    /// Clone a database straight from the named template.
    #[instrument(skip(self), fields(context_id = %context))]
    pub async fn create_from_template(
        &self,
        context: ContextId,
        template: &str,
    ) -> Result<DatabaseGrant, WireError> {
        validate_identifier(template)
            .map_err(|e| provision_error(ProvisionError::from(e)))?;
        let _request = self.teardown.begin_request(context);
        let services = self.services().await?;
        let database = self.clone_template(&services, template).await?;
        self.own(&services, context, &database).await?;
        Ok(DatabaseGrant {
            connection: services.server.connection_details(&database),
            hook_result: Value::Null,
        })
    }

    /// Run a command inside the server environment.
    pub async fn exec_in_server(&self, command: &[String]) -> Result<ExecOutput, WireError> {
        let services = self.services().await?;
        services
            .server
            .exec(command)
            .await
            .map_err(|e| WireError::new(ErrorKind::Exec, e.to_string()))
    }

    /// Create a scratch database that a hook populates and later freezes.
    pub async fn start_additional_template(
        &self,
    ) -> Result<(String, ConnectionDetails), WireError> {
        let services = self.services().await?;
        let database = random_database_name();
        services
            .admin
            .create_database(&database)
            .await
            .map_err(provision_error)?;
        debug!(database = %database, "additional template started");
        let connection = services.server.connection_details(&database);
        Ok((database, connection))
    }

    /// Freeze an additional template; returns its template name.
    pub async fn finish_additional_template(&self, database: &str) -> Result<String, WireError> {
        let services = self.services().await?;
        services
            .admin
            .force_disconnect(database)
            .await
            .map_err(provision_error)?;
        services
            .admin
            .convert_to_template(database)
            .await
            .map_err(provision_error)?;
        info!(template = %database, "additional template finished");
        Ok(database.to_string())
    }

    /// Disconnect and drop a scratch database, logging failures.
    pub async fn discard_database(&self, database: &str) {
        let Some(services) = self.started_services() else {
            return;
        };
        if let Err(e) = teardown::drop_database(services.admin.as_ref(), database).await {
            metrics::DROP_FAILURES.inc();
            warn!(database = %database, error = %e, "failed to drop scratch database");
        }
    }

    /// Tear down everything `context` owns.
    pub async fn end_context(&self, context: ContextId) -> TeardownReport {
        let admin = self.started_services().map(|s| s.admin);
        self.teardown
            .on_context_ended(context, admin.as_deref(), &self.keyed)
            .await
    }

    /// Health summary; never triggers server startup.
    pub async fn health(&self) -> HealthStatus {
        let templates = self.templates.len().await;
        let keyed_databases = self.keyed.len().await;
        match self.services.get() {
            None => HealthStatus {
                status: "starting",
                server_started: false,
                server_healthy: false,
                admin_ok: false,
                templates,
                keyed_databases,
            },
            Some(Err(_)) => HealthStatus {
                status: "failed",
                server_started: false,
                server_healthy: false,
                admin_ok: false,
                templates,
                keyed_databases,
            },
            Some(Ok(services)) => {
                let server_healthy = services.server.is_healthy();
                let admin_ok = services.admin.health_check().await.is_ok();
                HealthStatus {
                    status: if server_healthy && admin_ok {
                        "ok"
                    } else {
                        "unhealthy"
                    },
                    server_started: true,
                    server_healthy,
                    admin_ok,
                    templates,
                    keyed_databases,
                }
            }
        }
    }

    /// Close the admin connection and stop the server.
    pub async fn shutdown(&self) {
        if let Some(services) = self.started_services() {
            services.admin.close().await;
        }
        if let Err(e) = self.manager.shutdown().await {
            warn!(error = %e, "failed to stop shared server");
        }
    }

    async fn build_template(
        &self,
        services: &Services,
        fingerprint: Fingerprint,
        hooks: &dyn HookRunner,
    ) -> BuildResult {
        let started = Instant::now();
        let database = random_database_name();
        services
            .admin
            .create_database(&database)
            .await
            .map_err(provision_error)?;

        let outcome = async {
            let hook_result = hooks
                .run_hook(services.server.connection_details(&database))
                .await?;
            check_plain(&hook_result)?;
            services
                .admin
                .force_disconnect(&database)
                .await
                .map_err(provision_error)?;
            services
                .admin
                .convert_to_template(&database)
                .await
                .map_err(provision_error)?;
            Ok::<_, WireError>(hook_result)
        }
        .await;
        metrics::TEMPLATE_BUILD_DURATION.observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(hook_result) => {
                metrics::TEMPLATES_BUILT.inc();
                info!(
                    fingerprint = %fingerprint.short(),
                    template = %database,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "template built"
                );
                Ok(Arc::new(TemplateRecord {
                    fingerprint,
                    template_name: database,
                    hook_result,
                }))
            }
            Err(e) => {
                metrics::TEMPLATE_BUILD_FAILURES.inc();
                warn!(
                    fingerprint = %fingerprint.short(),
                    kind = %e.kind,
                    error = %e,
                    "template build failed"
                );
                if let Err(drop_err) =
                    teardown::drop_database(services.admin.as_ref(), &database).await
                {
                    metrics::DROP_FAILURES.inc();
                    warn!(database = %database, error = %drop_err, "failed to drop scratch database");
                }
                Err(e)
            }
        }
    }

    async fn clone_template(
        &self,
        services: &Services,
        template: &str,
    ) -> Result<String, WireError> {
        let database = random_database_name();
        let timer = metrics::CLONE_DURATION.start_timer();
        services
            .admin
            .create_from_template(&database, template)
            .await
            .map_err(provision_error)?;
        timer.observe_duration();
        metrics::DATABASES_CLONED.inc();
        debug!(database = %database, template = %template, "database cloned");
        Ok(database)
    }

    async fn own(
        &self,
        services: &Services,
        context: ContextId,
        database: &str,
    ) -> Result<(), WireError> {
        if self.teardown.register_owned(context, database).await {
            return Ok(());
        }
        if let Err(e) = teardown::drop_database(services.admin.as_ref(), database).await {
            metrics::DROP_FAILURES.inc();
            warn!(database = %database, error = %e, "failed to drop orphaned database");
        }
        Err(WireError::new(
            ErrorKind::ContextVanished,
            "calling context ended before its database was ready",
        ))
    }
}
