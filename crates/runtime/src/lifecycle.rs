//! Shared PostgreSQL server lifecycle.
//!
//! The server is started at most once per [`ServerManager`]. Concurrent first
//! callers share one startup and a failed startup is cached, so a broker whose
//! server never came up fails every request the same way.

use crate::error::{RuntimeError, RuntimeResult, StartupFailure};
use crate::traits::{ContainerRuntime, ContainerSpec, ExecOutput, RunningContainer};
use cask_core::config::{ProxyConfig, ServerConfig};
use cask_core::names::random_name;
use cask_core::{ConnectionDetails, POSTGRES_PORT, POSTGRES_USER, PROXY_PORT, ServerCoordinates};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Data directory inside the server container, mounted as tmpfs.
pub const PGDATA: &str = "/var/lib/postgresql/data";

/// Name of the maintenance database used for administrative connections.
pub const MAINTENANCE_DATABASE: &str = "postgres";

/// Readiness check run inside the server container.
///
/// Goes through TCP so the temporary socket-only server of the image's
/// init phase does not count as ready.
pub fn readiness_command() -> Vec<String> {
    ["pg_isready", "-h", "127.0.0.1", "-U", POSTGRES_USER]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Container spec of the shared PostgreSQL server.
pub fn server_spec(config: &ServerConfig, network: &str, name: &str) -> ContainerSpec {
    let settings = [
        format!("max_connections={}", config.max_connections),
        "fsync=off".to_string(),
        "synchronous_commit=off".to_string(),
        "full_page_writes=off".to_string(),
    ];

    ContainerSpec {
        image: config.image.clone(),
        tag: config.postgres_version.clone(),
        name: name.to_string(),
        network: Some(network.to_string()),
        env: vec![
            ("POSTGRES_HOST_AUTH_METHOD".to_string(), "trust".to_string()),
            ("PGDATA".to_string(), PGDATA.to_string()),
        ],
        cmd: settings
            .into_iter()
            .flat_map(|setting| ["-c".to_string(), setting])
            .collect(),
        exposed_port: POSTGRES_PORT,
        bind_mounts: config.bind_mounts.clone(),
        tmpfs: vec![PGDATA.to_string()],
        startup_timeout: config.startup_timeout(),
    }
}

/// Container spec of the pgbouncer proxy in front of `upstream_url`.
pub fn proxy_spec(
    config: &ProxyConfig,
    network: &str,
    name: &str,
    upstream_url: &str,
    startup_timeout: Duration,
) -> ContainerSpec {
    ContainerSpec {
        image: config.image.clone(),
        tag: config.version.clone(),
        name: name.to_string(),
        network: Some(network.to_string()),
        env: vec![
            ("DATABASE_URL".to_string(), upstream_url.to_string()),
            ("POOL_MODE".to_string(), config.pool_mode.as_str().to_string()),
            ("LISTEN_PORT".to_string(), PROXY_PORT.to_string()),
        ],
        cmd: Vec::new(),
        exposed_port: PROXY_PORT,
        bind_mounts: Vec::new(),
        tmpfs: Vec::new(),
        startup_timeout,
    }
}

/// Starts and owns the shared server.
pub struct ServerManager {
    runtime: Arc<dyn ContainerRuntime>,
    server: ServerConfig,
    proxy: ProxyConfig,
    handle: OnceCell<Result<Arc<ServerHandle>, StartupFailure>>,
}

impl ServerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, server: ServerConfig, proxy: ProxyConfig) -> Self {
        Self {
            runtime,
            server,
            proxy,
            handle: OnceCell::new(),
        }
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.server
    }

    /// Start the server, or return the outcome of the one startup already attempted.
    pub async fn start(&self) -> Result<Arc<ServerHandle>, StartupFailure> {
        self.handle
            .get_or_init(|| async {
                self.launch().await.map_err(|e| {
                    error!(error = %e, "shared server failed to start");
                    StartupFailure::from(e)
                })
            })
            .await
            .clone()
    }

    /// The handle, if startup already succeeded.
    pub fn get(&self) -> Option<Arc<ServerHandle>> {
        match self.handle.get() {
            Some(Ok(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Stop the server if it was started.
    pub async fn shutdown(&self) -> RuntimeResult<()> {
        match self.get() {
            Some(handle) => handle.shutdown().await,
            None => Ok(()),
        }
    }

    #[instrument(skip(self), fields(version = %self.server.postgres_version))]
    async fn launch(&self) -> RuntimeResult<Arc<ServerHandle>> {
        self.server.validate().map_err(RuntimeError::Config)?;

        let started = Instant::now();
        let network = self.runtime.create_network().await?;
        let server_name = random_name("cask_pg");
        let server = self
            .runtime
            .start(server_spec(&self.server, &network, &server_name))
            .await?;

        if let Err(e) = wait_until_ready(
            server.as_ref(),
            self.server.startup_timeout().saturating_sub(started.elapsed()),
            self.server.readiness_poll(),
        )
        .await
        {
            if let Err(stop_err) = server.stop().await {
                warn!(error = %stop_err, "failed to stop unready server");
            }
            return Err(e);
        }

        let coordinates = ServerCoordinates {
            host: server.host().await?,
            port: server.mapped_port(POSTGRES_PORT).await?,
            network_host: server_name,
            network_port: POSTGRES_PORT,
            username: POSTGRES_USER.to_string(),
            password: String::new(),
        };

        let (proxy, proxy_coordinates) = if self.proxy.enabled {
            let proxy_name = random_name("cask_bouncer");
            let upstream = coordinates.network_url(MAINTENANCE_DATABASE);
            let spec = proxy_spec(
                &self.proxy,
                &network,
                &proxy_name,
                &upstream,
                self.server.startup_timeout(),
            );
            let proxy = match self.runtime.start(spec).await {
                Ok(proxy) => proxy,
                Err(e) => {
                    if let Err(stop_err) = server.stop().await {
                        warn!(error = %stop_err, "failed to stop server after proxy failure");
                    }
                    return Err(e);
                }
            };
            let proxy_coordinates = ServerCoordinates {
                host: proxy.host().await?,
                port: proxy.mapped_port(PROXY_PORT).await?,
                network_host: proxy_name,
                network_port: PROXY_PORT,
                username: POSTGRES_USER.to_string(),
                password: String::new(),
            };
            (Some(proxy), Some(proxy_coordinates))
        } else {
            (None, None)
        };

        let handle = Arc::new(ServerHandle {
            server,
            proxy,
            coordinates,
            proxy_coordinates,
            network_id: network,
            healthy: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });
        spawn_liveness(Arc::downgrade(&handle), self.server.liveness_interval());

        info!(
            host = %handle.coordinates.host,
            port = handle.coordinates.port,
            network = %handle.network_id,
            proxy = handle.proxy_coordinates.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "shared server started"
        );
        Ok(handle)
    }
}

async fn wait_until_ready(
    container: &dyn RunningContainer,
    timeout: Duration,
    poll: Duration,
) -> RuntimeResult<()> {
    let check = readiness_command();
    let deadline = Instant::now() + timeout;
    loop {
        match container.exec(&check).await {
            Ok(output) if output.success() => return Ok(()),
            Ok(output) => debug!(exit_code = output.exit_code, "server not ready yet"),
            Err(e) => debug!(error = %e, "readiness check failed"),
        }
        if Instant::now() + poll > deadline {
            return Err(RuntimeError::NotReady(timeout));
        }
        tokio::time::sleep(poll).await;
    }
}

fn spawn_liveness(handle: Weak<ServerHandle>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(handle) = handle.upgrade() else {
                break;
            };
            if handle.stopped.load(Ordering::SeqCst) {
                break;
            }
            handle.check_health().await;
        }
    });
}

/// The running shared server (and its proxy).
pub struct ServerHandle {
    server: Box<dyn RunningContainer>,
    proxy: Option<Box<dyn RunningContainer>>,
    coordinates: ServerCoordinates,
    proxy_coordinates: Option<ServerCoordinates>,
    network_id: String,
    healthy: AtomicBool,
    stopped: AtomicBool,
}

impl ServerHandle {
    pub fn coordinates(&self) -> &ServerCoordinates {
        &self.coordinates
    }

    pub fn proxy_coordinates(&self) -> Option<&ServerCoordinates> {
        self.proxy_coordinates.as_ref()
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Connection details of `database` on this server.
    pub fn connection_details(&self, database: &str) -> ConnectionDetails {
        ConnectionDetails::new(
            &self.coordinates,
            self.proxy_coordinates.as_ref(),
            &self.network_id,
            database,
        )
    }

    /// URL of the maintenance database, for administrative pools.
    pub fn admin_url(&self) -> String {
        self.coordinates.url(MAINTENANCE_DATABASE)
    }

    /// Run a command inside the server container.
    pub async fn exec(&self, command: &[String]) -> RuntimeResult<ExecOutput> {
        if command.is_empty() {
            return Err(RuntimeError::Exec("empty command".to_string()));
        }
        debug!(command = ?command, "exec in server");
        self.server.exec(command).await
    }

    /// Result of the most recent liveness check.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Run the readiness check once and record the result.
    pub async fn check_health(&self) -> bool {
        let healthy = matches!(
            self.server.exec(&readiness_command()).await,
            Ok(output) if output.success()
        );
        let was_healthy = self.healthy.swap(healthy, Ordering::SeqCst);
        if was_healthy && !healthy {
            error!(network = %self.network_id, "shared server failed its liveness check");
        } else if !was_healthy && healthy {
            info!(network = %self.network_id, "shared server answers again");
        }
        healthy
    }

    /// Stop the proxy, then the server. Later calls do nothing.
    pub async fn shutdown(&self) -> RuntimeResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(network = %self.network_id, "stopping shared server");

        let proxy_result = match &self.proxy {
            Some(proxy) => proxy.stop().await,
            None => Ok(()),
        };
        let server_result = self.server.stop().await;
        proxy_result.and(server_result)
    }
}
