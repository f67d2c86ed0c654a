//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Shared PostgreSQL server configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Any tag of the official `postgres` image.
    #[serde(default = "default_postgres_version")]
    pub postgres_version: String,
    /// Image name (override for mirrors).
    #[serde(default = "default_postgres_image")]
    pub image: String,
    /// Upper bound for container start plus readiness polling.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Delay between readiness checks while starting.
    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,
    /// Interval of the liveness check once started.
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
    /// `max_connections` setting of the server.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Size of the broker's own administrative connection pool.
    #[serde(default = "default_admin_pool_size")]
    pub admin_pool_size: u32,
    /// Host files made visible inside the server (e.g. SQL scripts for hooks).
    #[serde(default)]
    pub bind_mounts: Vec<BindMount>,
}

/// A host path mounted into the server container.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    #[serde(default)]
    pub mode: BindMode,
}

/// Access mode of a bind mount.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    #[default]
    Rw,
    Ro,
}

fn default_postgres_version() -> String {
    crate::DEFAULT_POSTGRES_VERSION.to_string()
}

fn default_postgres_image() -> String {
    "postgres".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    120
}

fn default_readiness_poll_ms() -> u64 {
    250
}

fn default_liveness_interval_secs() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    1000
}

fn default_admin_pool_size() -> u32 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            postgres_version: default_postgres_version(),
            image: default_postgres_image(),
            startup_timeout_secs: default_startup_timeout_secs(),
            readiness_poll_ms: default_readiness_poll_ms(),
            liveness_interval_secs: default_liveness_interval_secs(),
            max_connections: default_max_connections(),
            admin_pool_size: default_admin_pool_size(),
            bind_mounts: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    /// Validate server configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.postgres_version.trim().is_empty() {
            return Err("server.postgres_version cannot be empty".to_string());
        }
        if self.startup_timeout_secs == 0 {
            return Err("server.startup_timeout_secs cannot be 0".to_string());
        }
        // tokio::time::interval panics on a zero period
        if self.liveness_interval_secs == 0 {
            return Err("server.liveness_interval_secs cannot be 0".to_string());
        }
        if self.readiness_poll_ms == 0 {
            return Err("server.readiness_poll_ms cannot be 0".to_string());
        }
        if self.max_connections == 0 {
            return Err("server.max_connections cannot be 0".to_string());
        }
        if self.admin_pool_size == 0 {
            return Err("server.admin_pool_size cannot be 0".to_string());
        }
        for mount in &self.bind_mounts {
            if !mount.target.starts_with('/') {
                return Err(format!(
                    "bind mount target '{}' must be an absolute path",
                    mount.target
                ));
            }
        }
        Ok(())
    }
}

/// Connection-pooling proxy (pgbouncer) configuration, disabled by default.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_proxy_image")]
    pub image: String,
    #[serde(default = "default_proxy_version")]
    pub version: String,
    #[serde(default)]
    pub pool_mode: PoolMode,
}

/// pgbouncer pool mode.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    Session,
    #[default]
    Transaction,
    Statement,
}

impl PoolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Transaction => "transaction",
            Self::Statement => "statement",
        }
    }
}

fn default_proxy_image() -> String {
    "edoburu/pgbouncer".to_string()
}

fn default_proxy_version() -> String {
    "latest".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: default_proxy_image(),
            version: default_proxy_version(),
            pool_mode: PoolMode::default(),
        }
    }
}

/// Listener configuration for the broker daemon.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenConfig {
    /// Protocol listener address (e.g., "127.0.0.1:5490").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Optional HTTP address serving /health and /metrics.
    #[serde(default)]
    pub http_bind: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:5490".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_bind: None,
        }
    }
}

/// Broker behaviour settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Nesting depth of hook-issued requests above which a warning is logged.
    /// Not enforced: bounding recursion is the caller's obligation.
    #[serde(default = "default_nesting_warn_depth")]
    pub nesting_warn_depth: u32,
}

fn default_nesting_warn_depth() -> u32 {
    4
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            nesting_warn_depth: default_nesting_warn_depth(),
        }
    }
}

/// Complete broker configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub broker: BrokerSettings,
}

impl AppConfig {
    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        if self.proxy.enabled && self.proxy.version.trim().is_empty() {
            return Err("proxy.version cannot be empty when the proxy is enabled".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.postgres_version, "14");
        assert_eq!(config.startup_timeout(), Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_liveness_interval_rejected() {
        let config = ServerConfig {
            liveness_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relative_bind_mount_target_rejected() {
        let config = ServerConfig {
            bind_mounts: vec![BindMount {
                source: PathBuf::from("/tmp/schema.sql"),
                target: "schema.sql".to_string(),
                mode: BindMode::Ro,
            }],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("absolute"));
    }

    #[test]
    fn test_app_config_from_toml() {
        let toml = r#"
            [server]
            postgres_version = "16"
            bind_mounts = [{ source = "/tmp/a.sql", target = "/a.sql", mode = "ro" }]

            [proxy]
            enabled = true
            pool_mode = "session"

            [listen]
            bind = "0.0.0.0:6000"
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.postgres_version, "16");
        assert_eq!(config.server.bind_mounts[0].mode, BindMode::Ro);
        assert_eq!(config.server.admin_pool_size, 10);
        assert!(config.proxy.enabled);
        assert_eq!(config.proxy.pool_mode, PoolMode::Session);
        assert_eq!(config.proxy.image, "edoburu/pgbouncer");
        assert_eq!(config.listen.bind, "0.0.0.0:6000");
        assert_eq!(config.broker.nesting_warn_depth, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_mode_defaults_to_transaction() {
        let config: ProxyConfig = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert_eq!(config.pool_mode, PoolMode::Transaction);
        assert_eq!(config.pool_mode.as_str(), "transaction");
    }
}
