//! Cask broker daemon.

use anyhow::{Context, Result};
use cask_broker::{create_router, metrics, serve_tcp};
use cask_core::config::AppConfig;
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cask - a test database broker
#[derive(Parser, Debug)]
#[command(name = "caskd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "CASK_CONFIG", default_value = "cask.toml")]
    config: String,

    /// Protocol listener address, overriding `listen.bind`
    #[arg(long)]
    bind: Option<String>,

    /// HTTP address for /health and /metrics, overriding `listen.http_bind`
    #[arg(long)]
    http_bind: Option<String>,

    /// Start the shared server before accepting connections
    #[arg(long)]
    eager: bool,
}

/// Load configuration: optional TOML file, then `CASK_` environment variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}, using defaults", path);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("CASK_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Cask v{}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.listen.bind = bind;
    }
    if let Some(http_bind) = args.http_bind {
        config.listen.http_bind = Some(http_bind);
    }

    metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let broker = cask_broker::from_config(&config).context("failed to create broker")?;

    if args.eager {
        broker
            .services()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("shared server failed to start")?;
        tracing::info!("Shared server started");
    }

    let cancel = CancellationToken::new();

    if let Some(http_bind) = &config.listen.http_bind {
        let addr: SocketAddr = http_bind.parse().context("invalid HTTP bind address")?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener to {}", addr))?;
        tracing::info!("HTTP listening on {}", addr);
        let app = create_router(broker.clone());
        let http_cancel = cancel.clone();
        tokio::spawn(async move {
            let shutdown = async move { http_cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "HTTP server failed");
            }
        });
    }

    let addr: SocketAddr = config.listen.bind.parse().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    tracing::info!("Listening on {}", addr);

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        signal_cancel.cancel();
    });

    serve_tcp(broker.clone(), listener, cancel).await?;

    broker.shutdown().await;
    tracing::info!("Shared server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_core::config::PoolMode;
    use tempfile::tempdir;

    #[test]
    fn load_config_from_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("cask.toml");
        std::fs::write(
            &path,
            r#"
[server]
postgres_version = "16"

[proxy]
enabled = true
pool_mode = "session"

[listen]
bind = "127.0.0.1:7000"
"#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.postgres_version, "16");
        assert!(config.proxy.enabled);
        assert_eq!(config.proxy.pool_mode, PoolMode::Session);
        assert_eq!(config.listen.bind, "127.0.0.1:7000");
    }

    #[test]
    fn load_config_without_file_uses_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("missing.toml");
        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.postgres_version, "14");
        assert_eq!(config.listen.bind, "127.0.0.1:5490");
    }

    #[test]
    fn load_config_rejects_invalid() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("cask.toml");
        std::fs::write(&path, "[server]\nmax_connections = 0\n").unwrap();
        assert!(load_config(path.to_str().unwrap()).is_err());
    }
}
