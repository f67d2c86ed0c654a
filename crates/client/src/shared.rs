//! Process-wide shared brokers.
//!
//! Every factory with the same options talks to one broker, so concurrent
//! test runtimes share one server and one template cache. Each broker runs
//! on a runtime of its own; a test runtime shutting down cannot take the
//! broker with it.

use crate::error::{ClientError, ClientResult};
use crate::factory::FactoryOptions;
use cask_broker::{Broker, connect_in_process};
use cask_core::Fingerprint;
use cask_core::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// How long a stopping runtime waits for its remaining tasks.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

static REGISTRY: LazyLock<Mutex<HashMap<Fingerprint, Arc<SharedBroker>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// A broker shared by every factory with the same options.
pub struct SharedBroker {
    key: Fingerprint,
    broker: Arc<Broker>,
    runtime: BrokerRuntime,
}

/// The dedicated thread a shared broker's runtime runs on.
struct BrokerRuntime {
    handle: Handle,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SharedBroker {
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Open an in-process session served on the broker's runtime.
    pub fn connect(&self) -> DuplexStream {
        let _guard = self.runtime.handle.enter();
        connect_in_process(&self.broker)
    }

    /// Shut the broker down, then stop its runtime and wait for the thread
    /// to exit. Later calls do nothing.
    pub async fn shutdown(&self) {
        let stop = self
            .runtime
            .stop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(stop) = stop else {
            return;
        };
        {
            let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
            if registry
                .get(&self.key)
                .is_some_and(|shared| std::ptr::eq(Arc::as_ptr(shared), self))
            {
                registry.remove(&self.key);
            }
        }

        let broker = self.broker.clone();
        let _ = self
            .runtime
            .handle
            .spawn(async move { broker.shutdown().await })
            .await;
        let _ = stop.send(());

        let thread = self
            .runtime
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => info!(key = %self.key.short(), "shared broker stopped"),
                _ => warn!(key = %self.key.short(), "shared broker thread did not exit cleanly"),
            }
        }
    }
}

/// The shared broker for `options`, started on first use.
///
/// The server behind it starts lazily with the first database request.
pub fn shared_broker(options: &FactoryOptions) -> ClientResult<Arc<SharedBroker>> {
    get_or_start(options, |config| Ok(Broker::from_config(config)?))
}

/// Shut down every shared broker, stopping their servers and runtimes.
pub async fn shutdown_shared_brokers() {
    let brokers: Vec<_> = REGISTRY
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .map(|(_, shared)| shared)
        .collect();
    for shared in brokers {
        shared.shutdown().await;
    }
}

pub(crate) fn get_or_start<F>(options: &FactoryOptions, start: F) -> ClientResult<Arc<SharedBroker>>
where
    F: FnOnce(&AppConfig) -> ClientResult<Arc<Broker>>,
{
    let key = Fingerprint::of_serializable(options)?;
    let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(shared) = registry.get(&key) {
        return Ok(shared.clone());
    }

    let broker = start(&options.to_config())?;
    let runtime = spawn_runtime()?;
    info!(
        key = %key.short(),
        postgres_version = %options.postgres_version,
        "started shared broker"
    );
    let shared = Arc::new(SharedBroker {
        key,
        broker,
        runtime,
    });
    registry.insert(key, shared.clone());
    Ok(shared)
}

fn spawn_runtime() -> ClientResult<BrokerRuntime> {
    let (tx, rx) = std::sync::mpsc::channel();
    let (stop, stopped) = oneshot::channel::<()>();
    let thread = std::thread::Builder::new()
        .name("cask-broker".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("cask-broker-worker")
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            let _ = tx.send(Ok(runtime.handle().clone()));
            // A dropped sender stops the runtime too.
            runtime.block_on(async {
                let _ = stopped.await;
            });
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        })?;
    let handle = rx
        .recv()
        .map_err(|_| ClientError::Config("shared broker runtime exited during startup".to_string()))?
        .map_err(ClientError::Io)?;
    Ok(BrokerRuntime {
        handle,
        stop: Mutex::new(Some(stop)),
        thread: Mutex::new(Some(thread)),
    })
}
