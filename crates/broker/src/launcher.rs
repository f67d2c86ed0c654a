//! Transports that feed calling contexts into sessions.

use crate::broker::Broker;
use crate::error::BrokerResult;
use crate::session;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Buffer size of in-process connections.
const DUPLEX_BUFFER: usize = 256 * 1024;

/// How long shutdown waits for open sessions to finish their teardown.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Open an in-process connection to `broker`.
///
/// The returned stream speaks the same protocol as a TCP connection; the
/// session behind it ends when the stream is dropped.
pub fn connect_in_process(broker: &Arc<Broker>) -> DuplexStream {
    let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
    let broker = broker.clone();
    tokio::spawn(async move {
        if let Err(e) = session::serve(broker, server).await {
            debug!(error = %e, "in-process session ended with error");
        }
    });
    client
}

/// Accept calling contexts on `listener` until `cancel` fires.
pub async fn serve_tcp(
    broker: Arc<Broker>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> BrokerResult<()> {
    let tracker = TaskTracker::new();
    info!(addr = %listener.local_addr()?, "accepting calling contexts");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        let broker = broker.clone();
                        tracker.spawn(async move {
                            debug!(%peer, "connection accepted");
                            if let Err(e) = session::serve(broker, stream).await {
                                warn!(%peer, error = %e, "session ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!("shutdown requested, no longer accepting connections");
                break;
            }
        }
    }

    tracker.close();
    if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, tracker.wait())
        .await
        .is_err()
    {
        warn!(open = tracker.len(), "sessions still open at shutdown");
    }
    Ok(())
}
