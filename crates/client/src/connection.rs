//! Calling-context end of a broker connection.
//!
//! One reader task routes every incoming frame by its `reply_to` to the
//! exchange waiting for it, so any number of requests, hook runs and nested
//! requests can be in flight on the same connection.

use crate::error::{ClientError, ClientResult};
use cask_core::{
    BrokerMessage, ClientCodec, ClientMessage, ContextId, Frame, FrameId, PROTOCOL_VERSION,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Slot = mpsc::UnboundedSender<Frame<BrokerMessage>>;

struct Shared {
    outgoing: mpsc::UnboundedSender<Frame<ClientMessage>>,
    next_id: AtomicU64,
    /// `None` once the broker side is gone.
    pending: Mutex<Option<HashMap<FrameId, Slot>>>,
    /// Asks the writer to shut the connection down.
    close: CancellationToken,
    /// Fired when the broker closed its side.
    closed: CancellationToken,
}

impl Shared {
    fn release(&self, id: FrameId) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pending) = pending.as_mut() {
            pending.remove(&id);
        }
    }
}

/// A handshaken connection to a broker.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    context_id: ContextId,
}

impl Connection {
    /// Handshake over `stream` and start routing frames.
    pub async fn open<S>(stream: S, label: Option<String>) -> ClientResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(stream, ClientCodec::new());
        framed
            .send(Frame::request(
                0,
                ClientMessage::Hello {
                    version: PROTOCOL_VERSION,
                    label,
                },
            ))
            .await?;
        let welcome = framed.next().await.ok_or(ClientError::Closed)??;
        let context_id = match welcome.body {
            BrokerMessage::Welcome {
                version,
                context_id,
            } if version == PROTOCOL_VERSION => context_id,
            BrokerMessage::Welcome { version, .. } => {
                return Err(ClientError::Protocol(format!(
                    "broker speaks protocol version {version}, expected {PROTOCOL_VERSION}"
                )));
            }
            BrokerMessage::Error { error } => return Err(ClientError::Broker(error)),
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected welcome, got {}",
                    other.name()
                )));
            }
        };

        let (sink, frames) = framed.split();
        let (outgoing, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outgoing,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Some(HashMap::new())),
            close: CancellationToken::new(),
            closed: CancellationToken::new(),
        });
        tokio::spawn(write_frames(sink, rx, shared.close.clone()));
        tokio::spawn(read_frames(frames, shared.clone()));

        debug!(context_id = %context_id, "connected to broker");
        Ok(Self { shared, context_id })
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Send a new request and collect the replies to it.
    pub fn request(&self, body: ClientMessage) -> ClientResult<Exchange> {
        self.open_exchange(None, body)
    }

    /// Answer the broker's frame `reply_to` and collect the replies to the answer.
    pub fn reply(&self, reply_to: FrameId, body: ClientMessage) -> ClientResult<Exchange> {
        self.open_exchange(Some(reply_to), body)
    }

    /// Answer the broker's frame `reply_to` without expecting anything back.
    pub fn notify(&self, reply_to: FrameId, body: ClientMessage) -> ClientResult<()> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .outgoing
            .send(Frame::reply(id, reply_to, body))
            .map_err(|_| ClientError::Closed)
    }

    /// Close the connection; the broker then tears the context down.
    pub fn close(&self) {
        self.shared.close.cancel();
    }

    /// Wait until the broker has closed its side.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    fn open_exchange(&self, reply_to: Option<FrameId>, body: ClientMessage) -> ClientResult<Exchange> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, replies) = mpsc::unbounded_channel();
        {
            let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.as_mut().ok_or(ClientError::Closed)?.insert(id, tx);
        }
        let exchange = Exchange {
            id,
            replies,
            shared: self.shared.clone(),
        };
        self.shared
            .outgoing
            .send(Frame {
                id,
                reply_to,
                body,
            })
            .map_err(|_| ClientError::Closed)?;
        Ok(exchange)
    }
}

/// Replies to one frame this side sent.
pub struct Exchange {
    id: FrameId,
    replies: mpsc::UnboundedReceiver<Frame<BrokerMessage>>,
    shared: Arc<Shared>,
}

impl Exchange {
    /// Id of the frame this exchange collects replies to.
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Next reply; fails once the connection is gone.
    pub async fn next(&mut self) -> ClientResult<Frame<BrokerMessage>> {
        self.replies.recv().await.ok_or(ClientError::Closed)
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

async fn write_frames<W>(
    mut sink: W,
    mut rx: mpsc::UnboundedReceiver<Frame<ClientMessage>>,
    close: CancellationToken,
) where
    W: Sink<Frame<ClientMessage>, Error = cask_core::CodecError> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "failed to write frame");
                    break;
                }
            }
            _ = close.cancelled() => break,
        }
    }
    let _ = sink.close().await;
}

async fn read_frames<R>(mut frames: R, shared: Arc<Shared>)
where
    R: Stream<Item = Result<Frame<BrokerMessage>, cask_core::CodecError>> + Unpin,
{
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to read frame from broker");
                break;
            }
        };
        let Some(reply_to) = frame.reply_to else {
            warn!(message = frame.body.name(), "unsolicited frame from broker");
            continue;
        };
        let pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.as_ref().and_then(|p| p.get(&reply_to)) {
            Some(slot) => {
                let _ = slot.send(frame);
            }
            None => debug!(reply_to, "reply for an exchange nobody waits on"),
        }
    }
    shared.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
    shared.closed.cancel();
}
