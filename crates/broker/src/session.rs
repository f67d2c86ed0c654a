//! One calling context's protocol session.
//!
//! A session reads frames from its transport and dispatches them. Requests
//! (frames without `reply_to`) run on their own tasks so that a hook running
//! inside one request can issue nested requests on the same connection.
//! Frames with `reply_to` are routed to the exchange that is waiting for them.

use crate::broker::{Broker, DatabaseRequest, HookRunner};
use crate::error::{BrokerError, BrokerResult};
use crate::metrics;
use async_trait::async_trait;
use cask_core::plain::check_plain;
use cask_core::{
    BrokerCodec, BrokerMessage, ClientMessage, ConnectionDetails, ContextId, ErrorKind, Frame,
    FrameId, HookOutcome, WireError, PROTOCOL_VERSION,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

type Outgoing = mpsc::UnboundedSender<Frame<BrokerMessage>>;
type Replies = mpsc::UnboundedReceiver<Frame<ClientMessage>>;

/// Serve one calling context on `stream` until it disconnects.
///
/// Everything the context owns is torn down when this returns.
pub async fn serve<S>(broker: Arc<Broker>, stream: S) -> BrokerResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, mut frames) = Framed::new(stream, BrokerCodec::new()).split();
    let (outgoing, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(sink, rx));

    let (context, label) = match handshake(&mut frames, &outgoing).await {
        Ok(Some(hello)) => hello,
        Ok(None) => {
            drop(outgoing);
            let _ = writer.await;
            return Ok(());
        }
        Err(e) => {
            drop(outgoing);
            let _ = writer.await;
            return Err(e);
        }
    };

    metrics::ACTIVE_CONTEXTS.inc();
    info!(context_id = %context, label = label.as_deref().unwrap_or("-"), "calling context connected");

    let session = Arc::new(Session {
        broker: broker.clone(),
        context,
        next_id: AtomicU64::new(1),
        outgoing,
        pending: Mutex::new(Some(HashMap::new())),
    });

    let result = loop {
        match frames.next().await {
            None => break Ok(()),
            Some(Err(e)) => break Err(BrokerError::from(e)),
            Some(Ok(frame)) => match frame.reply_to {
                Some(reply_to) => {
                    let id = frame.id;
                    let name = frame.body.name();
                    if !session.route_reply(reply_to, frame).await {
                        warn!(context_id = %context, reply_to, message = name, "reply to unknown exchange");
                        session.send(
                            Some(id),
                            WireError::protocol(format!(
                                "{name} replies to frame {reply_to}, which has no pending exchange"
                            ))
                            .into(),
                        );
                    }
                }
                None => {
                    let session = session.clone();
                    tokio::spawn(async move { session.handle_request(frame).await });
                }
            },
        }
    };

    session.close_pending().await;
    let report = broker.end_context(context).await;
    metrics::ACTIVE_CONTEXTS.dec();
    info!(
        context_id = %context,
        dropped = report.dropped.len(),
        failures = report.failures.len(),
        "calling context disconnected"
    );
    if let Err(e) = &result {
        debug!(context_id = %context, error = %e, "session ended with error");
    }
    result
}

/// Read the opening `hello` and answer it.
///
/// Returns `None` when the peer left or spoke an unsupported version.
async fn handshake<R>(
    frames: &mut R,
    outgoing: &Outgoing,
) -> BrokerResult<Option<(ContextId, Option<String>)>>
where
    R: Stream<Item = Result<Frame<ClientMessage>, cask_core::CodecError>> + Unpin,
{
    let Some(frame) = frames.next().await else {
        return Ok(None);
    };
    let frame = frame?;
    match frame.body {
        ClientMessage::Hello { version, label } if version == PROTOCOL_VERSION => {
            let context = ContextId::new();
            let _ = outgoing.send(Frame::reply(
                0,
                frame.id,
                BrokerMessage::Welcome {
                    version: PROTOCOL_VERSION,
                    context_id: context,
                },
            ));
            Ok(Some((context, label)))
        }
        ClientMessage::Hello { version, .. } => {
            warn!(version, supported = PROTOCOL_VERSION, "rejecting unsupported protocol version");
            metrics::record_request_error(ErrorKind::UnsupportedVersion.as_str());
            let _ = outgoing.send(Frame::reply(
                0,
                frame.id,
                WireError::new(
                    ErrorKind::UnsupportedVersion,
                    format!(
                        "protocol version {version} is not supported; this broker speaks version {PROTOCOL_VERSION}"
                    ),
                )
                .into(),
            ));
            Ok(None)
        }
        other => {
            let message = format!("expected hello, got {}", other.name());
            metrics::record_request_error(ErrorKind::ProtocolViolation.as_str());
            let _ = outgoing.send(Frame::reply(0, frame.id, WireError::protocol(&message).into()));
            Err(BrokerError::Protocol(message))
        }
    }
}

async fn write_frames<W>(mut sink: W, mut rx: mpsc::UnboundedReceiver<Frame<BrokerMessage>>)
where
    W: Sink<Frame<BrokerMessage>, Error = cask_core::CodecError> + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "failed to write frame");
            break;
        }
    }
    let _ = sink.close().await;
}

struct Session {
    broker: Arc<Broker>,
    context: ContextId,
    next_id: AtomicU64,
    outgoing: Outgoing,
    /// Open exchanges by the id of the frame awaiting replies; `None` once
    /// the connection is gone.
    pending: Mutex<Option<HashMap<FrameId, mpsc::UnboundedSender<Frame<ClientMessage>>>>>,
}

impl Session {
    fn send(&self, reply_to: Option<FrameId>, body: BrokerMessage) -> FrameId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self
            .outgoing
            .send(Frame {
                id,
                reply_to,
                body,
            })
            .is_err()
        {
            debug!(context_id = %self.context, "writer closed, frame dropped");
        }
        id
    }

    /// Send `body` and open an exchange collecting the replies to it.
    async fn open_exchange(&self, reply_to: FrameId, body: BrokerMessage) -> (FrameId, Replies) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(pending) = self.pending.lock().await.as_mut() {
            pending.insert(id, tx);
        }
        let _ = self.outgoing.send(Frame::reply(id, reply_to, body));
        (id, rx)
    }

    async fn close_exchange(&self, id: FrameId) {
        if let Some(pending) = self.pending.lock().await.as_mut() {
            pending.remove(&id);
        }
    }

    async fn route_reply(&self, reply_to: FrameId, frame: Frame<ClientMessage>) -> bool {
        let pending = self.pending.lock().await;
        match pending.as_ref().and_then(|p| p.get(&reply_to)) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    async fn close_pending(&self) {
        self.pending.lock().await.take();
    }

    async fn handle_request(self: Arc<Self>, frame: Frame<ClientMessage>) {
        let request_id = frame.id;
        let name = frame.body.name();
        let reply = match frame.body {
            ClientMessage::GetTestDatabase { params, key, depth } => {
                let hooks: Arc<dyn HookRunner> = Arc::new(SessionHook {
                    session: self.clone(),
                    request_id,
                });
                self.broker
                    .get_test_database(
                        self.context,
                        DatabaseRequest { params, key, depth },
                        hooks,
                    )
                    .await
                    .map(BrokerMessage::from)
            }
            ClientMessage::CreateFromTemplate { template } => self
                .broker
                .create_from_template(self.context, &template)
                .await
                .map(BrokerMessage::from),
            ClientMessage::Hello { .. } => Err(WireError::protocol("hello may only open a session")),
            other => Err(WireError::protocol(format!(
                "{} is only valid as a reply to run_hook",
                other.name()
            ))),
        };

        let body = match reply {
            Ok(body) => body,
            Err(e) => {
                metrics::record_request_error(e.kind.as_str());
                debug!(context_id = %self.context, request = name, kind = %e.kind, error = %e, "request failed");
                e.into()
            }
        };
        self.send(Some(request_id), body);
    }
}

/// Runs the fixture hook by asking the calling context over its connection.
struct SessionHook {
    session: Arc<Session>,
    request_id: FrameId,
}

impl SessionHook {
    async fn exchange(
        &self,
        exchange: FrameId,
        replies: &mut Replies,
        started: &mut HashSet<String>,
    ) -> Result<Value, WireError> {
        let broker = &self.session.broker;
        loop {
            let Some(frame) = replies.recv().await else {
                return Err(WireError::new(
                    ErrorKind::ContextVanished,
                    "calling context disconnected while its fixture hook was running",
                ));
            };
            let reply_to = frame.id;
            let body = match frame.body {
                ClientMessage::HookFinished { outcome } => {
                    return match outcome {
                        HookOutcome::Ok { result } => check_plain(&result).map(|()| result),
                        HookOutcome::Failed { message } => {
                            Err(WireError::new(ErrorKind::TemplateBuild, message))
                        }
                        HookOutcome::NonSerializable { message } => {
                            Err(WireError::new(ErrorKind::NonSerializableResult, message))
                        }
                    };
                }
                ClientMessage::ExecInServer { command } => {
                    match broker.exec_in_server(&command).await {
                        Ok(output) => BrokerMessage::ExecResult {
                            exit_code: output.exit_code,
                            output: output.output,
                        },
                        Err(e) => e.into(),
                    }
                }
                ClientMessage::BuildAdditionalTemplate => {
                    match broker.start_additional_template().await {
                        Ok((database, connection)) => {
                            started.insert(database);
                            BrokerMessage::AdditionalTemplateStarted { connection }
                        }
                        Err(e) => e.into(),
                    }
                }
                ClientMessage::FinishAdditionalTemplate { database } => {
                    if started.remove(&database) {
                        match broker.finish_additional_template(&database).await {
                            Ok(template_name) => {
                                BrokerMessage::AdditionalTemplateFinished { template_name }
                            }
                            Err(e) => e.into(),
                        }
                    } else {
                        WireError::protocol(format!(
                            "{database} is not an additional template started by this hook"
                        ))
                        .into()
                    }
                }
                other => WireError::protocol(format!(
                    "{} is not valid while a fixture hook runs",
                    other.name()
                ))
                .into(),
            };
            debug!(exchange, reply_to, "answering hook request");
            self.session.send(Some(reply_to), body);
        }
    }
}

#[async_trait]
impl HookRunner for SessionHook {
    async fn run_hook(&self, connection: ConnectionDetails) -> Result<Value, WireError> {
        let (exchange, mut replies) = self
            .session
            .open_exchange(self.request_id, BrokerMessage::RunHook { connection })
            .await;
        let mut started = HashSet::new();
        let outcome = self.exchange(exchange, &mut replies, &mut started).await;
        self.session.close_exchange(exchange).await;

        for database in started {
            debug!(database = %database, "discarding unfinished additional template");
            self.session.broker.discard_database(&database).await;
        }
        outcome
    }
}
