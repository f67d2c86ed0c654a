//! A raw protocol client for driving sessions frame by frame.

use cask_broker::{Broker, connect_in_process};
use cask_core::{
    BrokerMessage, ClientCodec, ClientMessage, ContextId, Frame, FrameId, HookOutcome,
    PROTOCOL_VERSION,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[allow(dead_code)]
pub struct WireClient {
    framed: Framed<DuplexStream, ClientCodec>,
    next_id: FrameId,
}

#[allow(dead_code)]
impl WireClient {
    /// Connect in-process without handshaking.
    pub fn connect(broker: &Arc<Broker>) -> Self {
        Self {
            framed: Framed::new(connect_in_process(broker), ClientCodec::new()),
            next_id: 1,
        }
    }

    /// Connect and complete the handshake.
    pub async fn open(broker: &Arc<Broker>) -> (Self, ContextId) {
        let mut client = Self::connect(broker);
        let context = client.hello().await;
        (client, context)
    }

    pub async fn hello(&mut self) -> ContextId {
        let id = self
            .send(ClientMessage::Hello {
                version: PROTOCOL_VERSION,
                label: Some("wire-test".to_string()),
            })
            .await;
        let frame = self.recv().await;
        assert_eq!(frame.reply_to, Some(id));
        match frame.body {
            BrokerMessage::Welcome { context_id, .. } => context_id,
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    pub async fn send(&mut self, body: ClientMessage) -> FrameId {
        let id = self.take_id();
        self.framed.send(Frame::request(id, body)).await.unwrap();
        id
    }

    pub async fn reply(&mut self, reply_to: FrameId, body: ClientMessage) -> FrameId {
        let id = self.take_id();
        self.framed
            .send(Frame::reply(id, reply_to, body))
            .await
            .unwrap();
        id
    }

    pub async fn recv(&mut self) -> Frame<BrokerMessage> {
        tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("malformed frame")
    }

    /// Next frame, or `None` once the broker closed the connection.
    pub async fn recv_or_closed(&mut self) -> Option<Frame<BrokerMessage>> {
        tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .map(|frame| frame.expect("malformed frame"))
    }

    /// Request a database and answer its hook (if asked) with `outcome`.
    pub async fn get_database(
        &mut self,
        params: Option<Value>,
        key: Option<&str>,
        outcome: HookOutcome,
    ) -> BrokerMessage {
        let request = self
            .send(ClientMessage::GetTestDatabase {
                params,
                key: key.map(str::to_string),
                depth: 0,
            })
            .await;
        let mut frame = self.recv().await;
        if let BrokerMessage::RunHook { .. } = frame.body {
            assert_eq!(frame.reply_to, Some(request));
            self.reply(frame.id, ClientMessage::HookFinished { outcome })
                .await;
            frame = self.recv().await;
        }
        assert_eq!(frame.reply_to, Some(request));
        frame.body
    }

    fn take_id(&mut self) -> FrameId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Database name out of a `database_ready` reply.
#[allow(dead_code)]
pub fn ready_database(message: &BrokerMessage) -> String {
    match message {
        BrokerMessage::DatabaseReady { connection, .. } => connection.database.clone(),
        other => panic!("expected database_ready, got {other:?}"),
    }
}

#[allow(dead_code)]
pub fn hook_ok(result: Value) -> HookOutcome {
    HookOutcome::Ok { result }
}
