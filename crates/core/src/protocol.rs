//! Wire protocol between calling contexts and the broker.
//!
//! Every frame carries an `id` chosen by its sender and, for replies, the
//! `reply_to` id of the frame it answers. Frames are newline-delimited JSON.
//!
//! A typical build exchange:
//!
//! ```text
//! client                                  broker
//! hello {version}                   ->
//!                                   <-    welcome {context_id}
//! #1 get_test_database {params}     ->
//!                                   <-    #7 run_hook {connection}        reply_to 1
//! #2 exec_in_server {command}       ->                                    reply_to 7
//!                                   <-    #8 exec_result {exit_code}      reply_to 2
//! #3 hook_finished {outcome}        ->                                    reply_to 7
//!                                   <-    #9 database_ready {connection}  reply_to 1
//! ```

use crate::connection::ConnectionDetails;
use crate::context::ContextId;
use crate::error::WireError;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded frame length in bytes.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Identifier of a frame, unique per sender and connection.
pub type FrameId = u64;

/// One protocol frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame<B> {
    pub id: FrameId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<FrameId>,
    pub body: B,
}

impl<B> Frame<B> {
    /// A new request, not answering anything.
    pub fn request(id: FrameId, body: B) -> Self {
        Self {
            id,
            reply_to: None,
            body,
        }
    }

    /// A reply to the peer's frame `reply_to`.
    pub fn reply(id: FrameId, reply_to: FrameId, body: B) -> Self {
        Self {
            id,
            reply_to: Some(reply_to),
            body,
        }
    }
}

/// Messages sent by a calling context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opening handshake; must be the first frame.
    Hello {
        version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// Request a database for `params`, optionally reusing one by `key`.
    GetTestDatabase {
        /// `None` when the caller passed no parameters; `Some(Null)` is a concrete value.
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_present"
        )]
        params: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        /// Number of hooks this request is nested in.
        #[serde(default)]
        depth: u32,
    },
    /// Clone a database straight from a named template.
    CreateFromTemplate { template: String },
    /// Final answer to a `run_hook`.
    HookFinished { outcome: HookOutcome },
    /// Run a command inside the server environment.
    ExecInServer { command: Vec<String> },
    /// Start a manually built template.
    BuildAdditionalTemplate,
    /// Freeze a manually built template.
    FinishAdditionalTemplate { database: String },
}

impl ClientMessage {
    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::GetTestDatabase { .. } => "get_test_database",
            Self::CreateFromTemplate { .. } => "create_from_template",
            Self::HookFinished { .. } => "hook_finished",
            Self::ExecInServer { .. } => "exec_in_server",
            Self::BuildAdditionalTemplate => "build_additional_template",
            Self::FinishAdditionalTemplate { .. } => "finish_additional_template",
        }
    }
}

/// How a fixture hook ended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HookOutcome {
    Ok { result: Value },
    Failed { message: String },
    NonSerializable { message: String },
}

/// Messages sent by the broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    Welcome {
        version: u32,
        context_id: ContextId,
    },
    /// Ask the calling context to run its fixture hook against a scratch database.
    RunHook { connection: ConnectionDetails },
    DatabaseReady {
        connection: ConnectionDetails,
        #[serde(default)]
        hook_result: Value,
    },
    ExecResult { exit_code: i64, output: String },
    AdditionalTemplateStarted { connection: ConnectionDetails },
    AdditionalTemplateFinished { template_name: String },
    Error { error: WireError },
}

impl BrokerMessage {
    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::RunHook { .. } => "run_hook",
            Self::DatabaseReady { .. } => "database_ready",
            Self::ExecResult { .. } => "exec_result",
            Self::AdditionalTemplateStarted { .. } => "additional_template_started",
            Self::AdditionalTemplateFinished { .. } => "additional_template_finished",
            Self::Error { .. } => "error",
        }
    }
}

impl From<WireError> for BrokerMessage {
    fn from(error: WireError) -> Self {
        Self::Error { error }
    }
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Lines(#[from] LinesCodecError),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Newline-delimited JSON codec decoding `In` frames and encoding `Out` frames.
pub struct FrameCodec<In, Out> {
    lines: LinesCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

/// Codec used by calling contexts.
pub type ClientCodec = FrameCodec<BrokerMessage, ClientMessage>;

/// Codec used by the broker.
pub type BrokerCodec = FrameCodec<ClientMessage, BrokerMessage>;

impl<In, Out> FrameCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_FRAME_LEN),
            _marker: PhantomData,
        }
    }

    fn parse(line: Option<String>) -> Result<Option<Frame<In>>, CodecError>
    where
        In: DeserializeOwned,
    {
        match line {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned, Out> Decoder for FrameCodec<In, Out> {
    type Item = Frame<In>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode(src)? {
                Some(line) if line.trim().is_empty() => continue,
                line => return Self::parse(line),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode_eof(src)? {
                Some(line) if line.trim().is_empty() => continue,
                line => return Self::parse(line),
            }
        }
    }
}

impl<In, Out: Serialize> Encoder<Frame<Out>> for FrameCodec<In, Out> {
    type Error = CodecError;

    fn encode(&mut self, item: Frame<Out>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item)?;
        self.lines.encode(line, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_absent_params_differ_from_null() {
        let absent: ClientMessage =
            serde_json::from_str(r#"{"type":"get_test_database","depth":0}"#).unwrap();
        let null: ClientMessage =
            serde_json::from_str(r#"{"type":"get_test_database","params":null,"depth":0}"#)
                .unwrap();

        match (absent, null) {
            (
                ClientMessage::GetTestDatabase { params: a, .. },
                ClientMessage::GetTestDatabase { params: b, .. },
            ) => {
                assert_eq!(a, None);
                assert_eq!(b, Some(Value::Null));
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[test]
    fn test_frame_json_shape() {
        let frame = Frame::reply(
            3,
            1,
            ClientMessage::HookFinished {
                outcome: HookOutcome::Failed {
                    message: "x".to_string(),
                },
            },
        );
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 3,
                "reply_to": 1,
                "body": {"type": "hook_finished", "outcome": {"status": "failed", "message": "x"}}
            })
        );
    }

    #[test]
    fn test_codec_roundtrip_over_lines() {
        let mut client = ClientCodec::new();
        let mut broker = BrokerCodec::new();
        let mut buf = BytesMut::new();

        client
            .encode(
                Frame::request(
                    1,
                    ClientMessage::Hello {
                        version: PROTOCOL_VERSION,
                        label: None,
                    },
                ),
                &mut buf,
            )
            .unwrap();
        client
            .encode(
                Frame::request(2, ClientMessage::BuildAdditionalTemplate),
                &mut buf,
            )
            .unwrap();

        let first = broker.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert!(matches!(first.body, ClientMessage::Hello { version: 1, .. }));
        let second = broker.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.body, ClientMessage::BuildAdditionalTemplate);
        assert!(broker.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_malformed_frame() {
        let mut broker = BrokerCodec::new();
        let mut buf = BytesMut::from(&b"{\"id\":1,\"body\":{\"type\":\"nope\"}}\n"[..]);
        assert!(matches!(broker.decode(&mut buf), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_codec_skips_blank_lines() {
        let mut client = ClientCodec::new();
        let error = BrokerMessage::from(WireError::new(ErrorKind::Exec, "boom"));
        let encoded = serde_json::to_string(&Frame::request(5, error.clone())).unwrap();
        let mut buf = BytesMut::from(format!("\n\n{encoded}\n").as_bytes());
        let frame = client.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.body, error);
        assert_eq!(frame.body.name(), "error");
    }
}
