//! Core domain types and shared logic for the Cask test database broker.
//!
//! This crate defines the data model shared by the broker and its clients:
//! - Parameter fingerprints used as template and keyed-cache keys
//! - Configuration for the shared server, proxy, listener and broker
//! - Connection details handed to calling contexts
//! - The versioned request/reply wire protocol and its frame codec
//! - Database naming and plain-data validation of hook results

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod fingerprint;
pub mod names;
pub mod plain;
pub mod protocol;

pub use connection::{ConnectionDetails, ServerCoordinates};
pub use context::ContextId;
pub use error::{Error, ErrorKind, Result, WireError};
pub use fingerprint::{Fingerprint, KeyedId};
pub use protocol::{
    BrokerCodec, BrokerMessage, ClientCodec, ClientMessage, CodecError, Frame, FrameCodec, FrameId,
    HookOutcome, PROTOCOL_VERSION,
};

/// Default PostgreSQL image tag for the shared server.
pub const DEFAULT_POSTGRES_VERSION: &str = "14";

/// Port PostgreSQL listens on inside its container.
pub const POSTGRES_PORT: u16 = 5432;

/// Port the connection-pooling proxy listens on inside its container.
pub const PROXY_PORT: u16 = 6432;

/// Superuser name of the shared server (trust authentication, no password).
pub const POSTGRES_USER: &str = "postgres";
