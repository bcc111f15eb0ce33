//! Wire messages for the request and watch channels.
//!
//! Every frame is one bincode-encoded value (bincode 1.x defaults: little-endian, fixed-width
//! integers). Operation codes are a closed enum, so an unknown operation can only show up as a
//! frame that fails to decode.

use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::ids::{NamespaceId, OriginId, WatcherId};
use crate::mutation::Mutation;
use crate::path::Path;
use crate::value::Value;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Request {
    pub namespace: NamespaceId,
    pub origin: OriginId,
    pub command: Command,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Command {
    RunAtomic { path: Path, mutation: Mutation },
    Ping { token: Vec<u8> },
    GetServerMeta,
    Time,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::RunAtomic { .. } => "run_atomic",
            Command::Ping { .. } => "ping",
            Command::GetServerMeta => "get_server_meta",
            Command::Time => "time",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ReplyPayload {
    Value(Value),
    Pong { token: Vec<u8>, pid: u32 },
    ServerMeta(ServerMeta),
    Time(f64),
}

pub type Reply = Result<ReplyPayload, ServerError>;

/// Static descriptor of a running server, returned verbatim to whoever asks.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ServerMeta {
    pub version: String,
    pub state_address: String,
    pub watch_address: String,
}

impl ServerMeta {
    pub fn new(state_address: impl Into<String>, watch_address: impl Into<String>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state_address: state_address.into(),
            watch_address: watch_address.into(),
        }
    }
}

/// A request to be told about the next qualifying mutation of a namespace.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WatchRegistration {
    pub watcher: WatcherId,
    /// Mutations caused by this origin are skipped.
    pub exclude: Option<OriginId>,
    pub namespace: NamespaceId,
    /// Only mutations stamped strictly later qualify.
    pub not_before: f64,
}

/// Server answer on the watch channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum WatchReply {
    /// The encoded `[before, after, timestamp]` record.
    Delivered(Vec<u8>),
    Rejected(ServerError),
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ServerError> {
    Ok(bincode::serialize(message)?)
}

/// Decodes an incoming frame, mapping failures to a protocol error for the sender.
pub fn decode<'a, T: Deserialize<'a>>(frame: &'a [u8]) -> Result<T, ServerError> {
    bincode::deserialize(frame).map_err(|err| ServerError::Protocol(format!("malformed frame: {err}")))
}
