//! Statehouse: a single-owner shared-state server.
//!
//! Clients address a namespace, and each namespace holds one document. A client changes its
//! namespace by sending a [`Mutation`] that the server applies atomically. Every change that
//! commits is recorded in an append-only, timestamp-ordered log. Watches are answered from that
//! log: a client asks for the first change after a given time that some other client caused, and
//! it receives that change even if it happened while the client wasn't listening.
//!
//! One task owns all state ([`server::StateServer`]); everything else talks to it over channels,
//! either in-process through a [`ServerHandle`] or over QUIC through [`network`].

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod ids;
pub mod log;
pub mod mutation;
pub mod namespace;
pub mod network;
pub mod path;
pub mod protocol;
pub mod server;
pub mod telemetry;
pub mod value;
pub mod watch;

pub use client::{Changes, Client, ClientError, Transport, WatchOptions};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{PathError, ServerError, TransformError};
pub use event::MutationRecord;
pub use ids::{NamespaceId, OriginId, WatcherId};
pub use mutation::Mutation;
pub use path::Path;
pub use protocol::ServerMeta;
pub use server::{ServerHandle, StateServer};
pub use value::Value;
