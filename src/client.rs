//! Client side of the state server.
//!
//! A [`Client`] speaks to the server through any [`Transport`]: the in-process [`ServerHandle`]
//! or the QUIC [`RemoteTransport`](crate::network::RemoteTransport). It binds one namespace and
//! one origin id, so the watches it opens can skip the mutations it caused itself.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::error::ServerError;
use crate::event::{EncodedRecord, MutationRecord};
use crate::ids::{NamespaceId, OriginId, WatcherId};
use crate::mutation::Mutation;
use crate::path::Path;
use crate::protocol::{Command, ReplyPayload, Request, ServerMeta, WatchRegistration};
use crate::server::ServerHandle;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Remote(#[from] ServerError),

    #[error("failed to encode or decode a frame: {0}")]
    Codec(#[from] bincode::Error),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("server went away")]
    Disconnected,

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("unexpected reply to {command}: {reply:?}")]
    UnexpectedReply {
        command: &'static str,
        reply: ReplyPayload,
    },

    #[error("ping reply carried a different token")]
    PingMismatch,

    #[error("watch ended after its record limit without a match")]
    Exhausted,
}

/// Request/reply and watch channels to one server.
pub trait Transport: Send + Sync {
    fn call(&self, request: Request) -> impl Future<Output = Result<ReplyPayload, ClientError>> + Send;

    /// Registers a watch and resolves once a qualifying record is delivered.
    fn watch(
        &self,
        registration: WatchRegistration,
    ) -> impl Future<Output = Result<EncodedRecord, ClientError>> + Send;
}

impl Transport for ServerHandle {
    fn call(&self, request: Request) -> impl Future<Output = Result<ReplyPayload, ClientError>> + Send {
        ServerHandle::call(self, request)
    }

    fn watch(
        &self,
        registration: WatchRegistration,
    ) -> impl Future<Output = Result<EncodedRecord, ClientError>> + Send {
        ServerHandle::watch(self, registration)
    }
}

/// How a [`Changes`] cursor selects mutations.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Only mutations stamped after this time qualify. Defaults to the server's clock at the
    /// moment the cursor is created.
    pub start: Option<f64>,
    /// Also report mutations this client caused.
    pub include_own: bool,
    /// Overall time budget for the cursor, across every `next` call.
    pub timeout: Option<Duration>,
    /// Re-read the server clock before every wait, so mutations made while the caller was busy
    /// are dropped instead of replayed.
    pub live: bool,
    /// Stop after this many records.
    pub count: Option<usize>,
}

impl WatchOptions {
    pub fn since(start: f64) -> Self {
        Self {
            start: Some(start),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn including_own(mut self) -> Self {
        self.include_own = true;
        self
    }

    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    pub fn limit(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

pub struct Client<T> {
    transport: T,
    namespace: NamespaceId,
    origin: OriginId,
}

impl<T: Transport> Client<T> {
    /// Binds `transport` to `namespace` under a fresh random origin.
    pub fn new(transport: T, namespace: impl Into<NamespaceId>) -> Self {
        Self {
            transport,
            namespace: namespace.into(),
            origin: OriginId::random(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<OriginId>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn namespace(&self) -> &NamespaceId {
        &self.namespace
    }

    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Same transport, another namespace, new origin.
    pub fn fork(&self, namespace: impl Into<NamespaceId>) -> Client<T>
    where
        T: Clone,
    {
        Client::new(self.transport.clone(), namespace)
    }

    async fn send(&self, command: Command) -> Result<ReplyPayload, ClientError> {
        self.transport
            .call(Request {
                namespace: self.namespace.clone(),
                origin: self.origin.clone(),
                command,
            })
            .await
    }

    /// Runs `mutation` against the whole document.
    pub async fn atomic(&self, mutation: Mutation) -> Result<Value, ClientError> {
        self.atomic_at(Path::root(), mutation).await
    }

    /// Runs `mutation` against the part of the document at `path`.
    pub async fn atomic_at(&self, path: impl Into<Path>, mutation: Mutation) -> Result<Value, ClientError> {
        match self
            .send(Command::RunAtomic {
                path: path.into(),
                mutation,
            })
            .await?
        {
            ReplyPayload::Value(value) => Ok(value),
            reply => Err(ClientError::UnexpectedReply {
                command: "run_atomic",
                reply,
            }),
        }
    }

    pub async fn snapshot(&self) -> Result<Value, ClientError> {
        self.atomic(Mutation::Snapshot).await
    }

    pub async fn get(&self, key: impl Into<Path>) -> Result<Value, ClientError> {
        self.atomic(Mutation::get(key)).await
    }

    pub async fn contains(&self, key: impl Into<Path>) -> Result<bool, ClientError> {
        let found = self.atomic(Mutation::Contains { key: key.into() }).await?;
        Ok(found.as_bool().unwrap_or(false))
    }

    pub async fn set(&self, key: impl Into<Path>, value: impl Into<Value>) -> Result<(), ClientError> {
        self.atomic(Mutation::set(key, value)).await.map(drop)
    }

    pub async fn remove(&self, key: impl Into<Path>) -> Result<Value, ClientError> {
        self.atomic(Mutation::remove(key)).await
    }

    pub async fn increment(&self, key: impl Into<Path>, by: impl Into<Value>) -> Result<Value, ClientError> {
        self.atomic(Mutation::increment(key, by)).await
    }

    pub async fn append(&self, key: impl Into<Path>, value: impl Into<Value>) -> Result<Value, ClientError> {
        self.atomic(Mutation::append(key, value)).await
    }

    pub async fn compare_and_swap(
        &self,
        key: impl Into<Path>,
        expected: Option<Value>,
        new: impl Into<Value>,
    ) -> Result<bool, ClientError> {
        let swapped = self
            .atomic(Mutation::compare_and_swap(key, expected, new))
            .await?;
        Ok(swapped.as_bool().unwrap_or(false))
    }

    pub async fn merge(&self, updates: impl Into<Value>) -> Result<(), ClientError> {
        self.atomic(Mutation::Merge {
            value: updates.into(),
        })
        .await
        .map(drop)
    }

    /// Overwrites the whole document.
    pub async fn replace(&self, document: impl Into<Value>) -> Result<(), ClientError> {
        self.atomic(Mutation::Replace {
            value: document.into(),
        })
        .await
        .map(drop)
    }

    /// Pings the server and returns its process id.
    pub async fn ping(&self, token: impl Into<Vec<u8>>) -> Result<u32, ClientError> {
        let token = token.into();
        match self.send(Command::Ping { token: token.clone() }).await? {
            ReplyPayload::Pong { token: echoed, pid } if echoed == token => Ok(pid),
            ReplyPayload::Pong { .. } => Err(ClientError::PingMismatch),
            reply => Err(ClientError::UnexpectedReply { command: "ping", reply }),
        }
    }

    pub async fn server_meta(&self) -> Result<ServerMeta, ClientError> {
        match self.send(Command::GetServerMeta).await? {
            ReplyPayload::ServerMeta(meta) => Ok(meta),
            reply => Err(ClientError::UnexpectedReply {
                command: "get_server_meta",
                reply,
            }),
        }
    }

    pub async fn time(&self) -> Result<f64, ClientError> {
        match self.send(Command::Time).await? {
            ReplyPayload::Time(now) => Ok(now),
            reply => Err(ClientError::UnexpectedReply { command: "time", reply }),
        }
    }

    /// Opens a cursor over this namespace's future mutations.
    pub async fn changes(&self, options: WatchOptions) -> Result<Changes<'_, T>, ClientError> {
        let not_before = match options.start {
            Some(start) => start,
            None => self.time().await?,
        };
        Ok(Changes {
            client: self,
            watcher: WatcherId::random(),
            exclude: (!options.include_own).then(|| self.origin.clone()),
            not_before,
            live: options.live,
            remaining: options.count,
            deadline: options.timeout.map(|t| Instant::now() + t),
        })
    }

    /// Waits for the first change after which `predicate` holds for the document, and returns
    /// that document.
    pub async fn when<F>(&self, options: WatchOptions, mut predicate: F) -> Result<Value, ClientError>
    where
        F: FnMut(&Value) -> bool + Send,
    {
        let mut changes = self.changes(options).await?;
        while let Some(record) = changes.next().await? {
            if predicate(&record.after) {
                return Ok(record.after);
            }
        }
        Err(ClientError::Exhausted)
    }

    pub async fn when_equal(
        &self,
        key: impl Into<Path>,
        value: impl Into<Value>,
        options: WatchOptions,
    ) -> Result<Value, ClientError> {
        let key = key.into();
        let value = value.into();
        self.when(options, move |doc| key.resolve(doc) == Ok(&value))
            .await
    }

    pub async fn when_not_equal(
        &self,
        key: impl Into<Path>,
        value: impl Into<Value>,
        options: WatchOptions,
    ) -> Result<Value, ClientError> {
        let key = key.into();
        let value = value.into();
        self.when(options, move |doc| matches!(key.resolve(doc), Ok(found) if *found != value))
            .await
    }

    pub async fn when_available(&self, key: impl Into<Path>, options: WatchOptions) -> Result<Value, ClientError> {
        let key = key.into();
        self.when(options, move |doc| key.resolve(doc).is_ok()).await
    }

    /// Waits until `key` holds a truthy value. A missing key is not truthy.
    pub async fn when_truthy(&self, key: impl Into<Path>, options: WatchOptions) -> Result<Value, ClientError> {
        let key = key.into();
        self.when(options, move |doc| matches!(key.resolve(doc), Ok(found) if found.is_truthy()))
            .await
    }

    /// Waits until `key` holds a falsy value. A missing key does not count.
    pub async fn when_falsy(&self, key: impl Into<Path>, options: WatchOptions) -> Result<Value, ClientError> {
        let key = key.into();
        self.when(options, move |doc| matches!(key.resolve(doc), Ok(found) if !found.is_truthy()))
            .await
    }

    /// Waits until `key` exists and holds null.
    pub async fn when_none(&self, key: impl Into<Path>, options: WatchOptions) -> Result<Value, ClientError> {
        let key = key.into();
        self.when(options, move |doc| matches!(key.resolve(doc), Ok(found) if found.is_null()))
            .await
    }

    /// Waits until `key` exists and holds anything but null.
    pub async fn when_not_none(&self, key: impl Into<Path>, options: WatchOptions) -> Result<Value, ClientError> {
        let key = key.into();
        self.when(options, move |doc| matches!(key.resolve(doc), Ok(found) if !found.is_null()))
            .await
    }

    /// Waits for a change that touches at least one of `keys` at the top level. With no keys,
    /// any change qualifies.
    pub async fn when_changed(&self, keys: &[&str], options: WatchOptions) -> Result<MutationRecord, ClientError> {
        self.when_record(options, |changed| keys.is_empty() || keys.iter().any(|key| *key == changed))
            .await
    }

    /// Waits for a change that touches some top-level key not listed in `keys`.
    pub async fn when_changed_except(
        &self,
        keys: &[&str],
        options: WatchOptions,
    ) -> Result<MutationRecord, ClientError> {
        self.when_record(options, |changed| !keys.iter().any(|key| *key == changed))
            .await
    }

    async fn when_record<F>(&self, options: WatchOptions, selected: F) -> Result<MutationRecord, ClientError>
    where
        F: Fn(&str) -> bool + Send,
    {
        let mut changes = self.changes(options).await?;
        while let Some(record) = changes.next().await? {
            if record.changed_keys().iter().any(|changed| selected(changed.as_str())) {
                return Ok(record);
            }
        }
        Err(ClientError::Exhausted)
    }
}

/// Cursor over a namespace's mutations, oldest first.
///
/// Each [`Changes::next`] registers one watch stamped with the timestamp of the previously
/// returned record, so no mutation is skipped between calls, even if the client is slow. A live
/// cursor instead stamps each watch with the server's current time and only sees what happens
/// while it waits.
pub struct Changes<'a, T> {
    client: &'a Client<T>,
    watcher: WatcherId,
    exclude: Option<OriginId>,
    not_before: f64,
    live: bool,
    remaining: Option<usize>,
    deadline: Option<Instant>,
}

impl<T: Transport> Changes<'_, T> {
    pub fn not_before(&self) -> f64 {
        self.not_before
    }

    /// Next qualifying record, or `None` once the record limit is used up.
    pub async fn next(&mut self) -> Result<Option<MutationRecord>, ClientError> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        let deadline = self.deadline;
        let record = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.wait())
                .await
                .map_err(|_| ClientError::Timeout)??,
            None => self.wait().await?,
        };
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Ok(Some(record))
    }

    async fn wait(&mut self) -> Result<MutationRecord, ClientError> {
        if self.live {
            self.not_before = self.client.time().await?;
        }
        let registration = WatchRegistration {
            watcher: self.watcher.clone(),
            exclude: self.exclude.clone(),
            namespace: self.client.namespace.clone(),
            not_before: self.not_before,
        };
        let encoded = self.client.transport.watch(registration).await?;
        let record = MutationRecord::decode(&encoded)?;
        self.not_before = record.timestamp;
        Ok(record)
    }
}
