//! The state server event loop.
//!
//! One task owns the [`NamespaceStore`] and is the only code that ever touches it. Requests and
//! watch registrations reach it over two channels; each is handled to completion before the next
//! wait, which is what makes every mutation atomic without a single lock.
//!
//! Each cycle:
//! 1. resolve pending watches in namespaces touched since the last cycle (cheap when none are);
//! 2. wait, without timeout, until either channel has a message;
//! 3. handle exactly that message: a dispatcher cycle for a request, a registration for a watch.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::client::ClientError;
use crate::clock::Clock;
use crate::error::LogError;
use crate::event::EncodedRecord;
use crate::executor::{run_atomic, ExecError};
use crate::namespace::NamespaceStore;
use crate::protocol::{Command, Reply, ReplyPayload, Request, ServerMeta, WatchRegistration};
use crate::watch::{PendingWatch, Registration};

/// Capacity of each inbound channel before senders wait.
pub const CHANNEL_CAPACITY: usize = 1024;

/// A request on its way into the loop, with the route its reply takes back.
#[derive(Debug)]
pub struct RequestMessage {
    pub request: Request,
    pub respond: oneshot::Sender<Reply>,
}

/// A watch registration on its way into the loop.
#[derive(Debug)]
pub struct WatchMessage {
    pub registration: WatchRegistration,
    pub deliver: oneshot::Sender<EncodedRecord>,
}

pub struct StateServer {
    store: NamespaceStore,
    meta: ServerMeta,
    clock: Box<dyn Clock>,
    request_rx: mpsc::Receiver<RequestMessage>,
    watch_rx: mpsc::Receiver<WatchMessage>,
}

impl StateServer {
    pub fn new(meta: ServerMeta, clock: impl Clock + 'static) -> (Self, ServerHandle) {
        let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (watch_tx, watch_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                store: NamespaceStore::new(),
                meta,
                clock: Box::new(clock),
                request_rx,
                watch_rx,
            },
            ServerHandle {
                request_tx,
                watch_tx,
            },
        )
    }

    /// Starts the loop on the current runtime.
    pub fn spawn(
        meta: ServerMeta,
        clock: impl Clock + 'static,
    ) -> (ServerHandle, JoinHandle<Result<(), LogError>>) {
        let (server, handle) = Self::new(meta, clock);
        (handle, tokio::spawn(server.run()))
    }

    pub fn store(&self) -> &NamespaceStore {
        &self.store
    }

    pub fn meta(&self) -> &ServerMeta {
        &self.meta
    }

    /// Runs until every [`ServerHandle`] is dropped.
    ///
    /// Returns an error only if a mutation log rejects an append, which means internal state can
    /// no longer be trusted.
    pub async fn run(mut self) -> Result<(), LogError> {
        tracing::info!(version = %self.meta.version, "state server running");
        let mut requests_open = true;
        let mut watches_open = true;

        loop {
            let removed = self.store.resolve_touched();
            if removed > 0 {
                tracing::trace!(removed, "resolution pass");
            }

            tokio::select! {
                maybe_msg = self.request_rx.recv(), if requests_open => {
                    match maybe_msg {
                        Some(RequestMessage { request, respond }) => {
                            let reply = self.dispatch(request)?;
                            let _ = respond.send(reply);
                        }
                        None => requests_open = false,
                    }
                }
                maybe_watch = self.watch_rx.recv(), if watches_open => {
                    match maybe_watch {
                        Some(WatchMessage { registration, deliver }) => {
                            self.register(registration, deliver);
                        }
                        None => watches_open = false,
                    }
                }
                else => break,
            }
        }

        tracing::info!(namespaces = self.store.len(), "state server stopped");
        Ok(())
    }

    /// One dispatcher cycle: routes a decoded request to its handler and builds the reply.
    pub fn dispatch(&mut self, request: Request) -> Result<Reply, LogError> {
        let Request {
            namespace,
            origin,
            command,
        } = request;
        tracing::debug!(namespace = %namespace, origin = %origin, command = command.name(), "request");

        let reply = match command {
            Command::RunAtomic { path, mutation } => {
                let ns = self.store.resolve(&namespace);
                match run_atomic(ns, &origin, &mutation, &path, self.clock.as_ref()) {
                    Ok(committed) => {
                        if committed.appended.is_some() {
                            self.store.touch(&namespace);
                        }
                        Ok(ReplyPayload::Value(committed.reply))
                    }
                    Err(ExecError::Rejected(err)) => Err(err),
                    Err(ExecError::Corrupted(err)) => {
                        tracing::error!(namespace = %namespace, error = %err, "mutation log corrupted");
                        return Err(err);
                    }
                }
            }
            Command::Ping { token } => Ok(ReplyPayload::Pong {
                token,
                pid: std::process::id(),
            }),
            Command::GetServerMeta => Ok(ReplyPayload::ServerMeta(self.meta.clone())),
            Command::Time => Ok(ReplyPayload::Time(self.clock.now())),
        };
        Ok(reply)
    }

    /// Registers a watch, answering it at once if the namespace's history already satisfies it.
    pub fn register(
        &mut self,
        registration: WatchRegistration,
        deliver: oneshot::Sender<EncodedRecord>,
    ) -> Registration {
        let WatchRegistration {
            watcher,
            exclude,
            namespace,
            not_before,
        } = registration;
        let watch = PendingWatch {
            exclude,
            not_before,
            deliver,
        };

        let outcome = self
            .store
            .resolve(&namespace)
            .register_watch(watcher.clone(), watch);
        if outcome == Registration::Pending {
            self.store.touch(&namespace);
        }
        tracing::debug!(namespace = %namespace, watcher = %watcher, not_before, ?outcome, "watch registered");
        outcome
    }
}

/// Cloneable entry point into a running [`StateServer`].
///
/// Network connection tasks hold one; so can any code in the same process.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    request_tx: mpsc::Sender<RequestMessage>,
    watch_tx: mpsc::Sender<WatchMessage>,
}

impl ServerHandle {
    /// Sends one request and waits for its reply.
    pub async fn request(&self, request: Request) -> Result<Reply, ClientError> {
        let (respond, reply) = oneshot::channel();
        self.request_tx
            .send(RequestMessage { request, respond })
            .await
            .map_err(|_| ClientError::Disconnected)?;
        reply.await.map_err(|_| ClientError::Disconnected)
    }

    /// Registers a watch and waits, possibly forever, for its delivery.
    ///
    /// Dropping the returned future abandons the watch; the server prunes it on its next pass.
    pub async fn watch(&self, registration: WatchRegistration) -> Result<EncodedRecord, ClientError> {
        let (deliver, delivery) = oneshot::channel();
        self.watch_tx
            .send(WatchMessage {
                registration,
                deliver,
            })
            .await
            .map_err(|_| ClientError::Disconnected)?;
        delivery.await.map_err(|_| ClientError::Disconnected)
    }

    /// Like [`ServerHandle::request`], flattening a server-side error into the result.
    pub async fn call(&self, request: Request) -> Result<ReplyPayload, ClientError> {
        Ok(self.request(request).await??)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{ServerError, TransformError};
    use crate::event::MutationRecord;
    use crate::ids::{NamespaceId, OriginId, WatcherId};
    use crate::mutation::Mutation;
    use crate::path::Path;
    use crate::value::Value;

    fn atomic(namespace: &str, origin: &str, mutation: Mutation) -> Request {
        Request {
            namespace: namespace.into(),
            origin: origin.into(),
            command: Command::RunAtomic {
                path: Path::root(),
                mutation,
            },
        }
    }

    fn registration(watcher: &str, exclude: Option<&str>, namespace: &str, not_before: f64) -> WatchRegistration {
        WatchRegistration {
            watcher: WatcherId::from(watcher),
            exclude: exclude.map(OriginId::from),
            namespace: NamespaceId::from(namespace),
            not_before,
        }
    }

    fn test_server(start: f64) -> (StateServer, ServerHandle, ManualClock) {
        let clock = ManualClock::new(start);
        let (server, handle) = StateServer::new(ServerMeta::new("state", "watch"), clock.clone());
        (server, handle, clock)
    }

    #[test]
    fn ping_meta_and_time_need_no_namespace() {
        let (mut server, _handle, _clock) = test_server(42.0);
        let ping = Request {
            namespace: NamespaceId::default(),
            origin: "a".into(),
            command: Command::Ping { token: b"hi".to_vec() },
        };
        assert_eq!(
            server.dispatch(ping).unwrap(),
            Ok(ReplyPayload::Pong {
                token: b"hi".to_vec(),
                pid: std::process::id()
            })
        );
        let time = Request {
            namespace: NamespaceId::default(),
            origin: "a".into(),
            command: Command::Time,
        };
        assert_eq!(server.dispatch(time).unwrap(), Ok(ReplyPayload::Time(42.0)));
        let meta = Request {
            namespace: NamespaceId::default(),
            origin: "a".into(),
            command: Command::GetServerMeta,
        };
        assert_eq!(
            server.dispatch(meta).unwrap(),
            Ok(ReplyPayload::ServerMeta(server.meta().clone()))
        );
        assert!(server.store().is_empty());
    }

    #[test]
    fn scenario_set_then_watch_resolves_from_history() {
        let (mut server, _handle, _clock) = test_server(10.0);
        let reply = server.dispatch(atomic("jar", "A", Mutation::set("cookies", 0))).unwrap();
        assert_eq!(reply, Ok(ReplyPayload::Value(Value::Null)));

        let ns = server.store().get(&"jar".into()).unwrap();
        assert_eq!(ns.log.len(), 1);
        assert_eq!(ns.document, [("cookies", 0)].into_iter().collect());

        let (tx, mut rx) = oneshot::channel();
        let outcome = server.register(registration("B", Some("B"), "jar", -1.0), tx);
        assert_eq!(outcome, Registration::Delivered);
        let record = MutationRecord::decode(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(record.after.get("cookies"), Some(&Value::Int(0)));
    }

    #[test]
    fn scenario_own_increments_never_wake_self_excluding_watcher() {
        let (mut server, _handle, clock) = test_server(10.0);
        server.dispatch(atomic("jar", "A", Mutation::set("cookies", 0))).unwrap().unwrap();

        let (tx, mut rx) = oneshot::channel();
        let outcome = server.register(registration("w", Some("A"), "jar", 9.0), tx);
        assert_eq!(outcome, Registration::Pending);

        for _ in 0..5 {
            clock.advance(1.0);
            server
                .dispatch(atomic("jar", "A", Mutation::increment("cookies", 1)))
                .unwrap()
                .unwrap();
        }
        server.store.resolve_touched();
        assert!(rx.try_recv().is_err());
        let ns = server.store().get(&"jar".into()).unwrap();
        assert_eq!(ns.log.len(), 6);
        assert_eq!(ns.document.get("cookies"), Some(&Value::Int(5)));
        assert!(ns.is_pending(&"w".into()));
    }

    #[test]
    fn scenario_failed_transform_changes_nothing() {
        let (mut server, _handle, _clock) = test_server(10.0);
        server.dispatch(atomic("s", "A", Mutation::set("x", 0))).unwrap().unwrap();
        server.dispatch(atomic("s", "A", Mutation::set("label", "text"))).unwrap().unwrap();

        let failing = Mutation::Batch(vec![Mutation::set("x", 1), Mutation::increment("label", 1)]);
        let reply = server.dispatch(atomic("s", "A", failing)).unwrap();
        assert!(matches!(
            reply,
            Err(ServerError::Transform(TransformError::TypeMismatch { .. }))
        ));
        let ns = server.store().get(&"s".into()).unwrap();
        assert_eq!(ns.document.get("x"), Some(&Value::Int(0)));
        assert_eq!(ns.log.len(), 2);
    }

    #[test]
    fn scenario_two_watchers_share_one_mutation() {
        let (mut server, _handle, clock) = test_server(10.0);
        server.dispatch(atomic("n", "A", Mutation::set("v", 1))).unwrap().unwrap();

        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        server.register(registration("w1", None, "n", 10.0), tx1);
        server.register(registration("w2", None, "n", 10.5), tx2);

        clock.set(11.0);
        server.dispatch(atomic("n", "A", Mutation::set("v", 2))).unwrap().unwrap();

        let first = rx1.try_recv().unwrap();
        let second = rx2.try_recv().unwrap();
        assert_eq!(first, second);
        let record = MutationRecord::decode(&first).unwrap();
        assert_eq!(record.timestamp, 11.0);
        assert_eq!(server.store().get(&"n".into()).unwrap().pending_len(), 0);
    }

    #[test]
    fn namespaces_do_not_see_each_others_mutations() {
        let (mut server, _handle, _clock) = test_server(10.0);
        let (tx, mut rx) = oneshot::channel();
        server.register(registration("w", None, "left", 0.0), tx);
        server.dispatch(atomic("right", "A", Mutation::set("x", 1))).unwrap().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(server.store().get(&"left".into()).unwrap().document, Value::empty_map());
    }

    #[tokio::test]
    async fn handle_drives_a_running_loop() {
        let clock = ManualClock::new(100.0);
        let (handle, task) = StateServer::spawn(ServerMeta::new("s", "w"), clock.clone());

        let waiter = handle.clone();
        let pending = tokio::spawn(async move {
            waiter
                .watch(registration("w", Some("me"), "ns", 100.0))
                .await
        });
        // Let the registration land before the mutation.
        tokio::task::yield_now().await;

        clock.set(101.0);
        let reply = handle.call(atomic("ns", "other", Mutation::set("k", "v"))).await.unwrap();
        assert_eq!(reply, ReplyPayload::Value(Value::Null));

        let delivered = timeout(Duration::from_secs(5), pending)
            .await
            .expect("delivery in time")
            .expect("task")
            .expect("delivered");
        let record = MutationRecord::decode(&delivered).unwrap();
        assert_eq!(record.after.get("k"), Some(&Value::from("v")));

        drop(handle);
        timeout(Duration::from_secs(5), task)
            .await
            .expect("loop exits once handles are gone")
            .expect("task")
            .expect("clean exit");
    }

    #[tokio::test]
    async fn remote_errors_come_back_through_the_handle() {
        let (handle, _task) = StateServer::spawn(ServerMeta::default(), ManualClock::new(1.0));
        let err = handle
            .call(atomic("ns", "a", Mutation::increment("missing", 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Remote(ServerError::Transform(_))));
    }
}
