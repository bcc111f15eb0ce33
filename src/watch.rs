//! Watch resolution.
//!
//! A watch asks for the earliest mutation of a namespace stamped strictly after `not_before` that
//! was not caused by `exclude`. It may be satisfied by history that already exists (the watch is
//! answered immediately and never stored) or by a mutation that happens later (the watch waits in
//! the namespace's pending set until a resolution pass finds it a record).

use tokio::sync::oneshot;

use crate::event::EncodedRecord;
use crate::ids::{OriginId, WatcherId};
use crate::log::MutationLog;
use crate::namespace::Namespace;

/// A stored watch and the route its delivery takes back to the client.
#[derive(Debug)]
pub struct PendingWatch {
    pub exclude: Option<OriginId>,
    pub not_before: f64,
    pub deliver: oneshot::Sender<EncodedRecord>,
}

impl PendingWatch {
    /// The client stopped waiting (timed out, cancelled, disconnected).
    pub fn is_abandoned(&self) -> bool {
        self.deliver.is_closed()
    }
}

/// Outcome of registering a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// History already held a qualifying record; it was sent.
    Delivered,
    /// Nothing qualifies yet; the watch is pending.
    Pending,
    /// A record qualified but the client was already gone.
    Abandoned,
}

/// Looks up the record that would satisfy a watch, without delivering it.
pub fn solve_one(log: &MutationLog, exclude: Option<&OriginId>, not_before: f64) -> Option<EncodedRecord> {
    let index = log.find_after(not_before, exclude)?;
    log.entry(index).map(|entry| entry.record.clone())
}

impl Namespace {
    /// Registers a watch, answering it straight away when history allows.
    ///
    /// A second registration under the same watcher id replaces the first; the replaced watch's
    /// client sees its delivery route close.
    pub fn register_watch(&mut self, watcher: WatcherId, watch: PendingWatch) -> Registration {
        match solve_one(&self.log, watch.exclude.as_ref(), watch.not_before) {
            Some(record) => {
                self.pending.remove(&watcher);
                match watch.deliver.send(record) {
                    Ok(()) => Registration::Delivered,
                    Err(_) => Registration::Abandoned,
                }
            }
            None => {
                self.pending.insert(watcher, watch);
                Registration::Pending
            }
        }
    }

    /// Resolves every pending watch the log can now satisfy and drops abandoned ones.
    ///
    /// Returns how many watches were removed. Calling it again without an intervening append
    /// removes nothing new.
    pub fn solve_all_pending(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }

        let mut resolved = Vec::new();
        for (watcher, watch) in &self.pending {
            if watch.is_abandoned() {
                resolved.push((watcher.clone(), None));
                continue;
            }
            if let Some(record) = solve_one(&self.log, watch.exclude.as_ref(), watch.not_before) {
                resolved.push((watcher.clone(), Some(record)));
            }
        }

        let removed = resolved.len();
        for (watcher, record) in resolved {
            let Some(watch) = self.pending.remove(&watcher) else {
                continue;
            };
            match record {
                Some(record) => {
                    if watch.deliver.send(record).is_err() {
                        tracing::debug!(watcher = %watcher, "watcher left before delivery");
                    } else {
                        tracing::trace!(watcher = %watcher, "watch delivered");
                    }
                }
                None => tracing::debug!(watcher = %watcher, "dropping abandoned watch"),
            }
        }
        removed
    }
}
