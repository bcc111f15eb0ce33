//! Namespace store.
//!
//! Every namespace owns one document, one mutation log and one set of pending watches. Namespaces
//! are created on first reference and live as long as the store. The store is a plain owned value
//! handed to whoever runs the event loop; nothing here is global or shared between threads.

use std::collections::{HashMap, HashSet};

use crate::ids::{NamespaceId, WatcherId};
use crate::log::MutationLog;
use crate::value::Value;
use crate::watch::PendingWatch;

#[derive(Debug)]
pub struct Namespace {
    /// Current document. Always a map at the root.
    pub document: Value,
    pub log: MutationLog,
    pub(crate) pending: HashMap<WatcherId, PendingWatch>,
}

impl Default for Namespace {
    fn default() -> Self {
        Self {
            document: Value::empty_map(),
            log: MutationLog::new(),
            pending: HashMap::new(),
        }
    }
}

impl Namespace {
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, watcher: &WatcherId) -> bool {
        self.pending.contains_key(watcher)
    }
}

#[derive(Debug, Default)]
pub struct NamespaceStore {
    namespaces: HashMap<NamespaceId, Namespace>,
    /// Namespaces whose pending set may have become resolvable since the last pass.
    touched: HashSet<NamespaceId>,
}

impl NamespaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the namespace, creating an empty one on first reference.
    pub fn resolve(&mut self, id: &NamespaceId) -> &mut Namespace {
        if !self.namespaces.contains_key(id) {
            tracing::debug!(namespace = %id, "creating namespace");
        }
        self.namespaces.entry(id.clone()).or_default()
    }

    /// Read-only lookup that never allocates a namespace.
    pub fn get(&self, id: &NamespaceId) -> Option<&Namespace> {
        self.namespaces.get(id)
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NamespaceId> {
        self.namespaces.keys()
    }

    pub(crate) fn touch(&mut self, id: &NamespaceId) {
        if !self.touched.contains(id) {
            self.touched.insert(id.clone());
        }
    }

    /// Runs a resolution pass over every namespace touched since the previous pass.
    ///
    /// Returns the number of watches removed (delivered or abandoned).
    pub fn resolve_touched(&mut self) -> usize {
        let mut removed = 0;
        for id in self.touched.drain() {
            if let Some(namespace) = self.namespaces.get_mut(&id) {
                removed += namespace.solve_all_pending();
            }
        }
        removed
    }
}
