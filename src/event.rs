//! Mutation records as stored in the log and delivered to watchers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Encoded form of a [`MutationRecord`] as kept in the log and delivered to watchers.
///
/// Records are encoded once, at append time, and shared between every watcher they are delivered
/// to, so the payload is reference counted rather than copied per delivery.
pub type EncodedRecord = Arc<[u8]>;

/// One accepted state transition of a namespace document.
///
/// A record is immutable once appended. It carries the full document before and after the
/// mutation, so a watcher can diff the two itself without asking the server for more state.
///
/// On the wire this is the `[before, after, timestamp]` triple in bincode's default configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MutationRecord {
    /// The whole document as it was before the mutation.
    pub before: Value,
    /// The whole document after the mutation.
    pub after: Value,
    /// Wall-clock seconds since the Unix epoch, captured before the mutation ran.
    pub timestamp: f64,
}

impl MutationRecord {
    pub fn encode(&self) -> bincode::Result<EncodedRecord> {
        Ok(bincode::serialize(self)?.into())
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Top-level keys whose value differs between `before` and `after`.
    ///
    /// A key present on only one side counts as changed.
    pub fn changed_keys(&self) -> Vec<String> {
        let empty: BTreeMap<String, Value> = BTreeMap::new();
        let before = self.before.as_map().unwrap_or(&empty);
        let after = self.after.as_map().unwrap_or(&empty);
        let keys: BTreeSet<&String> = before
            .keys()
            .chain(after.keys())
            .filter(|k| match (before.get(*k), after.get(*k)) {
                (Some(old), Some(new)) => !old.same_as(new),
                _ => true,
            })
            .collect();
        keys.into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_record_decodes_to_the_same_triple() {
        let record = MutationRecord {
            before: Value::empty_map(),
            after: [("cookies", 0)].into_iter().collect(),
            timestamp: 1_700_000_000.25,
        };
        let bytes = record.encode().expect("encode");
        assert_eq!(MutationRecord::decode(&bytes).expect("decode"), record);
    }

    #[test]
    fn changed_keys_covers_added_removed_and_edited() {
        let record = MutationRecord {
            before: [("a", 1), ("b", 2), ("c", 3)].into_iter().collect(),
            after: [("a", 1), ("b", 5), ("d", 4)].into_iter().collect(),
            timestamp: 0.0,
        };
        let keys = record.changed_keys();
        assert_eq!(keys, vec!["b", "c", "d"]);
    }
}
