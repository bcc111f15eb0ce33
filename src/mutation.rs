//! Server-side mutation verbs.
//!
//! Clients cannot ship code to the server. Instead they name one of these verbs (or a [`Batch`]
//! of them), and the executor applies it to the selected part of a namespace document. Keys are
//! paths relative to that target; the empty path means the target itself.
//!
//! [`Batch`]: Mutation::Batch

use std::collections::btree_map::Entry;

use serde::{Deserialize, Serialize};

use crate::error::{PathError, TransformError};
use crate::path::{list_index, Path};
use crate::value::Value;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Reply with a copy of the target.
    Snapshot,
    /// Reply with the value at `key`, or `default` (null when absent) if it does not exist.
    Get { key: Path, default: Option<Value> },
    Contains { key: Path },
    Len,
    Set { key: Path, value: Value },
    /// Remove and return the value at `key`. Missing keys fail unless a default is given.
    Remove { key: Path, default: Option<Value> },
    SetDefault { key: Path, value: Value },
    Increment { key: Path, by: Value },
    Append { key: Path, value: Value },
    /// Write `new` only if the current value equals `expected` (`None` meaning absent).
    CompareAndSwap {
        key: Path,
        expected: Option<Value>,
        new: Value,
    },
    /// Shallow-update a map target with the entries of `value`.
    Merge { value: Value },
    Clear,
    Replace { value: Value },
    /// Apply in order; the first failure aborts the whole batch.
    Batch(Vec<Mutation>),
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Snapshot => "snapshot",
            Mutation::Get { .. } => "get",
            Mutation::Contains { .. } => "contains",
            Mutation::Len => "len",
            Mutation::Set { .. } => "set",
            Mutation::Remove { .. } => "remove",
            Mutation::SetDefault { .. } => "set_default",
            Mutation::Increment { .. } => "increment",
            Mutation::Append { .. } => "append",
            Mutation::CompareAndSwap { .. } => "compare_and_swap",
            Mutation::Merge { .. } => "merge",
            Mutation::Clear => "clear",
            Mutation::Replace { .. } => "replace",
            Mutation::Batch(_) => "batch",
        }
    }

    /// Applies this verb to `target` in place and returns the reply value.
    ///
    /// On error `target` may be partially modified; restoring it is the executor's job.
    pub fn apply(&self, target: &mut Value) -> Result<Value, TransformError> {
        let op = self.name();
        match self {
            Mutation::Snapshot => Ok(target.clone()),
            Mutation::Get { key, default } => match key.resolve(target) {
                Ok(found) => Ok(found.clone()),
                Err(PathError::MissingKey { .. }) | Err(PathError::IndexOutOfRange { .. }) => {
                    Ok(default.clone().unwrap_or_default())
                }
                Err(err) => Err(err.into()),
            },
            Mutation::Contains { key } => match key.resolve(target) {
                Ok(_) => Ok(Value::Bool(true)),
                Err(err @ PathError::NotAContainer { .. }) => Err(err.into()),
                Err(_) => Ok(Value::Bool(false)),
            },
            Mutation::Len => {
                let len = match &*target {
                    Value::Map(map) => map.len(),
                    Value::List(items) => items.len(),
                    Value::Str(s) => s.chars().count(),
                    Value::Bytes(b) => b.len(),
                    other => return Err(TransformError::mismatch(op, "container", other.type_name())),
                };
                Ok(Value::Int(len as i64))
            }
            Mutation::Set { key, value } => {
                insert(op, target, key, value.clone())?;
                Ok(Value::Null)
            }
            Mutation::Remove { key, default } => match remove(op, target, key) {
                Ok(removed) => Ok(removed),
                Err(TransformError::Path(PathError::MissingKey { .. })) if default.is_some() => {
                    Ok(default.clone().unwrap_or_default())
                }
                Err(err) => Err(err),
            },
            Mutation::SetDefault { key, value } => {
                if let Ok(existing) = key.resolve(target) {
                    return Ok(existing.clone());
                }
                insert(op, target, key, value.clone())?;
                Ok(value.clone())
            }
            Mutation::Increment { key, by } => {
                let slot = key.resolve_mut(target)?;
                let next = add(op, slot, by)?;
                *slot = next.clone();
                Ok(next)
            }
            Mutation::Append { key, value } => match key.resolve_mut(target)? {
                Value::List(items) => {
                    items.push(value.clone());
                    Ok(Value::Int(items.len() as i64))
                }
                other => Err(TransformError::mismatch(op, "list", other.type_name())),
            },
            Mutation::CompareAndSwap { key, expected, new } => {
                let matches = match (key.resolve(target).ok(), expected) {
                    (None, None) => true,
                    (Some(current), Some(expected)) => current.same_as(expected),
                    _ => false,
                };
                if !matches {
                    return Ok(Value::Bool(false));
                }
                if key.is_root() {
                    *target = new.clone();
                } else {
                    insert(op, target, key, new.clone())?;
                }
                Ok(Value::Bool(true))
            }
            Mutation::Merge { value } => {
                let Value::Map(updates) = value else {
                    return Err(TransformError::mismatch(op, "map argument", value.type_name()));
                };
                match target {
                    Value::Map(map) => {
                        for (k, v) in updates {
                            map.insert(k.clone(), v.clone());
                        }
                        Ok(Value::Null)
                    }
                    other => Err(TransformError::mismatch(op, "map", other.type_name())),
                }
            }
            Mutation::Clear => {
                match target {
                    Value::Map(map) => map.clear(),
                    Value::List(items) => items.clear(),
                    other => return Err(TransformError::mismatch(op, "map or list", other.type_name())),
                }
                Ok(Value::Null)
            }
            Mutation::Replace { value } => {
                *target = value.clone();
                Ok(Value::Null)
            }
            Mutation::Batch(steps) => {
                let mut replies = Vec::with_capacity(steps.len());
                for step in steps {
                    replies.push(step.apply(target)?);
                }
                Ok(Value::List(replies))
            }
        }
    }
}

fn insert(op: &str, target: &mut Value, key: &Path, value: Value) -> Result<(), TransformError> {
    let Some((parent, leaf)) = key.split_last() else {
        return Err(TransformError::EmptyKey { op: op.to_string() });
    };
    let at = || parent.to_string();
    match parent.resolve_mut(target)? {
        Value::Map(map) => {
            map.insert(leaf.to_string(), value);
            Ok(())
        }
        Value::List(items) => {
            let index = list_index(leaf, &at)?;
            let len = items.len();
            match items.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(PathError::IndexOutOfRange { at: at(), index, len }.into()),
            }
        }
        other => Err(TransformError::mismatch(op, "map or list", other.type_name())),
    }
}

fn remove(op: &str, target: &mut Value, key: &Path) -> Result<Value, TransformError> {
    let Some((parent, leaf)) = key.split_last() else {
        return Err(TransformError::EmptyKey { op: op.to_string() });
    };
    let at = || parent.to_string();
    match parent.resolve_mut(target)? {
        Value::Map(map) => match map.entry(leaf.to_string()) {
            Entry::Occupied(entry) => Ok(entry.remove()),
            Entry::Vacant(entry) => Err(PathError::MissingKey {
                at: at(),
                key: entry.into_key(),
            }
            .into()),
        },
        Value::List(items) => {
            let index = list_index(leaf, &at)?;
            if index >= items.len() {
                return Err(PathError::IndexOutOfRange {
                    at: at(),
                    index,
                    len: items.len(),
                }
                .into());
            }
            Ok(items.remove(index))
        }
        other => Err(TransformError::mismatch(op, "map or list", other.type_name())),
    }
}

fn add(op: &str, current: &Value, by: &Value) -> Result<Value, TransformError> {
    match (current, by) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(*b)
            .map(Value::Int)
            .ok_or_else(|| TransformError::Overflow { op: op.to_string() }),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            match (current.as_f64(), by.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a + b)),
                _ => Err(TransformError::mismatch(op, "number", current.type_name())),
            }
        }
        (Value::Int(_) | Value::Float(_), other) => {
            Err(TransformError::mismatch(op, "numeric step", other.type_name()))
        }
        (other, _) => Err(TransformError::mismatch(op, "number", other.type_name())),
    }
}

/// Builders for the common verbs.
impl Mutation {
    pub fn set(key: impl Into<Path>, value: impl Into<Value>) -> Self {
        Mutation::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn get(key: impl Into<Path>) -> Self {
        Mutation::Get {
            key: key.into(),
            default: None,
        }
    }

    pub fn remove(key: impl Into<Path>) -> Self {
        Mutation::Remove {
            key: key.into(),
            default: None,
        }
    }

    pub fn increment(key: impl Into<Path>, by: impl Into<Value>) -> Self {
        Mutation::Increment {
            key: key.into(),
            by: by.into(),
        }
    }

    pub fn append(key: impl Into<Path>, value: impl Into<Value>) -> Self {
        Mutation::Append {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn compare_and_swap(
        key: impl Into<Path>,
        expected: Option<Value>,
        new: impl Into<Value>,
    ) -> Self {
        Mutation::CompareAndSwap {
            key: key.into(),
            expected,
            new: new.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Value {
        [
            ("cookies", Value::Int(3)),
            ("name", Value::from("jar")),
            ("eaten", Value::from(Vec::<Value>::new())),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn set_and_get_roundtrip_through_verbs() {
        let mut d = doc();
        assert_eq!(Mutation::set("flavour", "oat").apply(&mut d), Ok(Value::Null));
        assert_eq!(Mutation::get("flavour").apply(&mut d), Ok(Value::from("oat")));
        assert_eq!(Mutation::get("missing").apply(&mut d), Ok(Value::Null));
    }

    #[test]
    fn increment_integer_and_float() {
        let mut d = doc();
        assert_eq!(Mutation::increment("cookies", 2).apply(&mut d), Ok(Value::Int(5)));
        assert_eq!(
            Mutation::increment("cookies", 0.5).apply(&mut d),
            Ok(Value::Float(5.5))
        );
        assert_eq!(d.get("cookies"), Some(&Value::Float(5.5)));
    }

    #[test]
    fn increment_rejects_strings_and_overflow() {
        let mut d = doc();
        assert!(matches!(
            Mutation::increment("name", 1).apply(&mut d),
            Err(TransformError::TypeMismatch { .. })
        ));
        let mut big: Value = [("n", Value::Int(i64::MAX))].into_iter().collect();
        assert!(matches!(
            Mutation::increment("n", 1).apply(&mut big),
            Err(TransformError::Overflow { .. })
        ));
    }

    #[test]
    fn append_reports_new_length() {
        let mut d = doc();
        assert_eq!(Mutation::append("eaten", 1).apply(&mut d), Ok(Value::Int(1)));
        assert_eq!(Mutation::append("eaten", 2).apply(&mut d), Ok(Value::Int(2)));
        assert!(Mutation::append("cookies", 1).apply(&mut d).is_err());
    }

    #[test]
    fn remove_with_and_without_default() {
        let mut d = doc();
        assert_eq!(Mutation::remove("name").apply(&mut d), Ok(Value::from("jar")));
        assert!(matches!(
            Mutation::remove("name").apply(&mut d),
            Err(TransformError::Path(PathError::MissingKey { .. }))
        ));
        let pop = Mutation::Remove {
            key: "name".into(),
            default: Some(Value::Int(0)),
        };
        assert_eq!(pop.apply(&mut d), Ok(Value::Int(0)));
    }

    #[test]
    fn compare_and_swap_only_on_match() {
        let mut d = doc();
        let miss = Mutation::compare_and_swap("cookies", Some(Value::Int(9)), 0);
        assert_eq!(miss.apply(&mut d), Ok(Value::Bool(false)));
        assert_eq!(d.get("cookies"), Some(&Value::Int(3)));

        let hit = Mutation::compare_and_swap("cookies", Some(Value::Int(3)), 0);
        assert_eq!(hit.apply(&mut d), Ok(Value::Bool(true)));
        assert_eq!(d.get("cookies"), Some(&Value::Int(0)));

        let absent = Mutation::compare_and_swap("fresh", None, true);
        assert_eq!(absent.apply(&mut d), Ok(Value::Bool(true)));
    }

    #[test]
    fn root_compare_and_swap_replaces_whole_document() {
        let mut d = doc();
        let next: Value = [("cookies", 1)].into_iter().collect();
        let swap = Mutation::compare_and_swap(Path::root(), Some(doc()), next.clone());
        assert_eq!(swap.apply(&mut d), Ok(Value::Bool(true)));
        assert_eq!(d, next);
    }

    #[test]
    fn merge_set_default_and_clear() {
        let mut d = doc();
        let update: Value = [("cookies", 10), ("jars", 2)].into_iter().collect();
        Mutation::Merge { value: update }.apply(&mut d).unwrap();
        assert_eq!(d.get("jars"), Some(&Value::Int(2)));

        let sd = Mutation::SetDefault {
            key: "cookies".into(),
            value: Value::Int(0),
        };
        assert_eq!(sd.apply(&mut d), Ok(Value::Int(10)));

        Mutation::Clear.apply(&mut d).unwrap();
        assert_eq!(d, Value::empty_map());
    }

    #[test]
    fn replace_overwrites_whatever_it_targets() {
        let mut d = doc();
        Mutation::Replace { value: Value::Int(1) }.apply(&mut d).unwrap();
        assert_eq!(d, Value::Int(1));
        let mut n = Value::Int(1);
        Mutation::Replace { value: Value::from("x") }.apply(&mut n).unwrap();
        assert_eq!(n, Value::from("x"));
    }

    #[test]
    fn compare_and_swap_matches_nan_by_bits() {
        let mut d: Value = [("x", f64::NAN)].into_iter().collect();
        let swap = Mutation::compare_and_swap("x", Some(Value::Float(f64::NAN)), 1);
        assert_eq!(swap.apply(&mut d), Ok(Value::Bool(true)));
        assert_eq!(d.get("x"), Some(&Value::Int(1)));
    }

    #[test]
    fn named_key_under_a_list_reads_as_absent() {
        let mut d: Value = [("xs", Value::from(vec![Value::Int(0)]))].into_iter().collect();
        let get = Mutation::Get {
            key: "xs.first".into(),
            default: Some(Value::Int(-1)),
        };
        assert_eq!(get.apply(&mut d), Ok(Value::Int(-1)));
        assert_eq!(Mutation::get("xs.first").apply(&mut d), Ok(Value::Null));
        assert_eq!(
            Mutation::Contains { key: "xs.first".into() }.apply(&mut d),
            Ok(Value::Bool(false))
        );
    }

    #[test]
    fn batch_stops_at_first_failure() {
        let mut d = doc();
        let batch = Mutation::Batch(vec![
            Mutation::set("x", 1),
            Mutation::increment("name", 1),
            Mutation::set("y", 2),
        ]);
        assert!(batch.apply(&mut d).is_err());
        assert_eq!(d.get("x"), Some(&Value::Int(1)), "rollback is the executor's job");
        assert_eq!(d.get("y"), None);
    }

    #[test]
    fn set_on_list_element_and_empty_key() {
        let mut d: Value = [("xs", Value::from(vec![Value::Int(0), Value::Int(0)]))]
            .into_iter()
            .collect();
        Mutation::set("xs.1", 7).apply(&mut d).unwrap();
        assert_eq!(
            d.get("xs"),
            Some(&Value::from(vec![Value::Int(0), Value::Int(7)]))
        );
        assert!(matches!(
            Mutation::set(Path::root(), 1).apply(&mut d),
            Err(TransformError::EmptyKey { .. })
        ));
    }
}
