//! Structured paths into a document.
//!
//! A path is a thin convenience for addressing nested values, not a query language. It is a list
//! of segments; an empty path addresses the value it is resolved against.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PathError;
use crate::value::Value;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => write!(f, "{key}"),
            Segment::Index(index) => write!(f, "{index}"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path(Vec<Segment>);

impl Path {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self(vec![Segment::Key(key.into())])
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(mut self, segment: Segment) -> Self {
        self.0.push(segment);
        self
    }

    /// Splits off the final segment, returning the parent path and the leaf.
    pub fn split_last(&self) -> Option<(Path, &Segment)> {
        let (last, parent) = self.0.split_last()?;
        Some((Path(parent.to_vec()), last))
    }

    /// Display form of the first `len` segments, used to locate errors.
    fn prefix(&self, len: usize) -> String {
        Path(self.0[..len].to_vec()).to_string()
    }

    pub fn resolve<'a>(&self, root: &'a Value) -> Result<&'a Value, PathError> {
        let mut current = root;
        for (depth, segment) in self.0.iter().enumerate() {
            let at = || self.prefix(depth);
            current = match current {
                Value::Map(map) => {
                    let key = segment.to_string();
                    map.get(&key)
                        .ok_or_else(|| PathError::MissingKey { at: at(), key })?
                }
                Value::List(items) => {
                    let index = list_index(segment, &at)?;
                    items.get(index).ok_or_else(|| PathError::IndexOutOfRange {
                        at: at(),
                        index,
                        len: items.len(),
                    })?
                }
                other => {
                    return Err(PathError::NotAContainer {
                        at: at(),
                        found: other.type_name().to_string(),
                    })
                }
            };
        }
        Ok(current)
    }

    pub fn resolve_mut<'a>(&self, root: &'a mut Value) -> Result<&'a mut Value, PathError> {
        let mut current = root;
        for (depth, segment) in self.0.iter().enumerate() {
            let at = || self.prefix(depth);
            current = match current {
                Value::Map(map) => {
                    let key = segment.to_string();
                    map.get_mut(&key)
                        .ok_or_else(|| PathError::MissingKey { at: at(), key })?
                }
                Value::List(items) => {
                    let index = list_index(segment, &at)?;
                    let len = items.len();
                    items
                        .get_mut(index)
                        .ok_or_else(|| PathError::IndexOutOfRange { at: at(), index, len })?
                }
                other => {
                    return Err(PathError::NotAContainer {
                        at: at(),
                        found: other.type_name().to_string(),
                    })
                }
            };
        }
        Ok(current)
    }
}

/// Interprets a segment as a list index. Keys that spell a number are accepted; any other key
/// names an element a list cannot have, so it is reported as missing.
pub(crate) fn list_index(segment: &Segment, at: &dyn Fn() -> String) -> Result<usize, PathError> {
    match segment {
        Segment::Index(index) => Ok(*index),
        Segment::Key(key) => key.parse().map_err(|_| PathError::MissingKey {
            at: at(),
            key: key.clone(),
        }),
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = std::convert::Infallible;

    /// Parses a dotted path. All-digit segments become indices; empty input is the root.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Path::root());
        }
        let segments = s
            .split('.')
            .map(|part| match part.parse::<usize>() {
                Ok(index) => Segment::Index(index),
                Err(_) => Segment::Key(part.to_string()),
            })
            .collect();
        Ok(Path(segments))
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(path) => path,
            Err(never) => match never {},
        }
    }
}

impl From<Vec<Segment>> for Path {
    fn from(segments: Vec<Segment>) -> Self {
        Path(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> Value {
        let inner: Value = [("levels", Value::from(vec![Value::Int(1), Value::Int(2)]))]
            .into_iter()
            .collect();
        [("game", inner)].into_iter().collect()
    }

    #[test]
    fn dotted_paths_mix_keys_and_indices() {
        let path = Path::from("game.levels.1");
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("game".into()),
                Segment::Key("levels".into()),
                Segment::Index(1)
            ]
        );
        assert_eq!(path.resolve(&nested()), Ok(&Value::Int(2)));
        assert!(Path::from("").is_root());
    }

    #[test]
    fn missing_key_reports_where_it_stopped() {
        let err = Path::from("game.score").resolve(&nested()).unwrap_err();
        assert_eq!(
            err,
            PathError::MissingKey {
                at: "game".into(),
                key: "score".into()
            }
        );
    }

    #[test]
    fn index_past_end_and_scalar_descent_fail() {
        let doc = nested();
        assert!(matches!(
            Path::from("game.levels.5").resolve(&doc),
            Err(PathError::IndexOutOfRange { index: 5, len: 2, .. })
        ));
        assert!(matches!(
            Path::from("game.levels.0.deeper").resolve(&doc),
            Err(PathError::NotAContainer { .. })
        ));
    }

    #[test]
    fn named_key_under_a_list_is_missing() {
        let doc = nested();
        assert_eq!(
            Path::from("game.levels.first").resolve(&doc),
            Err(PathError::MissingKey {
                at: "game.levels".into(),
                key: "first".into()
            })
        );
    }

    #[test]
    fn resolve_mut_allows_in_place_edits() {
        let mut doc = nested();
        *Path::from("game.levels.0").resolve_mut(&mut doc).unwrap() = Value::Int(10);
        assert_eq!(
            Path::from("game.levels").resolve(&doc),
            Ok(&Value::from(vec![Value::Int(10), Value::Int(2)]))
        );
    }
}
