//! Error taxonomy shared by the server and its clients.
//!
//! Everything a client can observe travels back inside a [`ServerError`], so these types are
//! serializable. Errors are always local to one request: the server keeps serving after any of
//! them. The one exception is [`LogError`], which signals a broken internal invariant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A path did not resolve against the current document.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathError {
    #[error("no key {key:?} under {at}")]
    MissingKey { at: String, key: String },

    #[error("index {index} out of range under {at} (len {len})")]
    IndexOutOfRange { at: String, index: usize, len: usize },

    #[error("cannot descend into {found} at {at}")]
    NotAContainer { at: String, found: String },
}

/// A mutation verb failed while running against the document.
///
/// The executor rolls the document back before this reaches the caller.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransformError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("{op}: expected {expected}, found {found}")]
    TypeMismatch {
        op: String,
        expected: String,
        found: String,
    },

    #[error("{op}: integer overflow")]
    Overflow { op: String },

    #[error("{op}: needs a non-empty key")]
    EmptyKey { op: String },

    #[error("document root must stay a map, got {found}")]
    RootNotMap { found: String },
}

impl TransformError {
    pub(crate) fn mismatch(op: &str, expected: &str, found: &str) -> Self {
        TransformError::TypeMismatch {
            op: op.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// The error half of every reply the server sends.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerError {
    #[error("path error: {0}")]
    Path(#[from] PathError),

    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<bincode::Error> for ServerError {
    fn from(err: bincode::Error) -> Self {
        ServerError::Encoding(err.to_string())
    }
}

/// Internal invariant violation in a mutation log. Indicates a bug, never a client mistake.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LogError {
    #[error("timeline would regress: last stamp {last}, new stamp {stamp}")]
    TimelineRegression { last: f64, stamp: f64 },

    #[error("timeline has {timeline} entries but history has {history}")]
    LengthMismatch { timeline: usize, history: usize },
}
