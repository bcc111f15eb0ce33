//! Atomic executor.
//!
//! Runs one mutation against one namespace as an indivisible step: the document either ends up
//! fully transformed with a matching log entry, or exactly as it was with no trace in the log.
//! Exclusivity needs no locking because only the event loop calls into here.

use crate::clock::Clock;
use crate::error::{LogError, ServerError, TransformError};
use crate::event::MutationRecord;
use crate::ids::OriginId;
use crate::mutation::Mutation;
use crate::namespace::Namespace;
use crate::path::Path;
use crate::value::Value;

/// Failure of [`run_atomic`].
#[derive(Debug)]
pub enum ExecError {
    /// The request was refused; the namespace is untouched. Sent back to the caller.
    Rejected(ServerError),
    /// The log refused an append. This is a server bug, not a client error.
    Corrupted(LogError),
}

impl From<ServerError> for ExecError {
    fn from(err: ServerError) -> Self {
        ExecError::Rejected(err)
    }
}

/// What a successful run did to the namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    /// The mutation's reply value.
    pub reply: Value,
    /// Index of the new log entry, or `None` when the document did not change.
    pub appended: Option<usize>,
    /// Watches resolved as a consequence of the append.
    pub woke: usize,
}

/// Applies `mutation` to the part of `namespace`'s document selected by `path`.
///
/// On success with a change, the `[before, after, stamp]` record is appended under `origin` and
/// the namespace's pending watches are resolved before returning. A transform that leaves the
/// document bit-identical to what it was produces no log entry and wakes nobody. A commit that
/// would leave the root something other than a map is rolled back.
pub fn run_atomic(
    namespace: &mut Namespace,
    origin: &OriginId,
    mutation: &Mutation,
    path: &Path,
    clock: &dyn Clock,
) -> Result<Committed, ExecError> {
    let before = namespace.document.clone();
    let stamp = next_stamp(clock.now(), namespace.log.last_timestamp());

    let target = path
        .resolve_mut(&mut namespace.document)
        .map_err(ServerError::from)?;

    let reply = match mutation.apply(target) {
        Ok(reply) => reply,
        Err(err) => {
            namespace.document = before;
            tracing::debug!(op = mutation.name(), %path, error = %err, "transform failed, rolled back");
            return Err(ServerError::Transform(err).into());
        }
    };

    if !matches!(namespace.document, Value::Map(_)) {
        let found = namespace.document.type_name().to_string();
        namespace.document = before;
        return Err(ServerError::Transform(TransformError::RootNotMap { found }).into());
    }

    if namespace.document.same_as(&before) {
        return Ok(Committed {
            reply,
            appended: None,
            woke: 0,
        });
    }

    let record = MutationRecord {
        before,
        after: namespace.document.clone(),
        timestamp: stamp,
    };
    let encoded = match record.encode() {
        Ok(encoded) => encoded,
        Err(err) => {
            namespace.document = record.before;
            return Err(ServerError::from(err).into());
        }
    };

    let index = match namespace.log.append(origin.clone(), stamp, encoded) {
        Ok(index) => index,
        Err(err) => {
            namespace.document = record.before;
            return Err(ExecError::Corrupted(err));
        }
    };
    let woke = namespace.solve_all_pending();

    tracing::debug!(
        op = mutation.name(),
        origin = %origin,
        index,
        stamp,
        woke,
        "mutation committed"
    );

    Ok(Committed {
        reply,
        appended: Some(index),
        woke,
    })
}

/// Stamp for the next log entry: the clock reading, unless the clock has not moved past the
/// last entry, in which case the smallest float above it. Stamps therefore never tie, and a
/// cursor resuming from one record's stamp still sees every later record.
fn next_stamp(now: f64, last: Option<f64>) -> f64 {
    match last {
        Some(last) if !(now > last) => next_above(last),
        _ => now,
    }
}

fn next_above(x: f64) -> f64 {
    if x.is_nan() || x == f64::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f64::from_bits(1);
    }
    let bits = x.to_bits();
    if x > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}
