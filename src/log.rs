//! Per-namespace mutation log.
//!
//! The log is the history a namespace's watchers are resolved against. It is two parallel,
//! append-only arrays:
//! - the **timeline**: one timestamp per accepted mutation, sorted ascending (ties allowed, since
//!   stamps come from a wall clock and rapid mutations can share one);
//! - the **history**: the `(origin, encoded record)` pair for the same mutation.
//!
//! Entries are addressed by index. `timeline[i]` always describes `history[i]`; both only grow.
//! There is no compaction, so memory grows with the number of mutations.

use crate::error::LogError;
use crate::event::EncodedRecord;
use crate::ids::OriginId;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub origin: OriginId,
    pub record: EncodedRecord,
}

#[derive(Debug, Default)]
pub struct MutationLog {
    timeline: Vec<f64>,
    history: Vec<HistoryEntry>,
}

impl MutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn timeline(&self) -> &[f64] {
        &self.timeline
    }

    pub fn entry(&self, index: usize) -> Option<&HistoryEntry> {
        self.history.get(index)
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.timeline.last().copied()
    }

    /// Appends one accepted mutation and returns its index.
    ///
    /// A stamp smaller than the last one (or NaN) would break the sorted-timeline contract the
    /// binary search depends on, so it is refused. Callers clamp stamps before appending.
    pub fn append(
        &mut self,
        origin: OriginId,
        stamp: f64,
        record: EncodedRecord,
    ) -> Result<usize, LogError> {
        let last = self.last_timestamp().unwrap_or(f64::NEG_INFINITY);
        if stamp.is_nan() || stamp < last {
            return Err(LogError::TimelineRegression { last, stamp });
        }

        self.timeline.push(stamp);
        self.history.push(HistoryEntry { origin, record });
        Ok(self.history.len() - 1)
    }

    /// Index of the first entry stamped strictly after `not_before`.
    ///
    /// Right-biased: entries stamped exactly `not_before` count as already seen.
    pub fn first_after(&self, not_before: f64) -> usize {
        self.timeline.partition_point(|stamp| *stamp <= not_before)
    }

    /// Earliest entry stamped after `not_before` whose origin is not `exclude`.
    ///
    /// Entries sharing a timestamp are taken in append order.
    pub fn find_after(&self, not_before: f64, exclude: Option<&OriginId>) -> Option<usize> {
        if self.timeline.is_empty() {
            return None;
        }
        let start = self.first_after(not_before);
        self.history[start..]
            .iter()
            .position(|entry| Some(&entry.origin) != exclude)
            .map(|offset| start + offset)
    }

    /// Verifies the parallel-array invariants. Used by tests and debug assertions.
    pub fn check_invariants(&self) -> Result<(), LogError> {
        if self.timeline.len() != self.history.len() {
            return Err(LogError::LengthMismatch {
                timeline: self.timeline.len(),
                history: self.history.len(),
            });
        }
        for pair in self.timeline.windows(2) {
            if pair[0] > pair[1] {
                return Err(LogError::TimelineRegression {
                    last: pair[0],
                    stamp: pair[1],
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn payload(tag: u8) -> EncodedRecord {
        vec![tag].into()
    }

    fn log_of(entries: &[(f64, &str)]) -> MutationLog {
        let mut log = MutationLog::new();
        for (i, (stamp, origin)) in entries.iter().enumerate() {
            log.append(OriginId::from(*origin), *stamp, payload(i as u8))
                .expect("sorted input");
        }
        log
    }

    #[test]
    fn empty_log_finds_nothing() {
        let log = MutationLog::new();
        assert_eq!(log.find_after(f64::NEG_INFINITY, None), None);
        assert_eq!(log.first_after(0.0), 0);
    }

    #[test]
    fn boundary_stamp_is_already_seen() {
        let log = log_of(&[(1.0, "a"), (2.0, "a"), (2.0, "b"), (3.0, "a")]);
        assert_eq!(log.first_after(2.0), 3);
        assert_eq!(log.find_after(2.0, None), Some(3));
        assert_eq!(log.find_after(1.5, None), Some(1));
        assert_eq!(log.find_after(3.0, None), None);
    }

    #[test]
    fn excluded_origin_is_skipped_in_append_order() {
        let log = log_of(&[(1.0, "a"), (2.0, "a"), (2.0, "b"), (3.0, "a")]);
        let a = OriginId::from("a");
        assert_eq!(log.find_after(0.0, Some(&a)), Some(2));
        assert_eq!(log.find_after(2.0, Some(&a)), None);
    }

    #[test]
    fn regressing_or_nan_stamps_are_refused() {
        let mut log = log_of(&[(5.0, "a")]);
        assert!(matches!(
            log.append(OriginId::from("a"), 4.0, payload(9)),
            Err(LogError::TimelineRegression { .. })
        ));
        assert!(log.append(OriginId::from("a"), f64::NAN, payload(9)).is_err());
        assert_eq!(log.append(OriginId::from("a"), 5.0, payload(9)), Ok(1));
        assert!(log.check_invariants().is_ok());
    }

    proptest! {
        #[test]
        fn search_matches_linear_scan(
            steps in proptest::collection::vec((0u8..3, 0u8..3), 0..40),
            not_before in -1i32..60,
            exclude in proptest::option::of(0u8..3),
        ) {
            let mut log = MutationLog::new();
            let mut stamp = 0.0;
            for (delta, origin) in &steps {
                stamp += f64::from(*delta);
                log.append(OriginId::from(vec![*origin]), stamp, payload(*origin)).unwrap();
            }
            prop_assert!(log.check_invariants().is_ok());

            let not_before = f64::from(not_before);
            let exclude = exclude.map(|o| OriginId::from(vec![o]));
            let expected = (0..log.len()).find(|&i| {
                log.timeline()[i] > not_before
                    && Some(&log.entry(i).unwrap().origin) != exclude.as_ref()
            });
            prop_assert_eq!(log.find_after(not_before, exclude.as_ref()), expected);
        }
    }
}
