//! Activity filtering between consecutive snapshots.
//!
//! Counters are reported as the backend accumulated them since the statement
//! entered its statistics cache; a counter observed lower than before means
//! the backend evicted and reinstated the statement (tracking restarted),
//! never negative activity. The previous snapshot serves as the activity
//! gate: a statement whose call count did not change since the previous
//! snapshot is suppressed so dormant statements do not flood every response.
//! The very first snapshot after start has no basis for comparison and is
//! reported in full.

use std::collections::BTreeMap;

use super::snapshot::Snapshot;
use crate::connector::SqlValue;

/// One emitted statement record: the full column map of the detected
/// backend variant.
pub type ReportRecord = BTreeMap<&'static str, SqlValue>;

/// Filters `current` against `previous`, preserving `current`'s row order.
pub fn diff(current: &Snapshot, previous: Option<&Snapshot>) -> Vec<ReportRecord> {
    let Some(previous) = previous else {
        return current.rows.iter().map(|r| r.columns.clone()).collect();
    };

    let prev_index = previous.index();
    current
        .rows
        .iter()
        .filter(|row| match prev_index.get(&row.key) {
            // new statement since the previous snapshot
            None => true,
            Some(prev) => prev.calls() != row.calls(),
        })
        .map(|r| r.columns.clone())
        .collect()
}
