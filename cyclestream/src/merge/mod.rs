//! Current-state merge: last-writer-wins by sequence, not by arrival.
//!
//! A batch of snapshots is first reduced to one snapshot per key (highest
//! sequence, ties broken by canonical content), then compared with the
//! stored row. Only a strictly greater sequence replaces the stored row, so
//! replays and stale snapshots are no-ops and the final state is the same
//! whatever order snapshots arrive in.

use crate::core::{CurrentStateRow, EntitySnapshot, Row};
use crate::storage::Upsert;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Key and sequence columns of a current-state table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSpec {
    /// Entity key column.
    pub key: String,
    /// Monotonic ordering column.
    pub sequence: String,
}

impl MergeSpec {
    /// Creates a merge spec.
    #[must_use]
    pub fn new(key: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            sequence: sequence.into(),
        }
    }

    /// Tags rows as snapshots; returns them with the count of untaggable rows.
    #[must_use]
    pub fn snapshots(&self, rows: Vec<Row>) -> (Vec<EntitySnapshot>, u64) {
        let mut unkeyed = 0;
        let snapshots = rows
            .into_iter()
            .filter_map(|row| {
                let snapshot = EntitySnapshot::from_row(row, &self.key, &self.sequence);
                if snapshot.is_none() {
                    unkeyed += 1;
                }
                snapshot
            })
            .collect();
        (snapshots, unkeyed)
    }
}

/// Counters from one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Snapshots considered.
    pub snapshots_in: u64,
    /// Snapshots superseded within the batch.
    pub superseded: u64,
    /// Keys inserted.
    pub inserted: u64,
    /// Keys replaced by a newer sequence.
    pub updated: u64,
    /// Snapshots not newer than the stored row.
    pub stale: u64,
}

fn wins(candidate: &EntitySnapshot, incumbent: &EntitySnapshot) -> bool {
    match candidate.sequence.cmp(&incumbent.sequence) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.canonical_content() > incumbent.canonical_content(),
    }
}

/// Reduces a batch to the winning snapshot per key.
///
/// The result is independent of input order.
#[must_use]
pub fn reduce_batch(snapshots: Vec<EntitySnapshot>) -> (BTreeMap<String, EntitySnapshot>, u64) {
    let mut winners: BTreeMap<String, EntitySnapshot> = BTreeMap::new();
    let mut superseded = 0;
    for snapshot in snapshots {
        match winners.get(&snapshot.key) {
            Some(incumbent) => {
                superseded += 1;
                if wins(&snapshot, incumbent) {
                    winners.insert(snapshot.key.clone(), snapshot);
                }
            }
            None => {
                winners.insert(snapshot.key.clone(), snapshot);
            }
        }
    }
    (winners, superseded)
}

/// Plans guarded writes for a batch against the rows read from the store.
///
/// `existing` must hold the stored row for every key in the batch that has
/// one. Each returned [`Upsert`] expects the version that was read.
#[must_use]
pub fn plan_changes(
    snapshots: Vec<EntitySnapshot>,
    existing: &HashMap<String, CurrentStateRow>,
) -> (Vec<Upsert>, MergeReport) {
    let mut report = MergeReport {
        snapshots_in: snapshots.len() as u64,
        ..MergeReport::default()
    };
    let (winners, superseded) = reduce_batch(snapshots);
    report.superseded = superseded;

    let mut upserts = Vec::new();
    for (key, snapshot) in winners {
        match existing.get(&key) {
            None => {
                report.inserted += 1;
                upserts.push(Upsert {
                    expected_version: None,
                    row: CurrentStateRow::from_snapshot(snapshot),
                });
            }
            Some(stored) if snapshot.sequence > stored.sequence => {
                report.updated += 1;
                upserts.push(Upsert {
                    expected_version: Some(stored.version),
                    row: CurrentStateRow {
                        version: stored.version + 1,
                        ..CurrentStateRow::from_snapshot(snapshot)
                    },
                });
            }
            Some(_) => report.stale += 1,
        }
    }
    (upserts, report)
}

/// Applies a batch directly to an in-memory current-state table.
pub fn apply_changes(
    snapshots: Vec<EntitySnapshot>,
    current: &mut BTreeMap<String, CurrentStateRow>,
) -> MergeReport {
    let keys: Vec<&String> = snapshots.iter().map(|s| &s.key).collect();
    let existing: HashMap<String, CurrentStateRow> = keys
        .into_iter()
        .filter_map(|k| current.get(k).map(|row| (k.clone(), row.clone())))
        .collect();

    let (upserts, report) = plan_changes(snapshots, &existing);
    for upsert in upserts {
        current.insert(upsert.row.key.clone(), upsert.row);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SequenceValue;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn snap(key: &str, seq: i64, name: &str) -> EntitySnapshot {
        let row: Row = [
            ("station_id".to_string(), json!(key)),
            ("last_updated".to_string(), json!(seq)),
            ("name".to_string(), json!(name)),
        ]
        .into_iter()
        .collect();
        EntitySnapshot::from_row(row, "station_id", "last_updated").unwrap()
    }

    #[test]
    fn test_reverse_arrival_keeps_highest_sequence() {
        let mut state = BTreeMap::new();
        apply_changes(vec![snap("S1", 50, "old")], &mut state);
        let report = apply_changes(vec![snap("S1", 100, "new")], &mut state);

        assert_eq!(report.updated, 1);
        assert_eq!(state["S1"].row["name"], json!("new"));
        assert_eq!(state["S1"].sequence, SequenceValue::Number(100.0));
        assert_eq!(state["S1"].version, 2);
    }

    #[test]
    fn test_stale_snapshot_is_noop() {
        let mut state = BTreeMap::new();
        apply_changes(vec![snap("S1", 100, "new")], &mut state);
        let before = state.clone();

        let report = apply_changes(vec![snap("S1", 50, "old"), snap("S1", 100, "dup")], &mut state);

        assert_eq!(report.stale, 1);
        assert_eq!(report.superseded, 1);
        assert_eq!(state, before);
    }

    #[test]
    fn test_order_independence() {
        let snapshots = vec![
            snap("S1", 10, "a"),
            snap("S1", 30, "c"),
            snap("S2", 5, "x"),
            snap("S1", 20, "b"),
            snap("S2", 7, "y"),
            snap("S1", 30, "c2"),
        ];

        let mut forward = BTreeMap::new();
        for s in snapshots.clone() {
            apply_changes(vec![s], &mut forward);
        }
        let mut batched = BTreeMap::new();
        let mut reversed = snapshots.clone();
        reversed.reverse();
        apply_changes(reversed, &mut batched);

        let rows = |state: &BTreeMap<String, CurrentStateRow>| -> Vec<Value> {
            state.values().map(|r| r.row["last_updated"].clone()).collect()
        };
        assert_eq!(rows(&forward), vec![json!(30), json!(7)]);
        assert_eq!(rows(&forward), rows(&batched));
    }

    #[test]
    fn test_intra_batch_tie_is_deterministic() {
        let (a, _) = reduce_batch(vec![snap("S1", 30, "c"), snap("S1", 30, "c2")]);
        let (b, _) = reduce_batch(vec![snap("S1", 30, "c2"), snap("S1", 30, "c")]);
        assert_eq!(a, b);
        assert_eq!(a["S1"].row["name"], json!("c2"));
    }

    #[test]
    fn test_plan_carries_expected_versions() {
        let mut existing = HashMap::new();
        existing.insert(
            "S1".to_string(),
            CurrentStateRow {
                version: 4,
                ..CurrentStateRow::from_snapshot(snap("S1", 1, "old"))
            },
        );
        let (upserts, report) = plan_changes(vec![snap("S1", 2, "new"), snap("S2", 1, "n")], &existing);

        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(upserts[0].expected_version, Some(4));
        assert_eq!(upserts[0].row.version, 5);
        assert_eq!(upserts[1].expected_version, None);
        assert_eq!(upserts[1].row.version, 1);
    }

    #[test]
    fn test_rows_without_key_are_counted() {
        let spec = MergeSpec::new("station_id", "last_updated");
        let rows: Vec<Row> = vec![
            [("station_id".to_string(), json!("S1")), ("last_updated".to_string(), json!(1))]
                .into_iter()
                .collect(),
            [("last_updated".to_string(), json!(1))].into_iter().collect(),
            [("station_id".to_string(), json!("S2"))].into_iter().collect(),
        ];
        let (snapshots, unkeyed) = spec.snapshots(rows);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(unkeyed, 2);
    }
}
