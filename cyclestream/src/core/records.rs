//! Row model shared by every stage.
//!
//! Rows are ordered maps so that serialisation is deterministic; two decodes
//! of the same unit serialise to the same bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A single table row: column name to JSON value.
pub type Row = BTreeMap<String, Value>;

/// Reserved column names added by the engine.
pub mod columns {
    /// Unit path the record was decoded from.
    pub const SOURCE_FILE: &str = "_source_file";
    /// Modification token of the unit, as RFC3339.
    pub const INGESTED_AT: &str = "_ingested_at";
    /// Calendar date derived from the payload timestamp.
    pub const PARTITION_DATE: &str = "_partition_date";
    /// Fields that did not fit the inferred schema.
    pub const RESCUED_DATA: &str = "_rescued_data";
    /// Raw text of a record that failed to parse.
    pub const CORRUPT_RECORD: &str = "_corrupt_record";
    /// Names of flag-only constraints a row violated.
    pub const VIOLATIONS: &str = "_violations";

    /// Returns true for engine-managed provenance columns.
    #[must_use]
    pub fn is_reserved(name: &str) -> bool {
        matches!(
            name,
            SOURCE_FILE | INGESTED_AT | PARTITION_DATE | RESCUED_DATA | CORRUPT_RECORD | VIOLATIONS
        )
    }
}

/// One decoded document plus provenance. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    row: Row,
}

impl SourceRecord {
    /// Creates a record from decoded fields, attaching provenance columns.
    #[must_use]
    pub fn new(source_file: impl Into<String>, ingested_at: DateTime<Utc>, mut fields: Row) -> Self {
        fields.insert(columns::SOURCE_FILE.to_string(), Value::String(source_file.into()));
        fields.insert(
            columns::INGESTED_AT.to_string(),
            Value::String(ingested_at.to_rfc3339()),
        );
        Self { row: fields }
    }

    /// Rehydrates a record from a stored bronze row.
    #[must_use]
    pub fn from_row(row: Row) -> Self {
        Self { row }
    }

    /// Returns the unit path this record came from.
    #[must_use]
    pub fn source_file(&self) -> Option<&str> {
        self.row.get(columns::SOURCE_FILE).and_then(Value::as_str)
    }

    /// Returns a column value.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.row.get(column)
    }

    /// Returns the full row.
    #[must_use]
    pub fn row(&self) -> &Row {
        &self.row
    }

    /// Adds a derived provenance column.
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>, value: Value) -> Self {
        self.row.insert(column.into(), value);
        self
    }

    /// Consumes the record, returning its row.
    #[must_use]
    pub fn into_row(self) -> Row {
        self.row
    }
}

/// A flattened row produced by the flatten stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatRow(pub Row);

impl FlatRow {
    /// Returns a column value, treating absence as null.
    #[must_use]
    pub fn get(&self, column: &str) -> &Value {
        self.0.get(column).unwrap_or(&Value::Null)
    }

    /// Sets a column value.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the row.
    #[must_use]
    pub fn into_row(self) -> Row {
        self.0
    }
}

impl From<Row> for FlatRow {
    fn from(row: Row) -> Self {
        Self(row)
    }
}

/// Ordering value used to resolve competing snapshots of one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceValue {
    /// Numeric sequence, e.g. a unix timestamp.
    Number(f64),
    /// Textual sequence compared lexicographically, e.g. RFC3339.
    Text(String),
}

impl SequenceValue {
    /// Extracts a sequence from a column value. Nulls and containers have none.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) if !s.is_empty() => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    /// Converts back to a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

impl PartialEq for SequenceValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SequenceValue {}

impl PartialOrd for SequenceValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceValue {
    // Numbers sort before text so mixed feeds still have a total order.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Number(_), Self::Text(_)) => Ordering::Less,
            (Self::Text(_), Self::Number(_)) => Ordering::Greater,
        }
    }
}

/// A flat row tagged with its entity key and sequence value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Entity key, e.g. a station identifier.
    pub key: String,
    /// Ordering value, e.g. a last-updated timestamp.
    pub sequence: SequenceValue,
    /// The snapshot's columns.
    pub row: Row,
}

impl EntitySnapshot {
    /// Tags a row using the given key and sequence columns.
    ///
    /// Returns `None` when either column is missing or null.
    #[must_use]
    pub fn from_row(row: Row, key_column: &str, sequence_column: &str) -> Option<Self> {
        let key = match row.get(key_column)? {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let sequence = SequenceValue::from_value(row.get(sequence_column)?)?;
        Some(Self { key, sequence, row })
    }

    /// Canonical serialisation used to break sequence ties deterministically.
    #[must_use]
    pub fn canonical_content(&self) -> String {
        serde_json::to_string(&self.row).unwrap_or_default()
    }
}

/// The latest known state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentStateRow {
    /// Entity key.
    pub key: String,
    /// Sequence of the snapshot this row was taken from.
    pub sequence: SequenceValue,
    /// The row's columns.
    pub row: Row,
    /// Optimistic version, bumped on every replace.
    pub version: u64,
}

impl CurrentStateRow {
    /// Creates the first version of a row from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: EntitySnapshot) -> Self {
        Self {
            key: snapshot.key,
            sequence: snapshot.sequence,
            row: snapshot.row,
            version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_source_record_provenance() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let record = SourceRecord::new("weather_S1.json", at, row(&[("dt", json!(1))]));

        assert_eq!(record.source_file(), Some("weather_S1.json"));
        assert_eq!(record.get(columns::INGESTED_AT), Some(&json!(at.to_rfc3339())));
        assert_eq!(record.get("dt"), Some(&json!(1)));
    }

    #[test]
    fn test_sequence_ordering() {
        let a = SequenceValue::Number(50.0);
        let b = SequenceValue::Number(100.0);
        let t = SequenceValue::Text("2024-01-01".into());

        assert!(a < b);
        assert!(b < t);
        assert_eq!(SequenceValue::Number(1.0), SequenceValue::Number(1.0));
    }

    #[test]
    fn test_snapshot_from_row() {
        let r = row(&[("station_id", json!("S1")), ("last_updated", json!(100))]);
        let snap = EntitySnapshot::from_row(r, "station_id", "last_updated").unwrap();
        assert_eq!(snap.key, "S1");
        assert_eq!(snap.sequence, SequenceValue::Number(100.0));

        let numeric_key = row(&[("station_id", json!(7)), ("last_updated", json!(1))]);
        let snap = EntitySnapshot::from_row(numeric_key, "station_id", "last_updated").unwrap();
        assert_eq!(snap.key, "7");
    }

    #[test]
    fn test_snapshot_requires_key_and_sequence() {
        let no_key = row(&[("station_id", Value::Null), ("last_updated", json!(1))]);
        assert!(EntitySnapshot::from_row(no_key, "station_id", "last_updated").is_none());

        let no_seq = row(&[("station_id", json!("S1"))]);
        assert!(EntitySnapshot::from_row(no_seq, "station_id", "last_updated").is_none());
    }

    #[test]
    fn test_reserved_columns() {
        assert!(columns::is_reserved("_rescued_data"));
        assert!(!columns::is_reserved("station_id"));
    }
}
