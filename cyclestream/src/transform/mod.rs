//! Flatten/normalize engine.
//!
//! [`flatten`] is a pure function from bronze records to silver rows. For
//! each record it:
//!
//! 1. explodes the configured array field into one working row per element,
//!    each element's fields laid over the record's top-level scalars;
//! 2. projects dotted paths to flat columns, or auto-flattens nested objects
//!    joining names with `_` when no projections are configured;
//! 3. coalesces configured defaults into null or missing columns;
//! 4. evaluates derived columns in declaration order;
//! 5. applies quality constraints in declaration order.
//!
//! Provenance columns (`_source_file`, `_ingested_at`, `_partition_date`)
//! are always carried through.

mod derived;

pub use derived::{DerivedColumn, DerivedExpr};

use crate::core::{columns, FlatRow, Row, SourceRecord};
use crate::quality::{apply_constraints, QualityConstraint, QualityReport};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const CARRIED_COLUMNS: [&str; 3] = [
    columns::SOURCE_FILE,
    columns::INGESTED_AT,
    columns::PARTITION_DATE,
];

/// A dotted source path renamed to a flat column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    /// Dotted path into the working row, e.g. `main.temp`.
    pub source: String,
    /// Output column name; defaults to the path with `.` replaced by `_`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Projection {
    /// Projects a path under its underscore-joined name.
    #[must_use]
    pub fn path(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            alias: None,
        }
    }

    /// Projects a path under an explicit name.
    #[must_use]
    pub fn renamed(source: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            alias: Some(alias.into()),
        }
    }

    /// Returns the output column name.
    #[must_use]
    pub fn output_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| self.source.replace('.', "_"))
    }
}

/// Declarative description of one flatten stage's transform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlattenSpec {
    /// Dotted path of the array to explode; `None` for pass-through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explode: Option<String>,
    /// Columns to project; empty means auto-flatten.
    #[serde(default)]
    pub projections: Vec<Projection>,
    /// Values substituted for null or missing columns.
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    /// Derived columns, evaluated in order.
    #[serde(default)]
    pub derived: Vec<DerivedColumn>,
    /// Constraints, applied in order.
    #[serde(default)]
    pub constraints: Vec<QualityConstraint>,
    /// Add a `_violations` column to rows with flag-only violations.
    #[serde(default)]
    pub annotate_violations: bool,
}

impl FlattenSpec {
    /// Returns the set of columns this spec produces, when knowable.
    ///
    /// `None` when auto-flattening, since the columns depend on the data.
    #[must_use]
    pub fn output_columns(&self) -> Option<Vec<String>> {
        if self.projections.is_empty() {
            return None;
        }
        let mut names: Vec<String> = self.projections.iter().map(Projection::output_name).collect();
        names.extend(self.defaults.keys().cloned());
        names.extend(self.derived.iter().map(|d| d.name.clone()));
        names.extend(CARRIED_COLUMNS.iter().map(ToString::to_string));
        names.sort();
        names.dedup();
        Some(names)
    }
}

/// Rows produced by one flatten call plus counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlattenOutput {
    /// Rows that survived the constraints.
    pub rows: Vec<FlatRow>,
    /// Source records consumed.
    pub records_in: u64,
    /// Rows produced before constraints were applied.
    pub rows_exploded: u64,
    /// Constraint counters.
    pub quality: QualityReport,
}

/// Flattens records according to a spec.
#[must_use]
pub fn flatten(spec: &FlattenSpec, records: &[SourceRecord]) -> FlattenOutput {
    let mut rows = Vec::new();
    for record in records {
        for working in explode(spec.explode.as_deref(), record.row()) {
            rows.push(shape(spec, &working));
        }
    }

    let rows_exploded = rows.len() as u64;
    let (rows, quality) = apply_constraints(&spec.constraints, rows, spec.annotate_violations);
    FlattenOutput {
        rows,
        records_in: records.len() as u64,
        rows_exploded,
        quality,
    }
}

fn resolve<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn explode(target: Option<&str>, row: &Row) -> Vec<Map<String, Value>> {
    let record: Map<String, Value> = row.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let Some(target) = target else {
        return vec![record];
    };
    let Some(Value::Array(elements)) = resolve(&record, target) else {
        return Vec::new();
    };

    let scalars: Map<String, Value> = record
        .iter()
        .filter(|(_, v)| !v.is_object() && !v.is_array())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    elements
        .iter()
        .map(|element| {
            let mut working = scalars.clone();
            match element {
                Value::Object(fields) => {
                    for (k, v) in fields {
                        working.insert(k.clone(), v.clone());
                    }
                }
                other => {
                    let name = target.rsplit('.').next().unwrap_or(target);
                    working.insert(name.to_string(), other.clone());
                }
            }
            working
        })
        .collect()
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Row) {
    match value {
        Value::Object(fields) if !fields.is_empty() => {
            for (k, v) in fields {
                let name = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}_{k}")
                };
                flatten_into(&name, v, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

fn shape(spec: &FlattenSpec, working: &Map<String, Value>) -> FlatRow {
    let mut out = Row::new();

    if spec.projections.is_empty() {
        for (k, v) in working {
            if k == columns::RESCUED_DATA || k == columns::CORRUPT_RECORD {
                continue;
            }
            flatten_into(k, v, &mut out);
        }
    } else {
        for projection in &spec.projections {
            let value = resolve(working, &projection.source)
                .cloned()
                .unwrap_or(Value::Null);
            out.insert(projection.output_name(), value);
        }
        for column in CARRIED_COLUMNS {
            if let Some(value) = working.get(column) {
                out.insert(column.to_string(), value.clone());
            }
        }
    }

    let mut row = FlatRow(out);
    for (column, default) in &spec.defaults {
        if row.get(column).is_null() {
            row.set(column.clone(), default.clone());
        }
    }
    for derived in &spec.derived {
        let value = derived.expr.evaluate(&row);
        row.set(derived.name.clone(), value);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{CompareOp, ViolationPolicy};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(value: Value) -> SourceRecord {
        let Value::Object(fields) = value else {
            panic!("test records must be objects");
        };
        SourceRecord::from_row(fields.into_iter().collect())
    }

    fn station_status(stations: Value) -> SourceRecord {
        record(json!({
            "_source_file": "station_status/0001.json",
            "last_updated": 1_700_000_000,
            "ttl": 60,
            "data": {"stations": stations}
        }))
    }

    fn station_spec() -> FlattenSpec {
        FlattenSpec {
            explode: Some("data.stations".into()),
            derived: vec![DerivedColumn::new(
                "age_seconds",
                DerivedExpr::Difference {
                    left: "last_updated".into(),
                    right: "last_reported".into(),
                },
            )],
            constraints: vec![
                QualityConstraint::not_null_drop("valid_station_id", "station_id"),
                QualityConstraint::compare(
                    "over_24hr_old_data",
                    "age_seconds",
                    CompareOp::Lt,
                    86_400.0,
                    ViolationPolicy::FlagOnly,
                ),
            ],
            ..FlattenSpec::default()
        }
    }

    #[test]
    fn test_explode_yields_one_row_per_element() {
        let rec = station_status(json!([
            {"station_id": "1", "num_bikes_available": 3, "last_reported": 1_699_999_990},
            {"station_id": "2", "num_bikes_available": 0, "last_reported": 1_699_999_000},
            {"station_id": "3", "num_bikes_available": 9, "last_reported": 1_699_999_999}
        ]));
        let out = flatten(&station_spec(), &[rec]);

        assert_eq!(out.records_in, 1);
        assert_eq!(out.rows.len(), 3);
        for row in &out.rows {
            assert_eq!(row.get("last_updated"), &json!(1_700_000_000));
            assert_eq!(row.get("ttl"), &json!(60));
            assert_eq!(row.get("_source_file"), &json!("station_status/0001.json"));
        }
        assert_eq!(out.rows[0].get("age_seconds"), &json!(10));
        assert_eq!(out.rows[1].get("station_id"), &json!("2"));
    }

    #[test]
    fn test_element_fields_override_record_scalars() {
        let rec = station_status(json!([{"station_id": "1", "ttl": 5}]));
        let out = flatten(&FlattenSpec {
            explode: Some("data.stations".into()),
            ..FlattenSpec::default()
        }, &[rec]);
        assert_eq!(out.rows[0].get("ttl"), &json!(5));
    }

    #[test]
    fn test_missing_or_empty_explode_target_yields_nothing() {
        let empty = station_status(json!([]));
        let missing = record(json!({"last_updated": 1}));
        let out = flatten(&station_spec(), &[empty, missing]);

        assert_eq!(out.records_in, 2);
        assert!(out.rows.is_empty());
    }

    #[test]
    fn test_drop_constraint_removes_violators() {
        let rec = station_status(json!([
            {"station_id": "1", "last_reported": 1_699_999_990},
            {"station_id": null, "last_reported": 1_699_999_990},
            {"last_reported": 1_699_999_990},
            {"station_id": "4", "last_reported": 1_699_999_990}
        ]));
        let out = flatten(&station_spec(), &[rec]);

        assert_eq!(out.rows_exploded, 4);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.quality.dropped, 2);
    }

    #[test]
    fn test_flag_only_constraint_keeps_all_rows() {
        let rec = station_status(json!([
            {"station_id": "1", "last_reported": 1_600_000_000},
            {"station_id": "2", "last_reported": 1_699_999_990}
        ]));
        let out = flatten(&station_spec(), &[rec]);

        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.quality.flagged, 1);
        assert_eq!(out.quality.violations["over_24hr_old_data"], 1);
        assert!(out.rows[0].get(columns::VIOLATIONS).is_null());
    }

    #[test]
    fn test_pass_through_projection_with_defaults() {
        let rec = record(json!({
            "_source_file": "weather_S1.json",
            "station_id": "S1",
            "dt": 1_700_000_000,
            "main": {"temp": 5.2},
            "rain": {"1h": 0.3},
            "snow": null,
            "sys": {"country": "US"}
        }));
        let spec = FlattenSpec {
            projections: vec![
                Projection::path("station_id"),
                Projection::path("dt"),
                Projection::path("main.temp"),
                Projection::path("rain.1h"),
                Projection::path("snow.1h"),
                Projection::renamed("sys.country", "country"),
            ],
            defaults: BTreeMap::from([
                ("rain_1h".to_string(), json!(0)),
                ("snow_1h".to_string(), json!(0)),
            ]),
            derived: vec![
                DerivedColumn::new("dt_ts", DerivedExpr::Timestamp { column: "dt".into() }),
                DerivedColumn::new("dt_date", DerivedExpr::Date { column: "dt".into() }),
            ],
            constraints: vec![QualityConstraint::not_null_drop("valid_station_id", "station_id")],
            ..FlattenSpec::default()
        };

        let out = flatten(&spec, &[rec]);
        assert_eq!(out.rows.len(), 1);

        let expected: Row = [
            ("_source_file", json!("weather_S1.json")),
            ("country", json!("US")),
            ("dt", json!(1_700_000_000)),
            ("dt_date", json!("2023-11-14")),
            ("dt_ts", json!("2023-11-14T22:13:20Z")),
            ("main_temp", json!(5.2)),
            ("rain_1h", json!(0.3)),
            ("snow_1h", json!(0)),
            ("station_id", json!("S1")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        assert_eq!(out.rows[0].0, expected);
    }

    #[test]
    fn test_auto_flatten_joins_nested_names() {
        let rec = record(json!({
            "main": {"temp": 5.2, "pressure": 1012},
            "wind": {"speed": 3.1},
            "_rescued_data": {"extra": 1}
        }));
        let out = flatten(&FlattenSpec::default(), &[rec]);
        let row = &out.rows[0];

        assert_eq!(row.get("main_temp"), &json!(5.2));
        assert_eq!(row.get("main_pressure"), &json!(1012));
        assert_eq!(row.get("wind_speed"), &json!(3.1));
        assert!(row.0.get(columns::RESCUED_DATA).is_none());
    }

    #[test]
    fn test_output_columns_known_with_projections() {
        let spec = FlattenSpec {
            projections: vec![Projection::path("station_id")],
            derived: vec![DerivedColumn::new("dt_date", DerivedExpr::Date { column: "dt".into() })],
            ..FlattenSpec::default()
        };
        let columns = spec.output_columns().unwrap();
        assert!(columns.contains(&"station_id".to_string()));
        assert!(columns.contains(&"dt_date".to_string()));
        assert!(FlattenSpec::default().output_columns().is_none());
    }
}
