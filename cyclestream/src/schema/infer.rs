//! Structural-union schema inference.

use super::{Column, ColumnType, Schema};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Default number of documents sampled per location.
pub const DEFAULT_SAMPLE_SIZE: usize = 100_000;

/// Infers a schema from sample documents.
///
/// Fields missing from any document, or null in any, become nullable.
/// Conflicting types are widened; non-object documents are ignored.
#[must_use]
pub fn infer_schema<'a>(documents: impl IntoIterator<Item = &'a Value>) -> Schema {
    let mut merged: Option<Vec<Column>> = None;

    for doc in documents {
        let Value::Object(obj) = doc else { continue };
        let fields = infer_fields(obj);
        merged = Some(match merged {
            None => fields,
            Some(existing) => union_fields(existing, fields),
        });
    }

    let columns = merged
        .unwrap_or_default()
        .into_iter()
        .map(|c| Column::new(c.name, c.data_type.finalize(), c.nullable))
        .collect();
    Schema::new(columns)
}

fn infer_fields(obj: &Map<String, Value>) -> Vec<Column> {
    let mut fields: Vec<Column> = obj
        .iter()
        .map(|(name, value)| Column::new(name.clone(), infer_type(value), value.is_null()))
        .collect();
    fields.sort_by(|a, b| a.name.cmp(&b.name));
    fields
}

fn infer_type(value: &Value) -> ColumnType {
    match value {
        Value::Null => ColumnType::Null,
        Value::Bool(_) => ColumnType::Boolean,
        Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Long,
        Value::Number(_) => ColumnType::Double,
        Value::String(_) => ColumnType::String,
        Value::Array(items) => ColumnType::Array {
            element: Box::new(
                items
                    .iter()
                    .map(infer_type)
                    .reduce(widen)
                    .unwrap_or(ColumnType::Null),
            ),
        },
        Value::Object(obj) => ColumnType::Struct {
            fields: infer_fields(obj),
        },
    }
}

fn union_fields(left: Vec<Column>, right: Vec<Column>) -> Vec<Column> {
    let mut by_name: BTreeMap<String, (Option<Column>, Option<Column>)> = BTreeMap::new();
    for col in left {
        let name = col.name.clone();
        by_name.entry(name).or_default().0 = Some(col);
    }
    for col in right {
        let name = col.name.clone();
        by_name.entry(name).or_default().1 = Some(col);
    }

    by_name
        .into_iter()
        .filter_map(|(name, pair)| match pair {
            (Some(a), Some(b)) => Some(Column::new(
                name,
                widen(a.data_type, b.data_type),
                a.nullable || b.nullable,
            )),
            (Some(only), None) | (None, Some(only)) => {
                Some(Column::new(name, only.data_type, true))
            }
            (None, None) => None,
        })
        .collect()
}

/// Widens two observed types to a common representable type.
#[must_use]
pub fn widen(a: ColumnType, b: ColumnType) -> ColumnType {
    match (a, b) {
        (a, b) if a == b => a,
        (ColumnType::Null, other) | (other, ColumnType::Null) => other,
        (ColumnType::Long, ColumnType::Double) | (ColumnType::Double, ColumnType::Long) => {
            ColumnType::Double
        }
        (ColumnType::Array { element: a }, ColumnType::Array { element: b }) => ColumnType::Array {
            element: Box::new(widen(*a, *b)),
        },
        (ColumnType::Struct { fields: a }, ColumnType::Struct { fields: b }) => {
            ColumnType::Struct {
                fields: union_fields(a, b),
            }
        }
        _ => ColumnType::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_missing_fields_become_nullable() {
        let docs = [
            json!({"dt": 1, "rain": {"1h": 0.3}}),
            json!({"dt": 2}),
        ];
        let schema = infer_schema(&docs);

        let dt = schema.column("dt").unwrap();
        assert_eq!(dt.data_type, ColumnType::Long);
        assert!(!dt.nullable);

        let rain = schema.column("rain").unwrap();
        assert!(rain.nullable);
        assert_eq!(
            rain.data_type,
            ColumnType::Struct {
                fields: vec![Column::new("1h", ColumnType::Double, false)]
            }
        );
    }

    #[test]
    fn test_numeric_widening() {
        let docs = [json!({"temp": 5}), json!({"temp": 5.5})];
        let schema = infer_schema(&docs);
        assert_eq!(schema.column("temp").unwrap().data_type, ColumnType::Double);
    }

    #[test]
    fn test_conflict_routes_to_string() {
        let docs = [json!({"code": 1}), json!({"code": "A1"})];
        let schema = infer_schema(&docs);
        assert_eq!(schema.column("code").unwrap().data_type, ColumnType::String);
    }

    #[test]
    fn test_only_nulls_finalize_to_string() {
        let docs = [json!({"snow": null})];
        let schema = infer_schema(&docs);
        let snow = schema.column("snow").unwrap();
        assert_eq!(snow.data_type, ColumnType::String);
        assert!(snow.nullable);
    }

    #[test]
    fn test_array_of_structs_unions_elements() {
        let docs = [json!({"data": {"stations": [
            {"station_id": "1", "num_bikes_available": 3},
            {"station_id": "2", "num_docks_available": 7}
        ]}})];
        let schema = infer_schema(&docs);

        let ColumnType::Struct { fields } = &schema.column("data").unwrap().data_type else {
            panic!("data should be a struct");
        };
        let ColumnType::Array { element } = &fields[0].data_type else {
            panic!("stations should be an array");
        };
        let ColumnType::Struct { fields: station } = element.as_ref() else {
            panic!("station should be a struct");
        };
        let names: Vec<_> = station.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["num_bikes_available", "num_docks_available", "station_id"]);
        assert!(station[0].nullable);
        assert!(!station[2].nullable);
    }

    #[test]
    fn test_non_object_documents_ignored() {
        let docs = [json!(42), json!({"a": true})];
        let schema = infer_schema(&docs);
        assert_eq!(schema.column_names(), vec!["a"]);
    }

    #[test]
    fn test_columns_sorted() {
        let docs = [json!({"b": 1, "a": 2, "c": 3})];
        assert_eq!(infer_schema(&docs).column_names(), vec!["a", "b", "c"]);
    }
}
