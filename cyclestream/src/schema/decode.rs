//! Schema-driven decoding with rescue of non-conforming data.

use super::{Column, ColumnType, RawDocument, Schema};
use crate::core::{columns, Row};
use serde_json::{Map, Number, Value};

/// The decoded columns of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    /// One entry per schema column plus `_rescued_data`, and
    /// `_corrupt_record` for unparseable input.
    pub fields: Row,
    /// True when any data was captured in `_rescued_data`.
    pub rescued: bool,
    /// True when the document failed to parse.
    pub corrupt: bool,
}

/// Decodes documents against a fixed schema.
#[derive(Debug, Clone)]
pub struct Decoder {
    schema: Schema,
}

impl Decoder {
    /// Creates a decoder for a schema.
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    /// Returns the schema used for decoding.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Decodes one raw document. Never fails.
    #[must_use]
    pub fn decode(&self, document: &RawDocument) -> DecodedRecord {
        match document {
            RawDocument::Parsed(Value::Object(obj)) => {
                let mut rescued = Map::new();
                let mut fields = decode_struct(&self.schema.columns, obj, "", &mut rescued);
                let has_rescued = !rescued.is_empty();
                fields.insert(
                    columns::RESCUED_DATA.to_string(),
                    if has_rescued {
                        Value::Object(rescued)
                    } else {
                        Value::Null
                    },
                );
                DecodedRecord {
                    fields: fields.into_iter().collect(),
                    rescued: has_rescued,
                    corrupt: false,
                }
            }
            RawDocument::Parsed(other) => self.corrupt(other.to_string()),
            RawDocument::Corrupt(raw) => self.corrupt(raw.clone()),
        }
    }

    fn corrupt(&self, raw: String) -> DecodedRecord {
        let mut fields: Row = self
            .schema
            .columns
            .iter()
            .map(|c| (c.name.clone(), Value::Null))
            .collect();
        fields.insert(columns::RESCUED_DATA.to_string(), Value::Null);
        fields.insert(columns::CORRUPT_RECORD.to_string(), Value::String(raw));
        DecodedRecord {
            fields,
            rescued: false,
            corrupt: true,
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn decode_struct(
    fields: &[Column],
    obj: &Map<String, Value>,
    prefix: &str,
    rescued: &mut Map<String, Value>,
) -> Map<String, Value> {
    let mut out = Map::new();
    for column in fields {
        let path = join_path(prefix, &column.name);
        let value = obj
            .get(&column.name)
            .map_or(Value::Null, |v| coerce(v, &column.data_type, &path, rescued));
        out.insert(column.name.clone(), value);
    }
    for (name, value) in obj {
        if !fields.iter().any(|c| &c.name == name) {
            rescued.insert(join_path(prefix, name), value.clone());
        }
    }
    out
}

fn coerce(value: &Value, ty: &ColumnType, path: &str, rescued: &mut Map<String, Value>) -> Value {
    let fits = match (ty, value) {
        (_, Value::Null) => return Value::Null,
        (ColumnType::String, Value::String(_)) => return value.clone(),
        // Catch-all column: keep the JSON text.
        (ColumnType::String, other) => return Value::String(other.to_string()),
        (ColumnType::Boolean, Value::Bool(_)) => true,
        (ColumnType::Long, Value::Number(n)) => n.is_i64() || n.is_u64(),
        (ColumnType::Double, Value::Number(n)) => {
            return n
                .as_f64()
                .and_then(Number::from_f64)
                .map_or(Value::Null, Value::Number)
        }
        (ColumnType::Array { element }, Value::Array(items)) => {
            return Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| coerce(item, element, &format!("{path}[{i}]"), rescued))
                    .collect(),
            )
        }
        (ColumnType::Struct { fields }, Value::Object(obj)) => {
            return Value::Object(decode_struct(fields, obj, path, rescued))
        }
        _ => false,
    };

    if fits {
        value.clone()
    } else {
        rescued.insert(path.to_string(), value.clone());
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::infer_schema;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn decoder_for(samples: &[Value]) -> Decoder {
        Decoder::new(infer_schema(samples))
    }

    #[test]
    fn test_conforming_document() {
        let decoder = decoder_for(&[json!({"dt": 1, "main": {"temp": 5.2}})]);
        let record = decoder.decode(&RawDocument::Parsed(json!({"dt": 2, "main": {"temp": 6.0}})));

        assert!(!record.rescued);
        assert_eq!(record.fields["dt"], json!(2));
        assert_eq!(record.fields["main"], json!({"temp": 6.0}));
        assert_eq!(record.fields[columns::RESCUED_DATA], Value::Null);
    }

    #[test]
    fn test_missing_field_decodes_null() {
        let decoder = decoder_for(&[json!({"dt": 1, "snow": {"1h": 0.1}})]);
        let record = decoder.decode(&RawDocument::Parsed(json!({"dt": 2})));
        assert_eq!(record.fields["snow"], Value::Null);
    }

    #[test]
    fn test_unexpected_field_rescued() {
        let decoder = decoder_for(&[json!({"dt": 1, "main": {"temp": 5.2}})]);
        let record = decoder.decode(&RawDocument::Parsed(
            json!({"dt": 2, "main": {"temp": 1.0, "feels_like": 0.5}, "visibility": 1000}),
        ));

        assert!(record.rescued);
        assert_eq!(
            record.fields[columns::RESCUED_DATA],
            json!({"main.feels_like": 0.5, "visibility": 1000})
        );
        assert_eq!(record.fields["main"], json!({"temp": 1.0}));
    }

    #[test]
    fn test_type_mismatch_rescued() {
        let decoder = decoder_for(&[json!({"dt": 1})]);
        let record = decoder.decode(&RawDocument::Parsed(json!({"dt": 1.5})));

        assert_eq!(record.fields["dt"], Value::Null);
        assert_eq!(record.fields[columns::RESCUED_DATA], json!({"dt": 1.5}));
    }

    #[test]
    fn test_long_widens_into_double_column() {
        let decoder = decoder_for(&[json!({"temp": 1.5})]);
        let record = decoder.decode(&RawDocument::Parsed(json!({"temp": 3})));
        assert_eq!(record.fields["temp"], json!(3.0));
    }

    #[test]
    fn test_string_column_keeps_json_text() {
        let decoder = decoder_for(&[json!({"code": 1}), json!({"code": "x"})]);
        let record = decoder.decode(&RawDocument::Parsed(json!({"code": 7})));
        assert_eq!(record.fields["code"], json!("7"));
    }

    #[test]
    fn test_corrupt_record_isolated() {
        let decoder = decoder_for(&[json!({"dt": 1})]);
        let record = decoder.decode(&RawDocument::Corrupt("{oops".into()));

        assert!(record.corrupt);
        assert_eq!(record.fields["dt"], Value::Null);
        assert_eq!(record.fields[columns::CORRUPT_RECORD], json!("{oops"));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let decoder = decoder_for(&[json!({"b": 1, "a": {"y": 2, "x": 3}})]);
        let doc = RawDocument::Parsed(json!({"a": {"x": 3, "y": 2}, "b": 1, "z": true}));
        let first = serde_json::to_vec(&decoder.decode(&doc).fields).unwrap();
        let second = serde_json::to_vec(&decoder.decode(&doc).fields).unwrap();
        assert_eq!(first, second);
    }
}
