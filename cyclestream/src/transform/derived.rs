//! Derived-column expressions.

use crate::core::FlatRow;
use crate::utils::{format_timestamp, timestamp_from_value, to_date_string, truncate_to_hour};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// A computed column appended to each flattened row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedColumn {
    /// Output column name.
    pub name: String,
    /// Expression producing the value.
    pub expr: DerivedExpr,
}

impl DerivedColumn {
    /// Creates a derived column.
    #[must_use]
    pub fn new(name: impl Into<String>, expr: DerivedExpr) -> Self {
        Self {
            name: name.into(),
            expr,
        }
    }
}

/// The fixed table of derived-column transforms.
///
/// Every expression evaluates to null when an input is missing or of the
/// wrong shape; none of them fail a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum DerivedExpr {
    /// Unix seconds or a timestamp string, as RFC3339 UTC.
    Timestamp {
        /// Input column.
        column: String,
    },
    /// Calendar date, `YYYY-MM-DD`.
    Date {
        /// Input column.
        column: String,
    },
    /// Timestamp truncated to the hour, as RFC3339 UTC.
    HourBucket {
        /// Input column.
        column: String,
    },
    /// `left - right`; timestamps subtract to seconds.
    Difference {
        /// Minuend column.
        left: String,
        /// Subtrahend column.
        right: String,
    },
    /// A constant.
    Literal {
        /// The constant value.
        value: Value,
    },
    /// The first non-null of the listed columns.
    Coalesce {
        /// Columns tried in order.
        columns: Vec<String>,
    },
}

impl DerivedExpr {
    /// Evaluates the expression against a row.
    #[must_use]
    pub fn evaluate(&self, row: &FlatRow) -> Value {
        match self {
            Self::Timestamp { column } => timestamp_from_value(row.get(column))
                .map_or(Value::Null, |ts| Value::String(format_timestamp(&ts))),
            Self::Date { column } => timestamp_from_value(row.get(column))
                .map_or(Value::Null, |ts| Value::String(to_date_string(&ts))),
            Self::HourBucket { column } => timestamp_from_value(row.get(column))
                .map_or(Value::Null, |ts| {
                    Value::String(format_timestamp(&truncate_to_hour(&ts)))
                }),
            Self::Difference { left, right } => difference(row.get(left), row.get(right)),
            Self::Literal { value } => value.clone(),
            Self::Coalesce { columns } => columns
                .iter()
                .map(|c| row.get(c))
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

fn difference(left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            if let (Some(l), Some(r)) = (l.as_i64(), r.as_i64()) {
                return l.checked_sub(r).map_or(Value::Null, Value::from);
            }
            match (l.as_f64(), r.as_f64()) {
                (Some(l), Some(r)) => Number::from_f64(l - r).map_or(Value::Null, Value::Number),
                _ => Value::Null,
            }
        }
        (Value::String(_), _) | (_, Value::String(_)) => {
            match (timestamp_from_value(left), timestamp_from_value(right)) {
                (Ok(l), Ok(r)) => Value::from((l - r).num_seconds()),
                _ => Value::Null,
            }
        }
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Row;
    use serde_json::json;

    fn flat(pairs: &[(&str, Value)]) -> FlatRow {
        FlatRow(pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect::<Row>())
    }

    #[test]
    fn test_timestamp_and_date() {
        let row = flat(&[("dt", json!(1_700_000_000))]);
        let ts = DerivedExpr::Timestamp { column: "dt".into() };
        let date = DerivedExpr::Date { column: "dt".into() };

        assert_eq!(ts.evaluate(&row), json!("2023-11-14T22:13:20Z"));
        assert_eq!(date.evaluate(&row), json!("2023-11-14"));
    }

    #[test]
    fn test_hour_bucket() {
        let row = flat(&[("dt", json!(1_700_000_000))]);
        let expr = DerivedExpr::HourBucket { column: "dt".into() };
        assert_eq!(expr.evaluate(&row), json!("2023-11-14T22:00:00Z"));
    }

    #[test]
    fn test_difference_of_unix_seconds() {
        let row = flat(&[("last_updated", json!(1000)), ("last_reported", json!(400))]);
        let expr = DerivedExpr::Difference {
            left: "last_updated".into(),
            right: "last_reported".into(),
        };
        assert_eq!(expr.evaluate(&row), json!(600));
    }

    #[test]
    fn test_difference_of_timestamp_strings() {
        let row = flat(&[
            ("a", json!("2024-01-01T01:00:00Z")),
            ("b", json!("2024-01-01T00:00:00Z")),
        ]);
        let expr = DerivedExpr::Difference {
            left: "a".into(),
            right: "b".into(),
        };
        assert_eq!(expr.evaluate(&row), json!(3600));
    }

    #[test]
    fn test_missing_inputs_yield_null() {
        let row = flat(&[("dt", Value::Null)]);
        assert_eq!(DerivedExpr::Date { column: "dt".into() }.evaluate(&row), Value::Null);
        assert_eq!(
            DerivedExpr::Difference {
                left: "dt".into(),
                right: "missing".into()
            }
            .evaluate(&row),
            Value::Null
        );
    }

    #[test]
    fn test_coalesce_and_literal() {
        let row = flat(&[("a", Value::Null), ("b", json!(2))]);
        let expr = DerivedExpr::Coalesce {
            columns: vec!["a".into(), "b".into()],
        };
        assert_eq!(expr.evaluate(&row), json!(2));
        assert_eq!(DerivedExpr::Literal { value: json!("x") }.evaluate(&row), json!("x"));
    }

    #[test]
    fn test_expression_deserialization() {
        let expr: DerivedExpr =
            serde_json::from_value(json!({"fn": "hour_bucket", "column": "dt"})).unwrap();
        assert_eq!(expr, DerivedExpr::HourBucket { column: "dt".into() });
    }
}
