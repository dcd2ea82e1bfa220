//! Row-level data-quality constraints.
//!
//! Constraints are plain data: a name, a predicate, and a policy. Violations
//! are never errors. A `drop_row` violation removes the row from the output;
//! a `flag_only` violation keeps it and is counted.

use crate::core::{columns, FlatRow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// What happens to a row that violates a constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationPolicy {
    /// Exclude the row from the output.
    DropRow,
    /// Keep the row and count the violation.
    #[default]
    FlagOnly,
}

impl fmt::Display for ViolationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DropRow => write!(f, "drop_row"),
            Self::FlagOnly => write!(f, "flag_only"),
        }
    }
}

/// Comparison operator against a numeric literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// `<`
    #[serde(rename = "<")]
    Lt,
    /// `<=`
    #[serde(rename = "<=")]
    Le,
    /// `>`
    #[serde(rename = ">")]
    Gt,
    /// `>=`
    #[serde(rename = ">=")]
    Ge,
    /// `==`
    #[serde(rename = "==")]
    Eq,
    /// `!=`
    #[serde(rename = "!=")]
    Ne,
}

impl CompareOp {
    fn holds(self, left: f64, right: f64) -> bool {
        match self {
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
            Self::Eq => (left - right).abs() < f64::EPSILON,
            Self::Ne => (left - right).abs() >= f64::EPSILON,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// A boolean test over one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// The column is present and not null.
    NotNull {
        /// Column tested.
        column: String,
    },
    /// The column compared with a literal. Nulls and non-numbers pass.
    Compare {
        /// Column tested.
        column: String,
        /// Operator.
        op: CompareOp,
        /// Right-hand literal.
        value: f64,
    },
}

impl Predicate {
    /// Evaluates the predicate against a row.
    #[must_use]
    pub fn evaluate(&self, row: &FlatRow) -> bool {
        match self {
            Self::NotNull { column } => !row.get(column).is_null(),
            Self::Compare { column, op, value } => match row.get(column) {
                Value::Number(n) => n.as_f64().map_or(true, |left| op.holds(left, *value)),
                _ => true,
            },
        }
    }

    /// Returns the column the predicate reads.
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::NotNull { column } | Self::Compare { column, .. } => column,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotNull { column } => write!(f, "{column} IS NOT NULL"),
            Self::Compare { column, op, value } => write!(f, "{column} {} {value}", op.symbol()),
        }
    }
}

/// A named predicate with a violation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityConstraint {
    /// Name used in metrics and the `_violations` column.
    pub name: String,
    /// The test each row must pass.
    pub predicate: Predicate,
    /// Handling of failing rows.
    #[serde(default)]
    pub policy: ViolationPolicy,
}

impl QualityConstraint {
    /// Creates a constraint.
    #[must_use]
    pub fn new(name: impl Into<String>, predicate: Predicate, policy: ViolationPolicy) -> Self {
        Self {
            name: name.into(),
            predicate,
            policy,
        }
    }

    /// `column IS NOT NULL`, dropping violators.
    #[must_use]
    pub fn not_null_drop(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(
            name,
            Predicate::NotNull {
                column: column.into(),
            },
            ViolationPolicy::DropRow,
        )
    }

    /// `column op value` with the given policy.
    #[must_use]
    pub fn compare(
        name: impl Into<String>,
        column: impl Into<String>,
        op: CompareOp,
        value: f64,
        policy: ViolationPolicy,
    ) -> Self {
        Self::new(
            name,
            Predicate::Compare {
                column: column.into(),
                op,
                value,
            },
            policy,
        )
    }
}

/// Counters from applying constraints to one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Rows evaluated.
    pub rows_in: u64,
    /// Rows forwarded.
    pub rows_out: u64,
    /// Rows removed by `drop_row` constraints.
    pub dropped: u64,
    /// Forwarded rows with at least one `flag_only` violation.
    pub flagged: u64,
    /// Violations per constraint name.
    pub violations: BTreeMap<String, u64>,
}

impl QualityReport {
    /// Returns the total violation count.
    #[must_use]
    pub fn total_violations(&self) -> u64 {
        self.violations.values().sum()
    }
}

/// Applies constraints in declaration order.
///
/// A row is dropped at its first `drop_row` violation; later constraints are
/// not evaluated for it. With `annotate`, forwarded rows carrying flag-only
/// violations get a `_violations` column listing the constraint names.
#[must_use]
pub fn apply_constraints(
    constraints: &[QualityConstraint],
    rows: Vec<FlatRow>,
    annotate: bool,
) -> (Vec<FlatRow>, QualityReport) {
    let mut report = QualityReport {
        rows_in: rows.len() as u64,
        ..QualityReport::default()
    };
    let mut kept = Vec::with_capacity(rows.len());

    'rows: for mut row in rows {
        let mut flagged: Vec<&str> = Vec::new();
        for constraint in constraints {
            if constraint.predicate.evaluate(&row) {
                continue;
            }
            *report.violations.entry(constraint.name.clone()).or_insert(0) += 1;
            match constraint.policy {
                ViolationPolicy::DropRow => {
                    report.dropped += 1;
                    continue 'rows;
                }
                ViolationPolicy::FlagOnly => flagged.push(&constraint.name),
            }
        }
        if !flagged.is_empty() {
            report.flagged += 1;
            if annotate {
                row.set(
                    columns::VIOLATIONS,
                    Value::Array(flagged.iter().map(|n| Value::String((*n).to_string())).collect()),
                );
            }
        }
        kept.push(row);
    }

    report.rows_out = kept.len() as u64;
    (kept, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Row;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn flat(pairs: &[(&str, Value)]) -> FlatRow {
        FlatRow(pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect::<Row>())
    }

    fn station_constraints() -> Vec<QualityConstraint> {
        vec![
            QualityConstraint::not_null_drop("valid_station_id", "station_id"),
            QualityConstraint::compare(
                "over_24hr_old_data",
                "age_seconds",
                CompareOp::Lt,
                86_400.0,
                ViolationPolicy::FlagOnly,
            ),
        ]
    }

    #[test]
    fn test_drop_removes_exactly_violators() {
        let rows = vec![
            flat(&[("station_id", json!("1"))]),
            flat(&[("station_id", Value::Null)]),
            flat(&[("station_id", json!("3"))]),
            flat(&[]),
        ];
        let (kept, report) = apply_constraints(&station_constraints(), rows, false);

        assert_eq!(kept.len(), 2);
        assert_eq!(report.rows_in, 4);
        assert_eq!(report.rows_out, 2);
        assert_eq!(report.dropped, 2);
        assert_eq!(report.violations["valid_station_id"], 2);
    }

    #[test]
    fn test_flag_only_keeps_rows_unchanged() {
        let rows = vec![
            flat(&[("station_id", json!("1")), ("age_seconds", json!(90_000))]),
            flat(&[("station_id", json!("2")), ("age_seconds", json!(10))]),
        ];
        let (kept, report) = apply_constraints(&station_constraints(), rows.clone(), false);

        assert_eq!(kept, rows);
        assert_eq!(report.flagged, 1);
        assert_eq!(report.dropped, 0);
        assert_eq!(report.violations["over_24hr_old_data"], 1);
    }

    #[test]
    fn test_annotation_lists_flagged_constraints() {
        let rows = vec![flat(&[("station_id", json!("1")), ("age_seconds", json!(90_000))])];
        let (kept, _) = apply_constraints(&station_constraints(), rows, true);
        assert_eq!(kept[0].get(columns::VIOLATIONS), &json!(["over_24hr_old_data"]));
    }

    #[test]
    fn test_dropped_row_skips_later_constraints() {
        let rows = vec![flat(&[("age_seconds", json!(90_000))])];
        let (kept, report) = apply_constraints(&station_constraints(), rows, false);

        assert!(kept.is_empty());
        assert!(!report.violations.contains_key("over_24hr_old_data"));
    }

    #[test]
    fn test_comparison_over_null_passes() {
        let predicate = Predicate::Compare {
            column: "age_seconds".into(),
            op: CompareOp::Lt,
            value: 10.0,
        };
        assert!(predicate.evaluate(&flat(&[("age_seconds", Value::Null)])));
        assert!(predicate.evaluate(&flat(&[("age_seconds", json!("n/a"))])));
        assert!(!predicate.evaluate(&flat(&[("age_seconds", json!(11))])));
    }

    #[test]
    fn test_constraint_deserialization() {
        let constraint: QualityConstraint = serde_json::from_value(json!({
            "name": "fresh",
            "predicate": {"type": "compare", "column": "age_seconds", "op": "<", "value": 86400}
        }))
        .unwrap();

        assert_eq!(constraint.policy, ViolationPolicy::FlagOnly);
        assert_eq!(constraint.predicate.to_string(), "age_seconds < 86400");
    }
}
