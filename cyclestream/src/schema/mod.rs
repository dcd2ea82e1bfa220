//! Schema inference and schema-driven decoding.
//!
//! A schema is inferred once per source location from a sample of documents
//! and then reused for every decode, so all units of a location produce rows
//! with the same columns. Data that does not fit is rescued, never fatal.

mod decode;
mod documents;
mod infer;

pub use decode::{DecodedRecord, Decoder};
pub use documents::{split_documents, RawDocument, SourceFormat};
pub use infer::{infer_schema, widen, DEFAULT_SAMPLE_SIZE};

use serde::{Deserialize, Serialize};

/// The type of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    /// Only nulls observed so far; finalised to `String`.
    Null,
    /// `true`/`false`.
    Boolean,
    /// 64-bit integer.
    Long,
    /// 64-bit float.
    Double,
    /// Text; also the catch-all for conflicting observations.
    String,
    /// Homogeneous array.
    Array {
        /// Element type.
        element: Box<ColumnType>,
    },
    /// Nested object.
    Struct {
        /// Nested columns, sorted by name.
        fields: Vec<Column>,
    },
}

impl ColumnType {
    /// Replaces unresolved `Null` types with `String`, recursively.
    #[must_use]
    pub fn finalize(self) -> Self {
        match self {
            Self::Null => Self::String,
            Self::Array { element } => Self::Array {
                element: Box::new(element.finalize()),
            },
            Self::Struct { fields } => Self::Struct {
                fields: fields.into_iter().map(Column::finalize).collect(),
            },
            other => other,
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Long => "long",
            Self::Double => "double",
            Self::String => "string",
            Self::Array { .. } => "array",
            Self::Struct { .. } => "struct",
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column type.
    #[serde(flatten)]
    pub data_type: ColumnType,
    /// Whether any sampled document lacked the field or held null.
    pub nullable: bool,
}

impl Column {
    /// Creates a column.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    fn finalize(self) -> Self {
        Self {
            data_type: self.data_type.finalize(),
            ..self
        }
    }
}

/// Top-level columns of a source location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Columns sorted by name.
    pub columns: Vec<Column>,
}

impl Schema {
    /// Creates a schema, sorting columns by name.
    #[must_use]
    pub fn new(mut columns: Vec<Column>) -> Self {
        columns.sort_by(|a, b| a.name.cmp(&b.name));
        Self { columns }
    }

    /// Looks up a top-level column.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the top-level column names.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Returns the number of top-level columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if no columns were inferred.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
