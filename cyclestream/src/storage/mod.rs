//! Table storage, watermarks, and atomic commits.
//!
//! A [`TableStore`] holds three kinds of state: append-only row logs,
//! current-state tables (one row per key), and per-stage watermarks. The
//! only write path is [`TableStore::commit`], which writes a stage's output
//! and advances its watermark as one unit. Both the watermark and every
//! replaced current-state row are guarded by optimistic versions; a stale
//! version fails the commit with [`CyclestreamError::CommitConflict`] and
//! leaves the store untouched.
//!
//! [`CyclestreamError::CommitConflict`]: crate::errors::CyclestreamError::CommitConflict

mod file;
mod memory;
mod state;

pub use file::FileTableStore;
pub use memory::InMemoryTableStore;

use crate::core::{CurrentStateRow, QualityTier, Row, TableKind};
use crate::errors::Result;
use crate::schema::Schema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A stage's input cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Position {
    /// Nothing consumed yet.
    #[default]
    Start,
    /// Last source unit consumed, by order key.
    Unit(String),
    /// Number of upstream log rows consumed.
    Offset(u64),
}

impl Position {
    /// Returns true if moving from `previous` to `self` does not go backwards.
    #[must_use]
    pub fn advances_from(&self, previous: &Self) -> bool {
        match (previous, self) {
            (Self::Start, _) => true,
            (Self::Unit(prev), Self::Unit(next)) => next >= prev,
            (Self::Offset(prev), Self::Offset(next)) => next >= prev,
            _ => false,
        }
    }

    /// Returns the log offset, treating `Start` as zero.
    #[must_use]
    pub fn offset(&self) -> u64 {
        match self {
            Self::Offset(n) => *n,
            _ => 0,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Unit(key) => write!(f, "{key}"),
            Self::Offset(n) => write!(f, "offset:{n}"),
        }
    }
}

/// A committed cursor and its optimistic version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Last consumed input position.
    pub position: Position,
    /// Bumped on every commit; zero means never committed.
    pub version: u64,
}

/// Descriptive metadata of an output table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Table name.
    pub name: String,
    /// Quality tier.
    pub tier: QualityTier,
    /// Storage kind.
    pub kind: TableKind,
    /// Declared partition columns.
    #[serde(default)]
    pub partition_keys: Vec<String>,
    /// Names of declared quality constraints.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Merge key column, for current-state tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_key: Option<String>,
    /// Merge sequence column, for current-state tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
}

impl TableMetadata {
    /// Metadata for an append-only table.
    #[must_use]
    pub fn append_only(name: impl Into<String>, tier: QualityTier) -> Self {
        Self {
            name: name.into(),
            tier,
            kind: TableKind::AppendOnly,
            partition_keys: Vec::new(),
            constraints: Vec::new(),
            merge_key: None,
            sequence: None,
        }
    }

    /// Metadata for a silver current-state table.
    #[must_use]
    pub fn current_state(
        name: impl Into<String>,
        merge_key: impl Into<String>,
        sequence: impl Into<String>,
    ) -> Self {
        Self {
            kind: TableKind::CurrentState,
            merge_key: Some(merge_key.into()),
            sequence: Some(sequence.into()),
            ..Self::append_only(name, QualityTier::Silver)
        }
    }

    /// Sets the partition keys.
    #[must_use]
    pub fn with_partition_keys(mut self, keys: Vec<String>) -> Self {
        self.partition_keys = keys;
        self
    }

    /// Sets the declared constraint names.
    #[must_use]
    pub fn with_constraints(mut self, names: Vec<String>) -> Self {
        self.constraints = names;
        self
    }
}

/// One guarded current-state write.
#[derive(Debug, Clone, PartialEq)]
pub struct Upsert {
    /// Version read before the change; `None` when the key was absent.
    pub expected_version: Option<u64>,
    /// The row to store.
    pub row: CurrentStateRow,
}

/// Rows written by one commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutput {
    /// Rows appended to an append-only table.
    Append(Vec<Row>),
    /// Rows inserted or replaced in a current-state table.
    Upsert(Vec<Upsert>),
}

impl CommitOutput {
    /// Returns the number of rows written.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Append(rows) => rows.len(),
            Self::Upsert(rows) => rows.len(),
        }
    }

    /// Returns true if nothing is written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A stage's output and watermark advance, applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    /// Stage whose watermark advances.
    pub stage: String,
    /// Watermark version the stage read.
    pub expected_version: u64,
    /// New watermark position.
    pub position: Position,
    /// Output table.
    pub table: String,
    /// Rows to write.
    pub output: CommitOutput,
}

/// Storage for tables, watermarks, and cached schemas.
///
/// A commit must be atomic per stage and per output table only. Commits of
/// unrelated stages may run in parallel: [`InMemoryTableStore`] locks one
/// table and one watermark at a time, while [`FileTableStore`] serialises on
/// its single snapshot file.
#[async_trait]
pub trait TableStore: Send + Sync + fmt::Debug {
    /// Registers a table, or refreshes its metadata if it already exists.
    async fn ensure_table(&self, metadata: TableMetadata) -> Result<()>;

    /// Returns a table's metadata.
    async fn table_metadata(&self, table: &str) -> Result<Option<TableMetadata>>;

    /// Reads up to `limit` rows of an append-only table starting at `offset`.
    async fn read_since(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<Row>>;

    /// Returns the length of an append-only table.
    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Returns the current-state rows for the given keys, where present.
    async fn current_rows(
        &self,
        table: &str,
        keys: &[String],
    ) -> Result<HashMap<String, CurrentStateRow>>;

    /// Returns a full current-state table, ordered by key.
    async fn current_state(&self, table: &str) -> Result<Vec<CurrentStateRow>>;

    /// Returns a stage's watermark; the default when never committed.
    async fn watermark(&self, stage: &str) -> Result<Watermark>;

    /// Returns the cached schema of a source location.
    async fn schema(&self, location: &str) -> Result<Option<Schema>>;

    /// Stores a schema unless one exists; returns the stored schema.
    async fn save_schema_if_absent(&self, location: &str, schema: Schema) -> Result<Schema>;

    /// Writes output and advances the watermark as one unit.
    async fn commit(&self, commit: Commit) -> Result<Watermark>;
}
