//! In-memory table store.
//!
//! State is sharded: each table and each stage watermark has its own lock,
//! found through a `DashMap`, so commits to unrelated tables do not contend.
//! A commit locks its stage watermark, then its output table, always in that
//! order.

use super::state::{next_watermark, unknown_table, TableData};
use super::{Commit, TableMetadata, TableStore, Watermark};
use crate::core::{CurrentStateRow, Row};
use crate::errors::Result;
use crate::schema::Schema;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

type TableCell = Arc<RwLock<TableData>>;

#[derive(Debug, Default)]
struct Shards {
    tables: DashMap<String, TableCell>,
    watermarks: DashMap<String, Arc<Mutex<Watermark>>>,
    schemas: DashMap<String, Schema>,
}

impl Shards {
    fn table(&self, table: &str) -> Result<TableCell> {
        self.tables
            .get(table)
            .map(|cell| Arc::clone(cell.value()))
            .ok_or_else(|| unknown_table(table))
    }

    fn watermark_cell(&self, stage: &str) -> Arc<Mutex<Watermark>> {
        Arc::clone(self.watermarks.entry(stage.to_string()).or_default().value())
    }
}

/// A table store held entirely in memory. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTableStore {
    shards: Arc<Shards>,
}

impl InMemoryTableStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the names of all registered tables, sorted.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shards
            .tables
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn ensure_table(&self, metadata: TableMetadata) -> Result<()> {
        let cell = match self.shards.tables.entry(metadata.name.clone()) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(TableData::new(metadata))));
                return Ok(());
            }
        };
        let mut data = cell.write();
        data.reopen(metadata)
    }

    async fn table_metadata(&self, table: &str) -> Result<Option<TableMetadata>> {
        Ok(self
            .shards
            .table(table)
            .ok()
            .map(|cell| cell.read().metadata.clone()))
    }

    async fn read_since(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<Row>> {
        let cell = self.shards.table(table)?;
        let data = cell.read();
        data.read_since(offset, limit)
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let cell = self.shards.table(table)?;
        let data = cell.read();
        data.row_count()
    }

    async fn current_rows(
        &self,
        table: &str,
        keys: &[String],
    ) -> Result<HashMap<String, CurrentStateRow>> {
        let cell = self.shards.table(table)?;
        let data = cell.read();
        data.current_rows(keys)
    }

    async fn current_state(&self, table: &str) -> Result<Vec<CurrentStateRow>> {
        let cell = self.shards.table(table)?;
        let data = cell.read();
        data.current_state()
    }

    async fn watermark(&self, stage: &str) -> Result<Watermark> {
        let cell = self
            .shards
            .watermarks
            .get(stage)
            .map(|cell| Arc::clone(cell.value()));
        Ok(cell.map(|cell| cell.lock().clone()).unwrap_or_default())
    }

    async fn schema(&self, location: &str) -> Result<Option<Schema>> {
        Ok(self.shards.schemas.get(location).map(|schema| schema.value().clone()))
    }

    async fn save_schema_if_absent(&self, location: &str, schema: Schema) -> Result<Schema> {
        Ok(self
            .shards
            .schemas
            .entry(location.to_string())
            .or_insert(schema)
            .value()
            .clone())
    }

    async fn commit(&self, commit: Commit) -> Result<Watermark> {
        let watermark_cell = self.shards.watermark_cell(&commit.stage);
        let mut watermark = watermark_cell.lock();
        let next = next_watermark(&watermark, &commit)?;

        let table_cell = self.shards.table(&commit.table)?;
        let mut data = table_cell.write();
        data.write(commit.output)?;
        *watermark = next.clone();
        Ok(next)
    }
}
