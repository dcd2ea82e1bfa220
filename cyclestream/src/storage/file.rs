//! Durable table store backed by a single JSON snapshot file.
//!
//! Every mutation is applied to a copy of the state, written to a sibling
//! temporary file, and renamed over the snapshot. A crash leaves either the
//! old or the new snapshot, never a partial one.
//!
//! Because every write rewrites the one snapshot, the store keeps a single
//! lock. Writes for different tables would serialise on the file anyway.

use super::state::StoreState;
use super::{Commit, TableMetadata, TableStore, Watermark};
use crate::core::{CurrentStateRow, Row};
use crate::errors::Result;
use crate::schema::Schema;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// A table store persisted to a JSON file.
#[derive(Debug)]
pub struct FileTableStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileTableStore {
    /// Opens a store, loading the snapshot if it exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(err) => return Err(err.into()),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(path = %path.display(), "Opened file table store");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Returns the snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TableStore for FileTableStore {
    async fn ensure_table(&self, metadata: TableMetadata) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.ensure_table(metadata)?;
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn table_metadata(&self, table: &str) -> Result<Option<TableMetadata>> {
        Ok(self.state.lock().await.metadata(table))
    }

    async fn read_since(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<Row>> {
        self.state.lock().await.table(table)?.read_since(offset, limit)
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        self.state.lock().await.table(table)?.row_count()
    }

    async fn current_rows(
        &self,
        table: &str,
        keys: &[String],
    ) -> Result<HashMap<String, CurrentStateRow>> {
        self.state.lock().await.table(table)?.current_rows(keys)
    }

    async fn current_state(&self, table: &str) -> Result<Vec<CurrentStateRow>> {
        self.state.lock().await.table(table)?.current_state()
    }

    async fn watermark(&self, stage: &str) -> Result<Watermark> {
        Ok(self.state.lock().await.watermark(stage))
    }

    async fn schema(&self, location: &str) -> Result<Option<Schema>> {
        Ok(self.state.lock().await.schemas.get(location).cloned())
    }

    async fn save_schema_if_absent(&self, location: &str, schema: Schema) -> Result<Schema> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.schemas.get(location) {
            return Ok(existing.clone());
        }
        let mut next = state.clone();
        let saved = next.save_schema_if_absent(location, schema);
        self.persist(&next).await?;
        *state = next;
        Ok(saved)
    }

    async fn commit(&self, commit: Commit) -> Result<Watermark> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let watermark = next.apply_commit(commit)?;
        self.persist(&next).await?;
        *state = next;
        Ok(watermark)
    }
}
