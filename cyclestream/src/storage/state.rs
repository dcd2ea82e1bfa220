//! Store state shared by the in-memory and file-backed stores.
//!
//! Table level reads and writes live on [`TableData`], so a store can keep
//! one table per lock. [`StoreState`] is the whole store in one value, which
//! is what the file snapshot serialises.

use super::{Commit, CommitOutput, TableMetadata, Watermark};
use crate::core::{CurrentStateRow, Row, TableKind};
use crate::errors::{CyclestreamError, Result};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct TableData {
    pub metadata: TableMetadata,
    #[serde(default)]
    pub log: Vec<Row>,
    #[serde(default)]
    pub current: BTreeMap<String, CurrentStateRow>,
}

pub(super) fn unknown_table(table: &str) -> CyclestreamError {
    CyclestreamError::Configuration(format!("unknown table '{table}'"))
}

impl TableData {
    pub fn new(metadata: TableMetadata) -> Self {
        Self {
            metadata,
            log: Vec::new(),
            current: BTreeMap::new(),
        }
    }

    /// Refreshes metadata; the table kind is fixed once created.
    pub fn reopen(&mut self, metadata: TableMetadata) -> Result<()> {
        if self.metadata.kind != metadata.kind {
            return Err(CyclestreamError::Configuration(format!(
                "table '{}' already exists as {}, cannot reopen as {}",
                metadata.name, self.metadata.kind, metadata.kind
            )));
        }
        self.metadata = metadata;
        Ok(())
    }

    fn expect_kind(&self, kind: TableKind) -> Result<()> {
        if self.metadata.kind == kind {
            Ok(())
        } else {
            Err(CyclestreamError::Configuration(format!(
                "table '{}' is {}, not {kind}",
                self.metadata.name, self.metadata.kind
            )))
        }
    }

    pub fn read_since(&self, offset: u64, limit: usize) -> Result<Vec<Row>> {
        self.expect_kind(TableKind::AppendOnly)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.log.len());
        let end = start.saturating_add(limit).min(self.log.len());
        Ok(self.log[start..end].to_vec())
    }

    pub fn row_count(&self) -> Result<u64> {
        self.expect_kind(TableKind::AppendOnly)?;
        Ok(self.log.len() as u64)
    }

    pub fn current_rows(&self, keys: &[String]) -> Result<HashMap<String, CurrentStateRow>> {
        self.expect_kind(TableKind::CurrentState)?;
        Ok(keys
            .iter()
            .filter_map(|k| self.current.get(k).map(|row| (k.clone(), row.clone())))
            .collect())
    }

    pub fn current_state(&self) -> Result<Vec<CurrentStateRow>> {
        self.expect_kind(TableKind::CurrentState)?;
        Ok(self.current.values().cloned().collect())
    }

    /// Writes a commit's rows. Every row guard is checked before any row
    /// is written.
    pub fn write(&mut self, output: CommitOutput) -> Result<()> {
        let table = &self.metadata.name;
        match output {
            CommitOutput::Append(rows) => {
                if self.metadata.kind != TableKind::AppendOnly {
                    return Err(CyclestreamError::Configuration(format!(
                        "cannot append to current-state table '{table}'"
                    )));
                }
                self.log.extend(rows);
            }
            CommitOutput::Upsert(upserts) => {
                if self.metadata.kind != TableKind::CurrentState {
                    return Err(CyclestreamError::Configuration(format!(
                        "cannot upsert into append-only table '{table}'"
                    )));
                }
                for upsert in &upserts {
                    let stored = self.current.get(&upsert.row.key).map(|r| r.version);
                    if stored != upsert.expected_version {
                        return Err(CyclestreamError::conflict(
                            format!("{table}:{}", upsert.row.key),
                            upsert.expected_version.unwrap_or(0),
                            stored.unwrap_or(0),
                        ));
                    }
                }
                for upsert in upserts {
                    self.current.insert(upsert.row.key.clone(), upsert.row);
                }
            }
        }
        Ok(())
    }
}

/// Checks a commit against the stage's stored watermark and returns the
/// watermark to store once the output is written.
pub(super) fn next_watermark(current: &Watermark, commit: &Commit) -> Result<Watermark> {
    if current.version != commit.expected_version {
        return Err(CyclestreamError::conflict(
            format!("watermark:{}", commit.stage),
            commit.expected_version,
            current.version,
        ));
    }
    if !commit.position.advances_from(&current.position) {
        return Err(CyclestreamError::Internal(format!(
            "watermark for '{}' would move from {} to {}",
            commit.stage, current.position, commit.position
        )));
    }
    Ok(Watermark {
        position: commit.position.clone(),
        version: current.version + 1,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct StoreState {
    #[serde(default)]
    pub tables: BTreeMap<String, TableData>,
    #[serde(default)]
    pub watermarks: BTreeMap<String, Watermark>,
    #[serde(default)]
    pub schemas: BTreeMap<String, Schema>,
}

impl StoreState {
    pub fn ensure_table(&mut self, metadata: TableMetadata) -> Result<()> {
        match self.tables.get_mut(&metadata.name) {
            Some(existing) => existing.reopen(metadata),
            None => {
                self.tables
                    .insert(metadata.name.clone(), TableData::new(metadata));
                Ok(())
            }
        }
    }

    pub fn table(&self, table: &str) -> Result<&TableData> {
        self.tables.get(table).ok_or_else(|| unknown_table(table))
    }

    pub fn metadata(&self, table: &str) -> Option<TableMetadata> {
        self.tables.get(table).map(|t| t.metadata.clone())
    }

    pub fn watermark(&self, stage: &str) -> Watermark {
        self.watermarks.get(stage).cloned().unwrap_or_default()
    }

    pub fn save_schema_if_absent(&mut self, location: &str, schema: Schema) -> Schema {
        self.schemas
            .entry(location.to_string())
            .or_insert(schema)
            .clone()
    }

    /// Validates every guard before mutating anything.
    pub fn apply_commit(&mut self, commit: Commit) -> Result<Watermark> {
        let next = next_watermark(&self.watermark(&commit.stage), &commit)?;
        let data = self
            .tables
            .get_mut(&commit.table)
            .ok_or_else(|| unknown_table(&commit.table))?;
        data.write(commit.output)?;
        self.watermarks.insert(commit.stage, next.clone());
        Ok(next)
    }
}
