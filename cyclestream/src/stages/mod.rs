//! Stage trait and the three stage kinds.
//!
//! A stage turns "new input since its watermark" into a [`PreparedBatch`]:
//! the rows to write and the position to advance to. Stages never write.
//! The runner commits the batch, so output and watermark always move
//! together and a cancelled or failed stage leaves no trace.

mod flatten;
mod ingest;
mod merge;

pub use flatten::FlattenStage;
pub use ingest::{IngestStage, IngestStageBuilder};
pub use merge::{unresolved_column, MergeStage};

use crate::cancellation::CancellationToken;
use crate::core::{BatchMetrics, StageKind};
use crate::errors::{CyclestreamError, PipelineValidationError, Result};
use crate::storage::{CommitOutput, Position, TableMetadata, TableStore, Watermark};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Default upper bound on source units per ingest commit.
pub const DEFAULT_MAX_UNITS_PER_BATCH: usize = 1000;

/// Default upper bound on upstream rows per downstream commit.
pub const DEFAULT_MAX_ROWS_PER_BATCH: usize = 10_000;

/// Micro-batch size bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Maximum source units read by one ingest batch.
    pub max_units: usize,
    /// Maximum upstream rows read by one downstream batch.
    pub max_rows: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_units: DEFAULT_MAX_UNITS_PER_BATCH,
            max_rows: DEFAULT_MAX_ROWS_PER_BATCH,
        }
    }
}

/// Everything a stage may read while preparing one micro-batch.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// The stage's name, which also keys its watermark.
    pub stage: String,
    /// Table storage.
    pub store: Arc<dyn TableStore>,
    /// The watermark read before preparing.
    pub watermark: Watermark,
    /// Output table of the upstream stage, for downstream stages.
    pub input_table: Option<String>,
    /// Micro-batch bounds.
    pub limits: BatchLimits,
    /// Cancellation requested by the caller.
    pub cancellation: CancellationToken,
}

impl StageContext {
    /// Returns the upstream table or a configuration error.
    pub fn require_input_table(&self) -> Result<&str> {
        self.input_table.as_deref().ok_or_else(|| {
            CyclestreamError::Configuration(format!("stage '{}' has no upstream table", self.stage))
        })
    }

    /// Fails with `Cancelled` if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(CyclestreamError::Cancelled(
                self.cancellation
                    .reason()
                    .unwrap_or_else(|| "cancelled".to_string()),
            ));
        }
        Ok(())
    }
}

/// One micro-batch ready to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBatch {
    /// Watermark position after this batch.
    pub position: Position,
    /// Rows to write.
    pub output: CommitOutput,
    /// Counters for this batch.
    pub metrics: BatchMetrics,
}

/// A pipeline stage.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Returns the kind of stage.
    fn kind(&self) -> StageKind;

    /// Returns the upstream stage name, if the stage reads another stage.
    fn upstream(&self) -> Option<&str>;

    /// Returns the metadata of the table this stage writes.
    fn output_table(&self) -> &TableMetadata;

    /// Columns of the output table, when known before any data is seen.
    fn output_columns(&self) -> Option<Vec<String>> {
        None
    }

    /// Columns this stage reads from its upstream table.
    fn required_columns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Checks the stage's own configuration.
    fn validate(&self) -> std::result::Result<(), PipelineValidationError> {
        Ok(())
    }

    /// Prepares the next micro-batch, or `None` when no new input exists.
    async fn prepare(&self, ctx: &StageContext) -> Result<Option<PreparedBatch>>;
}
