//! Append-only silver stage.

use super::{PreparedBatch, Stage, StageContext};
use crate::core::{BatchMetrics, FlatRow, SourceRecord, StageKind};
use crate::errors::Result;
use crate::storage::{CommitOutput, Position, TableMetadata};
use crate::transform::{flatten, FlattenSpec};
use async_trait::async_trait;
use tracing::debug;

/// Flattens new upstream rows into an append-only table.
#[derive(Debug, Clone)]
pub struct FlattenStage {
    name: String,
    upstream: String,
    spec: FlattenSpec,
    table: TableMetadata,
}

impl FlattenStage {
    /// Creates a flatten stage. Constraint names are recorded on the table.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        upstream: impl Into<String>,
        spec: FlattenSpec,
        table: TableMetadata,
    ) -> Self {
        let constraints = spec.constraints.iter().map(|c| c.name.clone()).collect();
        Self {
            name: name.into(),
            upstream: upstream.into(),
            table: table.with_constraints(constraints),
            spec,
        }
    }

    /// Returns the transform spec.
    #[must_use]
    pub fn spec(&self) -> &FlattenSpec {
        &self.spec
    }
}

#[async_trait]
impl Stage for FlattenStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Flatten
    }

    fn upstream(&self) -> Option<&str> {
        Some(&self.upstream)
    }

    fn output_table(&self) -> &TableMetadata {
        &self.table
    }

    fn output_columns(&self) -> Option<Vec<String>> {
        self.spec.output_columns()
    }

    async fn prepare(&self, ctx: &StageContext) -> Result<Option<PreparedBatch>> {
        let input = ctx.require_input_table()?;
        let offset = ctx.watermark.position.offset();
        let rows = ctx.store.read_since(input, offset, ctx.limits.max_rows).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let consumed = rows.len() as u64;
        let records: Vec<SourceRecord> = rows.into_iter().map(SourceRecord::from_row).collect();
        let out = flatten(&self.spec, &records);
        debug!(
            stage = %self.name,
            rows_in = consumed,
            rows_out = out.rows.len(),
            dropped = out.quality.dropped,
            "Flattened batch"
        );

        let metrics = BatchMetrics {
            rows_in: consumed,
            rows_out: out.rows.len() as u64,
            rows_dropped: out.quality.dropped,
            rows_flagged: out.quality.flagged,
            constraint_violations: out.quality.violations,
            ..BatchMetrics::default()
        };
        Ok(Some(PreparedBatch {
            position: Position::Offset(offset + consumed),
            output: CommitOutput::Append(out.rows.into_iter().map(FlatRow::into_row).collect()),
            metrics,
        }))
    }
}
