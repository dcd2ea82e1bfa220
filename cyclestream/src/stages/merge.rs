//! Current-state silver stage.

use super::{PreparedBatch, Stage, StageContext};
use crate::core::{BatchMetrics, FlatRow, Row, SourceRecord, StageKind};
use crate::errors::{ContractErrorInfo, PipelineValidationError, Result};
use crate::merge::{plan_changes, MergeSpec};
use crate::storage::{CommitOutput, Position, TableMetadata};
use crate::transform::{flatten, FlattenSpec};
use async_trait::async_trait;
use tracing::debug;

/// Error for a column a stage reads that its input never produces.
#[must_use]
pub fn unresolved_column(stage: &str, column: &str, producer: &str) -> PipelineValidationError {
    PipelineValidationError::new(format!(
        "Stage '{stage}' reads column '{column}', which '{producer}' does not produce"
    ))
    .with_stages(vec![stage.to_string(), producer.to_string()])
    .with_error_info(
        ContractErrorInfo::new(
            "CONTRACT-004-UNRESOLVED_COLUMN",
            format!("Column '{column}' cannot be resolved"),
        )
        .with_context_entry("stage", stage)
        .with_context_entry("column", column)
        .with_fix_hint("Project the column in the upstream flatten spec or fix the merge key."),
    )
}

/// Merges new upstream rows into a current-state table.
///
/// An optional flatten spec shapes the upstream rows first, so a merge can
/// read a bronze table directly.
#[derive(Debug, Clone)]
pub struct MergeStage {
    name: String,
    upstream: String,
    shape: Option<FlattenSpec>,
    spec: MergeSpec,
    table: TableMetadata,
}

impl MergeStage {
    /// Creates a merge stage writing `table_name`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        upstream: impl Into<String>,
        table_name: impl Into<String>,
        spec: MergeSpec,
    ) -> Self {
        let table = TableMetadata::current_state(table_name, spec.key.clone(), spec.sequence.clone());
        Self {
            name: name.into(),
            upstream: upstream.into(),
            shape: None,
            spec,
            table,
        }
    }

    /// Flattens upstream rows before tagging them as snapshots.
    #[must_use]
    pub fn with_shape(mut self, shape: FlattenSpec) -> Self {
        self.table.constraints = shape.constraints.iter().map(|c| c.name.clone()).collect();
        self.shape = Some(shape);
        self
    }

    /// Returns the merge spec.
    #[must_use]
    pub fn spec(&self) -> &MergeSpec {
        &self.spec
    }

    /// Returns the shaping spec, if any.
    #[must_use]
    pub fn shape(&self) -> Option<&FlattenSpec> {
        self.shape.as_ref()
    }
}

#[async_trait]
impl Stage for MergeStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Merge
    }

    fn upstream(&self) -> Option<&str> {
        Some(&self.upstream)
    }

    fn output_table(&self) -> &TableMetadata {
        &self.table
    }

    fn required_columns(&self) -> Vec<String> {
        if self.shape.is_some() {
            return Vec::new();
        }
        vec![self.spec.key.clone(), self.spec.sequence.clone()]
    }

    fn validate(&self) -> std::result::Result<(), PipelineValidationError> {
        if self.spec.key.trim().is_empty() || self.spec.sequence.trim().is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Merge stage '{}' needs a key and a sequence column",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        let Some(columns) = self.shape.as_ref().and_then(FlattenSpec::output_columns) else {
            return Ok(());
        };
        for column in [&self.spec.key, &self.spec.sequence] {
            if !columns.contains(column) {
                return Err(unresolved_column(&self.name, column, &self.name));
            }
        }
        Ok(())
    }

    async fn prepare(&self, ctx: &StageContext) -> Result<Option<PreparedBatch>> {
        let input = ctx.require_input_table()?;
        let offset = ctx.watermark.position.offset();
        let rows = ctx.store.read_since(input, offset, ctx.limits.max_rows).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let consumed = rows.len() as u64;
        let mut metrics = BatchMetrics {
            rows_in: consumed,
            ..BatchMetrics::default()
        };

        let rows: Vec<Row> = match &self.shape {
            Some(shape) => {
                let records: Vec<SourceRecord> =
                    rows.into_iter().map(SourceRecord::from_row).collect();
                let out = flatten(shape, &records);
                metrics.rows_dropped = out.quality.dropped;
                metrics.rows_flagged = out.quality.flagged;
                metrics.constraint_violations = out.quality.violations;
                out.rows.into_iter().map(FlatRow::into_row).collect()
            }
            None => rows,
        };

        let (snapshots, unkeyed) = self.spec.snapshots(rows);
        let mut keys: Vec<String> = snapshots.iter().map(|s| s.key.clone()).collect();
        keys.sort();
        keys.dedup();
        let existing = ctx.store.current_rows(&self.table.name, &keys).await?;
        let (upserts, report) = plan_changes(snapshots, &existing);
        debug!(
            stage = %self.name,
            snapshots = report.snapshots_in,
            inserted = report.inserted,
            updated = report.updated,
            stale = report.stale,
            unkeyed,
            "Planned merge"
        );

        metrics.unkeyed = unkeyed;
        metrics.merged_inserted = report.inserted;
        metrics.merged_updated = report.updated;
        metrics.merged_stale = report.stale + report.superseded;
        metrics.rows_out = upserts.len() as u64;
        Ok(Some(PreparedBatch {
            position: Position::Offset(offset + consumed),
            output: CommitOutput::Upsert(upserts),
            metrics,
        }))
    }
}
