//! Pipeline lifecycle events.
//!
//! The runner reports every stage outcome as a [`PipelineEvent`] through an
//! [`EventSink`]. Sinks never fail the pipeline.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Event type names.
pub mod names {
    /// A run pass began.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A run pass finished.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A stage began a micro-batch loop.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage committed a micro-batch.
    pub const STAGE_COMMITTED: &str = "stage.committed";
    /// A stage found no new input.
    pub const STAGE_IDLE: &str = "stage.idle";
    /// A stage attempt failed; its watermark is unchanged.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage stopped before committing because of cancellation.
    pub const STAGE_CANCELLED: &str = "stage.cancelled";
    /// A committed batch had constraint violations.
    pub const QUALITY_VIOLATIONS: &str = "quality.violations";
}

/// A structured event emitted by the runner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PipelineEvent {
    /// See [`names::PIPELINE_STARTED`].
    PipelineStarted {
        /// Run identifier.
        run_id: Uuid,
        /// Pipeline name.
        pipeline: String,
        /// Pass number within the run, from 1.
        pass: u64,
        /// Number of stages.
        stages: usize,
    },
    /// See [`names::PIPELINE_COMPLETED`].
    PipelineCompleted {
        /// Run identifier.
        run_id: Uuid,
        /// Pipeline name.
        pipeline: String,
        /// Pass number within the run.
        pass: u64,
        /// Stages that committed at least one batch.
        committed: usize,
        /// Stages that failed.
        failed: usize,
        /// Wall time of the pass.
        duration_ms: u64,
    },
    /// See [`names::STAGE_STARTED`].
    StageStarted {
        /// Run identifier.
        run_id: Uuid,
        /// Stage name.
        stage: String,
        /// Watermark at start.
        watermark: String,
    },
    /// See [`names::STAGE_COMMITTED`].
    StageCommitted {
        /// Run identifier.
        run_id: Uuid,
        /// Stage name.
        stage: String,
        /// Output table.
        table: String,
        /// Watermark after the commit.
        watermark: String,
        /// Watermark version after the commit.
        version: u64,
        /// Rows written.
        rows: u64,
    },
    /// See [`names::STAGE_IDLE`].
    StageIdle {
        /// Run identifier.
        run_id: Uuid,
        /// Stage name.
        stage: String,
        /// Current watermark.
        watermark: String,
    },
    /// See [`names::STAGE_FAILED`].
    StageFailed {
        /// Run identifier.
        run_id: Uuid,
        /// Stage name.
        stage: String,
        /// Error message.
        error: String,
        /// Stable error code.
        code: String,
        /// Whether a later run may succeed unchanged.
        retryable: bool,
    },
    /// See [`names::STAGE_CANCELLED`].
    StageCancelled {
        /// Run identifier.
        run_id: Uuid,
        /// Stage name.
        stage: String,
        /// Cancellation reason.
        reason: String,
    },
    /// See [`names::QUALITY_VIOLATIONS`].
    QualityViolations {
        /// Run identifier.
        run_id: Uuid,
        /// Stage name.
        stage: String,
        /// Output table.
        table: String,
        /// Violation counts per constraint.
        violations: BTreeMap<String, u64>,
        /// Rows dropped.
        dropped: u64,
        /// Rows flagged.
        flagged: u64,
    },
}

impl PipelineEvent {
    /// Returns the event type name.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PipelineStarted { .. } => names::PIPELINE_STARTED,
            Self::PipelineCompleted { .. } => names::PIPELINE_COMPLETED,
            Self::StageStarted { .. } => names::STAGE_STARTED,
            Self::StageCommitted { .. } => names::STAGE_COMMITTED,
            Self::StageIdle { .. } => names::STAGE_IDLE,
            Self::StageFailed { .. } => names::STAGE_FAILED,
            Self::StageCancelled { .. } => names::STAGE_CANCELLED,
            Self::QualityViolations { .. } => names::QUALITY_VIOLATIONS,
        }
    }

    /// Returns the event payload as JSON.
    #[must_use]
    pub fn data(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
