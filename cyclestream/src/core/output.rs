//! Stage output type with factory methods.

use super::StageStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters accumulated across the micro-batches of one stage execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetrics {
    /// Micro-batches committed.
    pub batches_committed: u64,
    /// Source units read (ingest only).
    pub units_read: u64,
    /// Input rows consumed.
    pub rows_in: u64,
    /// Rows written to the output table.
    pub rows_out: u64,
    /// Rows removed by drop-row constraints.
    pub rows_dropped: u64,
    /// Rows retained with a flag-only violation.
    pub rows_flagged: u64,
    /// Rows carrying rescued data.
    pub rows_rescued: u64,
    /// Records that failed to parse.
    pub corrupt_records: u64,
    /// Current-state rows inserted.
    pub merged_inserted: u64,
    /// Current-state rows replaced.
    pub merged_updated: u64,
    /// Snapshots ignored as stale or duplicate.
    pub merged_stale: u64,
    /// Snapshots without a key or sequence value.
    pub unkeyed: u64,
    /// Violation counts per constraint name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constraint_violations: BTreeMap<String, u64>,
}

impl BatchMetrics {
    /// Adds another batch's counters to this one.
    pub fn absorb(&mut self, other: &Self) {
        self.batches_committed += other.batches_committed;
        self.units_read += other.units_read;
        self.rows_in += other.rows_in;
        self.rows_out += other.rows_out;
        self.rows_dropped += other.rows_dropped;
        self.rows_flagged += other.rows_flagged;
        self.rows_rescued += other.rows_rescued;
        self.corrupt_records += other.corrupt_records;
        self.merged_inserted += other.merged_inserted;
        self.merged_updated += other.merged_updated;
        self.merged_stale += other.merged_stale;
        self.unkeyed += other.unkeyed;
        for (name, count) in &other.constraint_violations {
            *self.constraint_violations.entry(name.clone()).or_insert(0) += count;
        }
    }

    /// Returns the total number of constraint violations.
    #[must_use]
    pub fn total_violations(&self) -> u64 {
        self.constraint_violations.values().sum()
    }
}

/// The outcome of one stage execution within a run.
///
/// `StageOutput` is immutable once created and provides factory methods
/// for creating outputs with different statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    /// The status of the stage execution.
    pub status: StageStatus,

    /// Counters for committed work.
    #[serde(default)]
    pub metrics: BatchMetrics,

    /// The watermark position after the last commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<String>,

    /// Error message (for failed executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Stable error code (for failed executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Skip reason (for executions without new input).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Cancel reason (for cancelled executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,

    /// Whether the error is retryable.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl Default for StageOutput {
    fn default() -> Self {
        Self::skip("no new input")
    }
}

impl StageOutput {
    fn with_status(status: StageStatus) -> Self {
        Self {
            status,
            metrics: BatchMetrics::default(),
            watermark: None,
            error: None,
            error_code: None,
            skip_reason: None,
            cancel_reason: None,
            retryable: false,
        }
    }

    /// Creates a successful output from accumulated metrics.
    #[must_use]
    pub fn ok(metrics: BatchMetrics, watermark: impl Into<String>) -> Self {
        Self {
            metrics,
            watermark: Some(watermark.into()),
            ..Self::with_status(StageStatus::Ok)
        }
    }

    /// Creates a skip output with a reason.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Self::with_status(StageStatus::Skip)
        }
    }

    /// Creates a cancel output with a reason.
    #[must_use]
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self {
            cancel_reason: Some(reason.into()),
            ..Self::with_status(StageStatus::Cancel)
        }
    }

    /// Creates a failure output with an error message.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(StageStatus::Fail)
        }
    }

    /// Creates a retryable failure output.
    #[must_use]
    pub fn fail_retryable(error: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::fail(error)
        }
    }

    /// Creates a failure output from an engine error.
    #[must_use]
    pub fn from_error(err: &crate::errors::CyclestreamError) -> Self {
        let mut output = if err.is_retryable() {
            Self::fail_retryable(err.to_string())
        } else {
            Self::fail(err.to_string())
        };
        output.error_code = Some(err.error_code().to_string());
        output
    }

    /// Attaches metrics for work committed before the outcome was decided.
    #[must_use]
    pub fn with_metrics(mut self, metrics: BatchMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attaches the last committed watermark.
    #[must_use]
    pub fn with_watermark(mut self, watermark: Option<String>) -> Self {
        self.watermark = watermark;
        self
    }

    /// Returns true if the stage succeeded or had nothing to do.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if the stage failed or was cancelled.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}
