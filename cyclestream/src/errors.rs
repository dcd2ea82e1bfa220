//! Error types for the cyclestream engine.
//!
//! The taxonomy follows how failures are handled by the runner. Transient
//! I/O is retried, a commit conflict fails a single stage attempt, and
//! configuration errors abort startup before any stage executes.
//!
//! Undecodable input has no variant here: it is rescued into
//! `_corrupt_record` or `_rescued_data` inside the batch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for cyclestream operations.
#[derive(Debug, Error)]
pub enum CyclestreamError {
    /// Listing or reading a source unit failed; the stage may be retried.
    #[error("Transient I/O error on '{location}': {message}")]
    TransientIo {
        /// The source location or unit involved.
        location: String,
        /// The underlying failure.
        message: String,
    },

    /// An optimistic commit found the stored version changed since it was read.
    #[error("Commit conflict on '{target}': expected version {expected}, found {actual}")]
    CommitConflict {
        /// The watermark or table key that conflicted.
        target: String,
        /// The version the writer read.
        expected: u64,
        /// The version currently stored.
        actual: u64,
    },

    /// The pipeline configuration is unusable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A pipeline validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A cycle was detected in the pipeline.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A cancellation occurred.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CyclestreamError {
    /// Creates a transient I/O error.
    #[must_use]
    pub fn transient(location: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::TransientIo {
            location: location.into(),
            message: message.to_string(),
        }
    }

    /// Creates a commit conflict error.
    #[must_use]
    pub fn conflict(target: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::CommitConflict {
            target: target.into(),
            expected,
            actual,
        }
    }

    /// Returns true if a later attempt may succeed without operator action.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. } | Self::Io(_))
    }

    /// Returns true if the error must abort the pipeline before stages run.
    #[must_use]
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Validation(_) | Self::CycleDetected(_)
        )
    }

    /// Returns a stable code for reports and events.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TransientIo { .. } => "transient_io",
            Self::CommitConflict { .. } => "commit_conflict",
            Self::Configuration(_) => "configuration",
            Self::Validation(_) => "validation",
            Self::CycleDetected(_) => "cycle_detected",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = CyclestreamError> = std::result::Result<T, E>;

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONTRACT-004-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "CONTRACT-004-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the upstream references in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}
