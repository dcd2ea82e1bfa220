//! Failure tolerance for a pipeline pass.
//!
//! A failed stage never rolls back other stages: its own watermark simply
//! stays where it was. The mode only decides which other stages still run
//! in the same pass.

use crate::errors::CyclestreamError;
use crate::utils::format_timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// How a stage failure affects the rest of the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Start no further stages after the first failure.
    FailFast,
    /// Skip stages downstream of a failure, run unrelated branches.
    ContinueOnFailure,
    /// Run every stage; downstream stages consume what upstream already committed.
    #[default]
    BestEffort,
}

/// Record of a stage failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Stage name.
    pub stage: String,
    /// Error message.
    pub error: String,
    /// Stable error code.
    pub code: String,
    /// Whether a later run may succeed without operator action.
    pub retryable: bool,
    /// When the failure was recorded.
    pub timestamp: String,
    /// Additional context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl FailureRecord {
    /// Creates a record from an engine error.
    #[must_use]
    pub fn from_error(stage: impl Into<String>, err: &CyclestreamError) -> Self {
        Self {
            stage: stage.into(),
            error: err.to_string(),
            code: err.error_code().to_string(),
            retryable: err.is_retryable(),
            timestamp: format_timestamp(&Utc::now()),
            context: BTreeMap::new(),
        }
    }

    /// Adds context.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Tracks failures during one pass and gates dependent stages.
#[derive(Debug, Default)]
pub struct FailureCollector {
    /// Failure mode.
    pub mode: FailureMode,
    failures: Vec<FailureRecord>,
    failed_stages: HashSet<String>,
    blocked_stages: HashSet<String>,
    completed_stages: HashSet<String>,
}

impl FailureCollector {
    /// Creates a new failure collector.
    #[must_use]
    pub fn new(mode: FailureMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Records a stage failure.
    pub fn record_failure(&mut self, record: FailureRecord) {
        self.failed_stages.insert(record.stage.clone());
        self.failures.push(record);
    }

    /// Records a stage that did not run because of an earlier failure.
    pub fn record_blocked(&mut self, stage: &str) {
        self.blocked_stages.insert(stage.to_string());
    }

    /// Records a stage completion.
    pub fn record_completion(&mut self, stage: &str) {
        self.completed_stages.insert(stage.to_string());
    }

    /// Returns true if the stage has failed.
    #[must_use]
    pub fn has_failed(&self, stage: &str) -> bool {
        self.failed_stages.contains(stage)
    }

    /// Returns true if no further stages should start.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.mode == FailureMode::FailFast && !self.failures.is_empty()
    }

    /// Returns the dependency that blocks a stage, if any.
    #[must_use]
    pub fn blocker<'a>(&self, dependencies: impl IntoIterator<Item = &'a String>) -> Option<&'a str> {
        match self.mode {
            FailureMode::BestEffort => None,
            FailureMode::FailFast | FailureMode::ContinueOnFailure => dependencies
                .into_iter()
                .find(|dep| self.failed_stages.contains(*dep) || self.blocked_stages.contains(*dep))
                .map(String::as_str),
        }
    }

    /// Returns all failures.
    #[must_use]
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    /// Returns the number of completed stages.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed_stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(stage: &str) -> FailureRecord {
        FailureRecord::from_error(stage, &CyclestreamError::transient("raw/status", "EAGAIN"))
    }

    #[test]
    fn test_record_from_error() {
        let record = failure("station_status_bronze")
            .with_context("watermark", serde_json::json!("status_0042.json"));

        assert_eq!(record.code, "transient_io");
        assert!(record.retryable);
        assert!(record.timestamp.ends_with('Z'));
        assert_eq!(record.context.len(), 1);
    }

    #[test]
    fn test_best_effort_runs_everything() {
        let mut collector = FailureCollector::default();
        collector.record_failure(failure("bronze"));

        assert_eq!(collector.mode, FailureMode::BestEffort);
        assert!(!collector.should_stop());
        assert_eq!(collector.blocker(&["bronze".to_string()]), None);
    }

    #[test]
    fn test_continue_on_failure_blocks_downstream_only() {
        let mut collector = FailureCollector::new(FailureMode::ContinueOnFailure);
        collector.record_failure(failure("status_bronze"));
        collector.record_blocked("status_silver");

        let silver = ["status_bronze".to_string()];
        let current = ["status_silver".to_string()];
        let weather = ["weather_bronze".to_string()];
        assert_eq!(collector.blocker(&silver), Some("status_bronze"));
        assert_eq!(collector.blocker(&current), Some("status_silver"));
        assert_eq!(collector.blocker(&weather), None);
        assert!(!collector.should_stop());
    }

    #[test]
    fn test_fail_fast_stops() {
        let mut collector = FailureCollector::new(FailureMode::FailFast);
        assert!(!collector.should_stop());
        collector.record_completion("weather_bronze");
        collector.record_failure(failure("status_bronze"));

        assert!(collector.should_stop());
        assert!(collector.has_failed("status_bronze"));
        assert_eq!(collector.completed(), 1);
        assert_eq!(collector.failures().len(), 1);
    }

    #[test]
    fn test_mode_serde() {
        let mode: FailureMode = serde_json::from_str("\"continue_on_failure\"").unwrap();
        assert_eq!(mode, FailureMode::ContinueOnFailure);
    }
}
