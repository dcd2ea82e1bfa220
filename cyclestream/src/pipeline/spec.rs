//! Pipeline and stage specifications.

use crate::core::StageKind;
use crate::errors::PipelineValidationError;
use crate::stages::Stage;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Specification for a single stage in a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The stage implementation.
    pub runner: Arc<dyn Stage>,
    /// Names of stages this stage reads from.
    pub dependencies: BTreeSet<String>,
    /// The kind of stage.
    pub kind: StageKind,
}

impl StageSpec {
    /// Creates a specification from a stage, taking dependencies from its upstream.
    #[must_use]
    pub fn new(runner: Arc<dyn Stage>) -> Self {
        let dependencies = runner.upstream().map(str::to_string).into_iter().collect();
        Self {
            name: runner.name().to_string(),
            kind: runner.kind(),
            runner,
            dependencies,
        }
    }

    /// Adds an ordering dependency beyond the stage's upstream.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Returns the name of the table the stage writes.
    #[must_use]
    pub fn output_table(&self) -> &str {
        &self.runner.output_table().name
    }

    /// Validates the stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage depends on itself, has an empty name,
    /// or rejects its own configuration.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty"));
        }
        if self.dependencies.contains(&self.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        if self.kind != StageKind::Ingest && self.runner.upstream().is_none() {
            return Err(PipelineValidationError::new(format!(
                "{} stage '{}' needs an upstream stage",
                self.kind, self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        self.runner.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeSpec;
    use crate::stages::{FlattenStage, MergeStage};
    use crate::storage::TableMetadata;
    use crate::core::QualityTier;
    use crate::transform::FlattenSpec;

    fn flatten_stage(name: &str, upstream: &str) -> Arc<dyn Stage> {
        Arc::new(FlattenStage::new(
            name,
            upstream,
            FlattenSpec::default(),
            TableMetadata::append_only(format!("{name}_table"), QualityTier::Silver),
        ))
    }

    #[test]
    fn test_dependencies_follow_upstream() {
        let spec = StageSpec::new(flatten_stage("clean_weather", "weather_bronze"));

        assert_eq!(spec.name, "clean_weather");
        assert_eq!(spec.kind, StageKind::Flatten);
        assert!(spec.dependencies.contains("weather_bronze"));
        assert_eq!(spec.output_table(), "clean_weather_table");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let spec = StageSpec::new(flatten_stage("loop", "loop"));
        let err = spec.validate().unwrap_err();
        assert!(err.message.contains("cannot depend on itself"));
    }

    #[test]
    fn test_merge_without_key_rejected() {
        let stage = MergeStage::new("info", "info_bronze", "info_current", MergeSpec::new("", "seq"));
        let spec = StageSpec::new(Arc::new(stage));
        assert!(spec.validate().is_err());
    }
}
