//! Pipeline builder with validation.

use super::{StageGraph, StageSpec};
use crate::errors::{ContractErrorInfo, CycleDetectedError, PipelineValidationError};
use crate::stages::{unresolved_column, Stage};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Builder for creating validated pipelines.
///
/// Stages may be added one at a time, in which case every upstream must
/// already be present, or all at once through [`PipelineBuilder::stages`],
/// which accepts any order and validates the whole graph afterwards.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: HashMap<String, StageSpec>,
    stage_order: Vec<String>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: HashMap::new(),
            stage_order: Vec::new(),
        }
    }

    /// Adds a stage whose upstream is already part of the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails (missing dependency, duplicate, etc.)
    pub fn stage(mut self, runner: Arc<dyn Stage>) -> Result<Self, PipelineValidationError> {
        self.add_stage_spec(StageSpec::new(runner))?;
        Ok(self)
    }

    /// Adds a batch of stages in any order, then validates the graph.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicates, unknown upstreams or cycles.
    pub fn stages(
        mut self,
        runners: impl IntoIterator<Item = Arc<dyn Stage>>,
    ) -> Result<Self, PipelineValidationError> {
        for runner in runners {
            let spec = StageSpec::new(runner);
            spec.validate()?;
            self.check_unique(&spec)?;
            self.stage_order.push(spec.name.clone());
            self.stages.insert(spec.name.clone(), spec);
        }
        for name in &self.stage_order {
            self.check_dependencies(&self.stages[name])?;
        }
        self.detect_cycles()?;
        Ok(self)
    }

    /// Adds a stage with a specification.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn add_stage_spec(&mut self, spec: StageSpec) -> Result<(), PipelineValidationError> {
        spec.validate()?;
        self.check_unique(&spec)?;
        self.check_dependencies(&spec)?;

        self.stage_order.push(spec.name.clone());
        self.stages.insert(spec.name.clone(), spec);

        self.detect_cycles()?;
        Ok(())
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages.
    pub fn build(self) -> Result<StageGraph, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages").with_error_info(
                ContractErrorInfo::new("CONTRACT-004-EMPTY", "Cannot build an empty pipeline")
                    .with_fix_hint("Add at least one stage to the pipeline before building."),
            ));
        }

        Ok(StageGraph::new(self.name, self.stages, self.stage_order))
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn check_unique(&self, spec: &StageSpec) -> Result<(), PipelineValidationError> {
        if self.stages.contains_key(&spec.name) {
            return Err(conflict(
                &spec.name,
                format!("Stage '{}' is defined more than once", spec.name),
            ));
        }
        let table = spec.output_table();
        if let Some(other) = self.stages.values().find(|s| s.output_table() == table) {
            return Err(conflict(
                &spec.name,
                format!(
                    "Stages '{}' and '{}' both write table '{table}'",
                    other.name, spec.name
                ),
            )
            .with_stages(vec![other.name.clone(), spec.name.clone()]));
        }
        Ok(())
    }

    fn check_dependencies(&self, spec: &StageSpec) -> Result<(), PipelineValidationError> {
        for dep in &spec.dependencies {
            let Some(upstream) = self.stages.get(dep) else {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' depends on unknown stage '{}'",
                    spec.name, dep
                ))
                .with_stages(vec![spec.name.clone(), dep.clone()])
                .with_error_info(
                    ContractErrorInfo::new(
                        "CONTRACT-004-MISSING_DEP",
                        format!("Dependency '{dep}' not found"),
                    )
                    .with_fix_hint(
                        "Ensure the dependency is added before the stage that depends on it.",
                    ),
                ));
            };
            // Unknown upstream columns (auto-flatten, ingest) resolve at run time.
            let Some(available) = upstream.runner.output_columns() else {
                continue;
            };
            for column in spec.runner.required_columns() {
                if !available.contains(&column) {
                    return Err(unresolved_column(&spec.name, &column, dep));
                }
            }
        }
        Ok(())
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for name in &self.stage_order {
            if !visited.contains(name) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut rec_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(spec) = self.stages.get(node) {
            for dep in &spec.dependencies {
                if !visited.contains(dep) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep) {
                    let start = path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }
}

fn conflict(stage: &str, message: String) -> PipelineValidationError {
    PipelineValidationError::new(message.clone())
        .with_stages(vec![stage.to_string()])
        .with_error_info(
            ContractErrorInfo::new("CONTRACT-004-CONFLICT", message)
                .with_fix_hint("Give every stage a unique name and output table."),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::QualityTier;
    use crate::merge::MergeSpec;
    use crate::source::InMemorySource;
    use crate::stages::{FlattenStage, IngestStage, MergeStage};
    use crate::storage::TableMetadata;
    use crate::transform::{FlattenSpec, Projection};

    fn ingest(name: &str) -> Arc<dyn Stage> {
        Arc::new(
            IngestStage::builder(
                name,
                format!("raw/{name}"),
                Arc::new(InMemorySource::new()),
                TableMetadata::append_only(format!("{name}_bronze"), QualityTier::Bronze),
            )
            .build(),
        )
    }

    fn flatten(name: &str, upstream: &str, spec: FlattenSpec) -> Arc<dyn Stage> {
        Arc::new(FlattenStage::new(
            name,
            upstream,
            spec,
            TableMetadata::append_only(format!("{name}_silver"), QualityTier::Silver),
        ))
    }

    fn merge(name: &str, upstream: &str, key: &str) -> Arc<dyn Stage> {
        Arc::new(MergeStage::new(
            name,
            upstream,
            format!("{name}_current"),
            MergeSpec::new(key, "last_updated"),
        ))
    }

    #[test]
    fn test_builder_creation() {
        let builder = PipelineBuilder::new("bike_share");
        assert_eq!(builder.name(), "bike_share");
        assert_eq!(builder.stage_count(), 0);
    }

    #[test]
    fn test_builder_with_dependencies() {
        let builder = PipelineBuilder::new("weather")
            .stage(ingest("weather"))
            .unwrap()
            .stage(flatten("clean_weather", "weather", FlattenSpec::default()))
            .unwrap();

        assert_eq!(builder.stage_count(), 2);
    }

    #[test]
    fn test_builder_missing_dependency() {
        let err = PipelineBuilder::new("weather")
            .stage(flatten("clean_weather", "weather", FlattenSpec::default()))
            .unwrap_err();

        assert_eq!(err.code(), Some("CONTRACT-004-MISSING_DEP"));
    }

    #[test]
    fn test_builder_duplicate_name() {
        let err = PipelineBuilder::new("weather")
            .stage(ingest("weather"))
            .unwrap()
            .stage(ingest("weather"))
            .unwrap_err();

        assert_eq!(err.code(), Some("CONTRACT-004-CONFLICT"));
    }

    #[test]
    fn test_builder_shared_output_table() {
        let a: Arc<dyn Stage> = Arc::new(FlattenStage::new(
            "a",
            "weather",
            FlattenSpec::default(),
            TableMetadata::append_only("shared", QualityTier::Silver),
        ));
        let b: Arc<dyn Stage> = Arc::new(FlattenStage::new(
            "b",
            "weather",
            FlattenSpec::default(),
            TableMetadata::append_only("shared", QualityTier::Silver),
        ));

        let err = PipelineBuilder::new("weather")
            .stages([ingest("weather"), a, b])
            .unwrap_err();
        assert_eq!(err.code(), Some("CONTRACT-004-CONFLICT"));
    }

    #[test]
    fn test_builder_any_order() {
        let builder = PipelineBuilder::new("weather")
            .stages([
                flatten("clean_weather", "weather", FlattenSpec::default()),
                ingest("weather"),
            ])
            .unwrap();

        let graph = builder.build().unwrap();
        assert_eq!(graph.execution_order(), ["weather", "clean_weather"]);
    }

    #[test]
    fn test_builder_cycle_detection() {
        let err = PipelineBuilder::new("loop")
            .stages([
                flatten("a", "b", FlattenSpec::default()),
                flatten("b", "a", FlattenSpec::default()),
            ])
            .unwrap_err();

        assert_eq!(err.code(), Some("CONTRACT-004-CYCLE"));
    }

    #[test]
    fn test_builder_unresolved_merge_key() {
        let shaped = FlattenSpec {
            projections: vec![Projection::path("station_id"), Projection::path("last_updated")],
            ..FlattenSpec::default()
        };

        let ok = PipelineBuilder::new("status").stages([
            ingest("status"),
            flatten("status_flat", "status", shaped.clone()),
            merge("status_merge", "status_flat", "station_id"),
        ]);
        assert!(ok.is_ok());

        let err = PipelineBuilder::new("status")
            .stages([
                ingest("status"),
                flatten("status_flat", "status", shaped),
                merge("status_merge", "status_flat", "dock_id"),
            ])
            .unwrap_err();
        assert_eq!(err.code(), Some("CONTRACT-004-UNRESOLVED_COLUMN"));
    }

    #[test]
    fn test_builder_empty_build() {
        let err = PipelineBuilder::new("empty").build().unwrap_err();
        assert_eq!(err.code(), Some("CONTRACT-004-EMPTY"));
    }
}
