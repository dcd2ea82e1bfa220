//! The validated stage graph.
//!
//! A stage becomes ready once every stage it reads from has finished its
//! execution for the pass, so independent sources run side by side.

use super::StageSpec;
use std::collections::{BTreeSet, HashMap, HashSet};

/// A directed acyclic graph of stages.
#[derive(Debug)]
pub struct StageGraph {
    name: String,
    stages: HashMap<String, StageSpec>,
    execution_order: Vec<String>,
}

impl StageGraph {
    /// Creates a new stage graph.
    #[must_use]
    pub fn new(name: String, stages: HashMap<String, StageSpec>, stage_order: Vec<String>) -> Self {
        let execution_order = topological_sort(&stages, &stage_order);
        Self {
            name,
            stages,
            execution_order,
        }
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

    /// Returns the execution order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Returns a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Iterates stages in execution order.
    pub fn specs(&self) -> impl Iterator<Item = &StageSpec> {
        self.execution_order
            .iter()
            .filter_map(|name| self.stages.get(name))
    }

    /// Returns the stages that read from `name`, in execution order.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.specs()
            .filter(|spec| spec.dependencies.contains(name))
            .map(|spec| spec.name.as_str())
            .collect()
    }

    /// Returns every stage downstream of `name`, transitively.
    #[must_use]
    pub fn downstream_of(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![name];
        while let Some(current) = frontier.pop() {
            for child in self.dependents(current) {
                if found.insert(child.to_string()) {
                    frontier.push(child);
                }
            }
        }
        found
    }

    /// Returns the table a stage reads from: its upstream's output table.
    #[must_use]
    pub fn input_table(&self, name: &str) -> Option<String> {
        let upstream = self.stages.get(name)?.runner.upstream()?;
        self.stages
            .get(upstream)
            .map(|spec| spec.output_table().to_string())
    }

    /// Returns the number of unfinished dependencies per stage.
    #[must_use]
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        self.stages
            .iter()
            .map(|(name, spec)| (name.clone(), spec.dependencies.len()))
            .collect()
    }
}

fn topological_sort(stages: &HashMap<String, StageSpec>, stage_order: &[String]) -> Vec<String> {
    fn visit(
        node: &str,
        stages: &HashMap<String, StageSpec>,
        visited: &mut HashSet<String>,
        in_progress: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        // The builder rejects cycles, so an in-progress node is only skipped.
        if visited.contains(node) || !in_progress.insert(node.to_string()) {
            return;
        }
        if let Some(spec) = stages.get(node) {
            for dep in &spec.dependencies {
                visit(dep, stages, visited, in_progress, result);
            }
        }
        in_progress.remove(node);
        visited.insert(node.to_string());
        result.push(node.to_string());
    }

    let mut result = Vec::new();
    let mut visited = HashSet::new();
    let mut in_progress = HashSet::new();
    for name in stage_order {
        visit(name, stages, &mut visited, &mut in_progress, &mut result);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::super::PipelineBuilder;
    use super::*;
    use crate::core::QualityTier;
    use crate::merge::MergeSpec;
    use crate::source::InMemorySource;
    use crate::stages::{FlattenStage, IngestStage, MergeStage, Stage};
    use crate::storage::TableMetadata;
    use crate::transform::FlattenSpec;
    use std::sync::Arc;

    fn graph() -> StageGraph {
        let source = Arc::new(InMemorySource::new());
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(MergeStage::new(
                "station_info_current",
                "station_info_bronze",
                "station_info",
                MergeSpec::new("station_id", "last_updated"),
            )),
            Arc::new(
                IngestStage::builder(
                    "station_info_bronze",
                    "raw/info",
                    source.clone(),
                    TableMetadata::append_only("bronze_info", QualityTier::Bronze),
                )
                .build(),
            ),
            Arc::new(
                IngestStage::builder(
                    "weather_bronze",
                    "raw/weather",
                    source,
                    TableMetadata::append_only("bronze_weather", QualityTier::Bronze),
                )
                .build(),
            ),
            Arc::new(FlattenStage::new(
                "weather_silver",
                "weather_bronze",
                FlattenSpec::default(),
                TableMetadata::append_only("silver_weather", QualityTier::Silver),
            )),
        ];
        PipelineBuilder::new("bike_share")
            .stages(stages)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_upstream_runs_first() {
        let graph = graph();
        assert_eq!(graph.name(), "bike_share");
        assert_eq!(graph.stage_count(), 4);
        assert_eq!(
            graph.execution_order(),
            [
                "station_info_bronze",
                "station_info_current",
                "weather_bronze",
                "weather_silver"
            ]
        );
    }

    #[test]
    fn test_input_table_is_upstream_output() {
        let graph = graph();
        assert_eq!(graph.input_table("weather_silver").as_deref(), Some("bronze_weather"));
        assert_eq!(graph.input_table("weather_bronze"), None);
    }

    #[test]
    fn test_dependents_and_in_degrees() {
        let graph = graph();
        assert_eq!(graph.dependents("weather_bronze"), vec!["weather_silver"]);
        assert!(graph.downstream_of("station_info_bronze").contains("station_info_current"));

        let degrees = graph.in_degrees();
        assert_eq!(degrees["weather_bronze"], 0);
        assert_eq!(degrees["station_info_current"], 1);
    }
}
