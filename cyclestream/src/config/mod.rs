//! Pipeline configuration.
//!
//! A pipeline is described by one JSON document: sources feeding bronze
//! tables, flatten stages producing append-only silver tables, and merge
//! stages maintaining current-state silver tables. Every problem found here
//! is a fatal configuration error raised before any stage runs.

mod defaults;

use crate::core::QualityTier;
use crate::errors::{CyclestreamError, Result};
use crate::events::LoggingEventSink;
use crate::merge::MergeSpec;
use crate::observability::LogConfig;
use crate::pipeline::{FailureMode, PipelineBuilder, PipelineRunner, RetryConfig, RunMode, StageGraph};
use crate::schema::{SourceFormat, DEFAULT_SAMPLE_SIZE};
use crate::source::{
    FileNamePatternExtractor, LocalDirectoryWatcher, OriginExtractor, SourceWatcher,
    DEFAULT_ORIGIN_PATTERN,
};
use crate::stages::{
    BatchLimits, FlattenStage, IngestStage, MergeStage, Stage, DEFAULT_MAX_ROWS_PER_BATCH,
    DEFAULT_MAX_UNITS_PER_BATCH,
};
use crate::storage::{FileTableStore, InMemoryTableStore, TableMetadata, TableStore};
use crate::transform::FlattenSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_units() -> usize {
    DEFAULT_MAX_UNITS_PER_BATCH
}

fn default_max_rows() -> usize {
    DEFAULT_MAX_ROWS_PER_BATCH
}

fn default_source_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_suffix() -> String {
    ".json".to_string()
}

fn default_sample_size() -> usize {
    DEFAULT_SAMPLE_SIZE
}

fn default_origin_pattern() -> String {
    DEFAULT_ORIGIN_PATTERN.to_string()
}

fn default_origin_group() -> String {
    "id".to_string()
}

/// Whether the runner drains once or keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One pass over all pending input.
    #[default]
    Batch,
    /// Passes repeated every `poll_interval_ms` until cancelled.
    Streaming,
}

/// Where tables, watermarks and schemas are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process memory; lost on exit.
    #[default]
    Memory,
    /// A JSON snapshot file replaced atomically on every commit.
    File {
        /// Snapshot path.
        path: PathBuf,
    },
}

/// How a source derives an origin identifier from unit names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OriginConfig {
    /// No origin column.
    #[default]
    None,
    /// A named regex capture group over the file name.
    FileNamePattern {
        /// Regex applied to the file name.
        #[serde(default = "default_origin_pattern")]
        pattern: String,
        /// Capture group holding the identifier.
        #[serde(default = "default_origin_group")]
        group: String,
        /// Column receiving the identifier.
        column: String,
    },
}

impl OriginConfig {
    fn extractor(&self) -> Result<Option<Arc<dyn OriginExtractor>>> {
        match self {
            Self::None => Ok(None),
            Self::FileNamePattern {
                pattern,
                group,
                column,
            } => Ok(Some(Arc::new(FileNamePatternExtractor::new(
                pattern,
                group.as_str(),
                column.as_str(),
            )?))),
        }
    }
}

/// A raw source and the bronze table its ingest stage writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stage name.
    pub name: String,
    /// Location, relative to `source_root` unless absolute.
    pub location: String,
    /// Document layout within a unit.
    #[serde(default)]
    pub format: SourceFormat,
    /// File suffix of units.
    #[serde(default = "default_suffix")]
    pub file_suffix: String,
    /// Units sampled for schema inference.
    #[serde(default = "default_sample_size")]
    pub schema_sample_size: usize,
    /// Origin identifier extraction.
    #[serde(default)]
    pub origin: OriginConfig,
    /// Payload field (unix seconds) for `_partition_date`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_timestamp_field: Option<String>,
    /// Bronze table name.
    pub output_table: String,
    /// Declared partition keys.
    #[serde(default)]
    pub partition_keys: Vec<String>,
}

/// A flatten stage writing an append-only silver table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlattenConfig {
    /// Stage name.
    pub name: String,
    /// Stage read from.
    pub upstream: String,
    /// Silver table name.
    pub output_table: String,
    /// The transform.
    #[serde(flatten)]
    pub spec: FlattenSpec,
    /// Declared partition keys.
    #[serde(default)]
    pub partition_keys: Vec<String>,
}

/// A merge stage maintaining a current-state silver table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Stage name.
    pub name: String,
    /// Stage read from.
    pub upstream: String,
    /// Current-state table name.
    pub output_table: String,
    /// Entity key column.
    pub key: String,
    /// Ordering column.
    pub sequence: String,
    /// Optional flatten applied to upstream rows before merging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<FlattenSpec>,
}

/// A complete pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name.
    pub name: String,
    /// Batch or streaming.
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Pause between streaming passes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Units per ingest commit.
    #[serde(default = "default_max_units")]
    pub max_units_per_batch: usize,
    /// Upstream rows per downstream commit.
    #[serde(default = "default_max_rows")]
    pub max_rows_per_batch: usize,
    /// Failure handling within a pass.
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Retry policy for transient I/O.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Table store.
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
    /// Directory relative source locations resolve against.
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,
    /// Ingest stages.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Flatten stages.
    #[serde(default)]
    pub flatten: Vec<FlattenConfig>,
    /// Merge stages.
    #[serde(default)]
    pub merge: Vec<MergeConfig>,
}

impl PipelineConfig {
    /// Parses a configuration document.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for malformed JSON or missing fields.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| CyclestreamError::Configuration(format!("invalid pipeline config: {e}")))
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read, `Configuration` if it does not parse.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Returns the run mode.
    #[must_use]
    pub fn run_mode(&self) -> RunMode {
        match self.mode {
            ExecutionMode::Batch => RunMode::Batch,
            ExecutionMode::Streaming => RunMode::Streaming {
                poll_interval: Duration::from_millis(self.poll_interval_ms),
            },
        }
    }

    /// Returns the micro-batch bounds.
    #[must_use]
    pub fn limits(&self) -> BatchLimits {
        BatchLimits {
            max_units: self.max_units_per_batch,
            max_rows: self.max_rows_per_batch,
        }
    }

    /// Checks the configuration and the stage graph it describes.
    ///
    /// # Errors
    ///
    /// Returns the first problem found; nothing has run at that point.
    pub fn validate(&self) -> Result<()> {
        self.check_settings()?;
        self.build_graph().map(|_| ())
    }

    /// Builds the stage graph, reading sources from local directories.
    ///
    /// # Errors
    ///
    /// Returns a configuration or validation error.
    pub fn build_graph(&self) -> Result<StageGraph> {
        self.graph_with(|source| -> Arc<dyn SourceWatcher> {
            Arc::new(LocalDirectoryWatcher::new(&self.source_root).with_suffix(&source.file_suffix))
        })
    }

    /// Builds the stage graph with one watcher shared by every source.
    ///
    /// # Errors
    ///
    /// Returns a configuration or validation error.
    pub fn build_graph_with_watcher(&self, watcher: Arc<dyn SourceWatcher>) -> Result<StageGraph> {
        self.graph_with(|_| Arc::clone(&watcher))
    }

    /// Opens the configured table store.
    ///
    /// # Errors
    ///
    /// Fails if a file store snapshot exists but cannot be read.
    pub async fn open_store(&self) -> Result<Arc<dyn TableStore>> {
        Ok(match &self.store {
            StoreConfig::Memory => Arc::new(InMemoryTableStore::new()),
            StoreConfig::File { path } => Arc::new(FileTableStore::open(path.clone()).await?),
        })
    }

    /// Applies retry, limits and failure mode to a runner over `graph`.
    #[must_use]
    pub fn configure_runner(&self, graph: StageGraph, store: Arc<dyn TableStore>) -> PipelineRunner {
        PipelineRunner::new(graph, store)
            .with_retry(self.retry.clone())
            .with_limits(self.limits())
            .with_failure_mode(self.failure_mode)
    }

    /// Validates, opens the store, and returns a ready runner logging its events.
    ///
    /// # Errors
    ///
    /// Returns configuration errors or store open failures.
    pub async fn build_runner(&self) -> Result<PipelineRunner> {
        self.check_settings()?;
        let graph = self.build_graph()?;
        let store = self.open_store().await?;
        info!(
            pipeline = %self.name,
            stages = graph.stage_count(),
            mode = ?self.mode,
            "Pipeline configured"
        );
        Ok(self
            .configure_runner(graph, store)
            .with_event_sink(Arc::new(LoggingEventSink::default())))
    }

    fn check_settings(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("pipeline name cannot be empty"));
        }
        if self.max_units_per_batch == 0 || self.max_rows_per_batch == 0 {
            return Err(invalid("batch limits must be greater than zero"));
        }
        if self.mode == ExecutionMode::Streaming && self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be greater than zero in streaming mode"));
        }
        for source in &self.sources {
            if source.location.trim().is_empty() {
                return Err(invalid(format!("source '{}' has no location", source.name)));
            }
            if source.schema_sample_size == 0 {
                return Err(invalid(format!(
                    "source '{}' needs a schema sample size above zero",
                    source.name
                )));
            }
        }
        Ok(())
    }

    fn graph_with<W>(&self, watcher_for: W) -> Result<StageGraph>
    where
        W: Fn(&SourceConfig) -> Arc<dyn SourceWatcher>,
    {
        let mut stages: Vec<Arc<dyn Stage>> = Vec::new();

        for source in &self.sources {
            let table = TableMetadata::append_only(&source.output_table, QualityTier::Bronze)
                .with_partition_keys(source.partition_keys.clone());
            let mut builder =
                IngestStage::builder(&source.name, &source.location, watcher_for(source), table)
                    .format(source.format)
                    .sample_size(source.schema_sample_size);
            if let Some(extractor) = source.origin.extractor()? {
                builder = builder.origin(extractor);
            }
            if let Some(field) = &source.partition_timestamp_field {
                builder = builder.partition_timestamp_field(field);
            }
            stages.push(Arc::new(builder.build()));
        }

        for flatten in &self.flatten {
            let table = TableMetadata::append_only(&flatten.output_table, QualityTier::Silver)
                .with_partition_keys(flatten.partition_keys.clone());
            stages.push(Arc::new(FlattenStage::new(
                &flatten.name,
                &flatten.upstream,
                flatten.spec.clone(),
                table,
            )));
        }

        for merge in &self.merge {
            let mut stage = MergeStage::new(
                &merge.name,
                &merge.upstream,
                &merge.output_table,
                MergeSpec::new(&merge.key, &merge.sequence),
            );
            if let Some(shape) = &merge.shape {
                stage = stage.with_shape(shape.clone());
            }
            stages.push(Arc::new(stage));
        }

        let graph = PipelineBuilder::new(&self.name).stages(stages)?.build()?;
        Ok(graph)
    }
}

fn invalid(message: impl Into<String>) -> CyclestreamError {
    CyclestreamError::Configuration(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"{
        "name": "weather",
        "sources": [
            {"name": "weather_bronze", "location": "weather", "output_table": "bronze_weather"}
        ],
        "flatten": [
            {
                "name": "weather_silver",
                "upstream": "weather_bronze",
                "output_table": "silver_weather",
                "projections": [{"source": "main.temp"}],
                "constraints": [
                    {"name": "valid_temp", "predicate": {"type": "not_null", "column": "main_temp"}, "policy": "drop_row"}
                ]
            }
        ]
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config = PipelineConfig::from_json_str(MINIMAL).unwrap();

        assert_eq!(config.mode, ExecutionMode::Batch);
        assert_eq!(config.poll_interval_ms, 5_000);
        assert_eq!(config.limits(), BatchLimits::default());
        assert_eq!(config.failure_mode, FailureMode::BestEffort);
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.sources[0].file_suffix, ".json");
        assert_eq!(config.sources[0].schema_sample_size, DEFAULT_SAMPLE_SIZE);
        assert_eq!(config.sources[0].origin, OriginConfig::None);
        assert_eq!(config.flatten[0].spec.projections.len(), 1);
        assert_eq!(config.flatten[0].spec.constraints[0].name, "valid_temp");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_streaming_mode() {
        let mut config = PipelineConfig::from_json_str(MINIMAL).unwrap();
        config.mode = ExecutionMode::Streaming;
        config.poll_interval_ms = 250;

        assert_eq!(
            config.run_mode(),
            RunMode::Streaming {
                poll_interval: Duration::from_millis(250)
            }
        );

        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_configuration_error() {
        let err = PipelineConfig::from_json_str("{\"sources\": []}").unwrap_err();
        assert_eq!(err.error_code(), "configuration");
    }

    #[test]
    fn test_store_and_origin_variants() {
        let store: StoreConfig =
            serde_json::from_str(r#"{"type": "file", "path": "/tmp/cs.json"}"#).unwrap();
        assert_eq!(store, StoreConfig::File { path: PathBuf::from("/tmp/cs.json") });

        let origin: OriginConfig =
            serde_json::from_str(r#"{"type": "file_name_pattern", "column": "station_id"}"#).unwrap();
        assert_eq!(
            origin,
            OriginConfig::FileNamePattern {
                pattern: DEFAULT_ORIGIN_PATTERN.to_string(),
                group: "id".to_string(),
                column: "station_id".to_string(),
            }
        );
    }

    #[test]
    fn test_invalid_origin_regex_rejected() {
        let mut config = PipelineConfig::from_json_str(MINIMAL).unwrap();
        config.sources[0].origin = OriginConfig::FileNamePattern {
            pattern: "([".to_string(),
            group: "id".to_string(),
            column: "station_id".to_string(),
        };

        assert_eq!(config.validate().unwrap_err().error_code(), "configuration");
    }

    #[test]
    fn test_unknown_upstream_rejected() {
        let mut config = PipelineConfig::from_json_str(MINIMAL).unwrap();
        config.flatten[0].upstream = "nowhere".to_string();

        let err = config.validate().unwrap_err();
        assert_eq!(err.error_code(), "validation");
        assert!(err.to_string().contains("unknown stage 'nowhere'"));
    }

    #[test]
    fn test_unresolvable_merge_key_rejected() {
        let mut config = PipelineConfig::from_json_str(MINIMAL).unwrap();
        config.merge.push(MergeConfig {
            name: "weather_current".into(),
            upstream: "weather_silver".into(),
            output_table: "current_weather".into(),
            key: "station_id".into(),
            sequence: "dt".into(),
            shape: None,
        });

        let err = config.validate().unwrap_err();
        assert!(err.is_fatal_configuration());
        assert!(err.to_string().contains("station_id"));
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let mut config = PipelineConfig::from_json_str(MINIMAL).unwrap();
        let copy = config.sources[0].clone();
        config.sources.push(copy);

        assert!(config.validate().unwrap_err().is_fatal_configuration());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let config = PipelineConfig::bike_share_defaults("landing");
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
