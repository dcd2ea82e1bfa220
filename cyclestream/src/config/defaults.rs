//! The bike-share and weather pipeline as a ready-made configuration.

use super::{
    ExecutionMode, FlattenConfig, MergeConfig, OriginConfig, PipelineConfig, SourceConfig,
    StoreConfig,
};
use crate::core::columns;
use crate::observability::LogConfig;
use crate::pipeline::{FailureMode, RetryConfig};
use crate::quality::{CompareOp, QualityConstraint, ViolationPolicy};
use crate::schema::{SourceFormat, DEFAULT_SAMPLE_SIZE};
use crate::source::DEFAULT_ORIGIN_PATTERN;
use crate::stages::{DEFAULT_MAX_ROWS_PER_BATCH, DEFAULT_MAX_UNITS_PER_BATCH};
use crate::transform::{DerivedColumn, DerivedExpr, FlattenSpec, Projection};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Stale station reports are flagged in `_violations`, not dropped.
const MAX_REPORT_AGE_SECONDS: f64 = 86_400.0;

const WEATHER_FIELDS: [&str; 14] = [
    "station_id",
    "dt",
    "name",
    "main.temp",
    "main.feels_like",
    "main.temp_min",
    "main.temp_max",
    "main.pressure",
    "main.humidity",
    "wind.speed",
    "wind.deg",
    "clouds.all",
    "rain.1h",
    "snow.1h",
];

impl PipelineConfig {
    /// Six tables over `root`: raw and cleaned station status, raw and
    /// cleaned weather, raw and current station information.
    ///
    /// Sources are read from `station_status/`, `station_information/` and
    /// `weather/` under `root`. Weather files are named `<prefix>_<station>.json`.
    ///
    /// Units are ingested in path order, so file names must sort in arrival
    /// order. Use a timestamp prefix such as `20240101T1200_S17.json`; a file
    /// whose name sorts at or below the committed watermark is skipped and
    /// only reported as a warning.
    #[must_use]
    pub fn bike_share_defaults(root: impl Into<PathBuf>) -> Self {
        Self {
            name: "bike_share".to_string(),
            mode: ExecutionMode::Batch,
            poll_interval_ms: 5_000,
            max_units_per_batch: DEFAULT_MAX_UNITS_PER_BATCH,
            max_rows_per_batch: DEFAULT_MAX_ROWS_PER_BATCH,
            failure_mode: FailureMode::default(),
            retry: RetryConfig::default(),
            store: StoreConfig::Memory,
            log: LogConfig::default(),
            source_root: root.into(),
            sources: vec![
                bronze("station_status_bronze", "station_status", "bronze_station_status"),
                bronze(
                    "station_information_bronze",
                    "station_information",
                    "bronze_station_information",
                ),
                SourceConfig {
                    origin: OriginConfig::FileNamePattern {
                        pattern: DEFAULT_ORIGIN_PATTERN.to_string(),
                        group: "id".to_string(),
                        column: "station_id".to_string(),
                    },
                    partition_timestamp_field: Some("dt".to_string()),
                    partition_keys: vec![columns::PARTITION_DATE.to_string()],
                    ..bronze("weather_bronze", "weather", "bronze_weather")
                },
            ],
            flatten: vec![station_status_silver(), weather_silver()],
            merge: vec![MergeConfig {
                name: "station_information_current".to_string(),
                upstream: "station_information_bronze".to_string(),
                output_table: "silver_station_information".to_string(),
                key: "station_id".to_string(),
                sequence: "last_updated".to_string(),
                shape: Some(FlattenSpec {
                    explode: Some("data.stations".to_string()),
                    constraints: vec![valid_station_id()],
                    ..FlattenSpec::default()
                }),
            }],
        }
    }
}

fn bronze(name: &str, location: &str, table: &str) -> SourceConfig {
    SourceConfig {
        name: name.to_string(),
        location: location.to_string(),
        format: SourceFormat::WholeFile,
        file_suffix: ".json".to_string(),
        schema_sample_size: DEFAULT_SAMPLE_SIZE,
        origin: OriginConfig::None,
        partition_timestamp_field: None,
        output_table: table.to_string(),
        partition_keys: Vec::new(),
    }
}

fn valid_station_id() -> QualityConstraint {
    QualityConstraint::not_null_drop("valid_station_id", "station_id")
}

fn station_status_silver() -> FlattenConfig {
    FlattenConfig {
        name: "station_status_silver".to_string(),
        upstream: "station_status_bronze".to_string(),
        output_table: "silver_station_status".to_string(),
        spec: FlattenSpec {
            explode: Some("data.stations".to_string()),
            derived: vec![DerivedColumn::new(
                "age_seconds",
                DerivedExpr::Difference {
                    left: "last_updated".to_string(),
                    right: "last_reported".to_string(),
                },
            )],
            constraints: vec![
                valid_station_id(),
                QualityConstraint::compare(
                    "over_24hr_old_data",
                    "age_seconds",
                    CompareOp::Lt,
                    MAX_REPORT_AGE_SECONDS,
                    ViolationPolicy::FlagOnly,
                ),
            ],
            annotate_violations: true,
            ..FlattenSpec::default()
        },
        partition_keys: Vec::new(),
    }
}

fn weather_silver() -> FlattenConfig {
    let mut projections: Vec<Projection> =
        WEATHER_FIELDS.iter().copied().map(Projection::path).collect();
    projections.push(Projection::renamed("sys.country", "country"));

    let defaults: BTreeMap<String, serde_json::Value> = [("rain_1h", json!(0)), ("snow_1h", json!(0))]
        .into_iter()
        .map(|(column, value)| (column.to_string(), value))
        .collect();

    let dt = || "dt".to_string();
    FlattenConfig {
        name: "weather_silver".to_string(),
        upstream: "weather_bronze".to_string(),
        output_table: "silver_weather".to_string(),
        spec: FlattenSpec {
            projections,
            defaults,
            derived: vec![
                DerivedColumn::new("dt_ts", DerivedExpr::Timestamp { column: dt() }),
                DerivedColumn::new("dt_date", DerivedExpr::Date { column: dt() }),
                DerivedColumn::new("dt_hour", DerivedExpr::HourBucket { column: dt() }),
            ],
            constraints: vec![valid_station_id()],
            ..FlattenSpec::default()
        },
        partition_keys: vec!["dt_date".to_string()],
    }
}
