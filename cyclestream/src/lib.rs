//! # Cyclestream
//!
//! An incremental bronze/silver pipeline engine for bike-share station feeds
//! and per-station weather observations.
//!
//! Raw JSON files land in source locations. Ingest stages decode them into
//! append-only bronze tables, flatten stages turn bronze records into clean
//! silver rows, and merge stages keep one current row per entity. Every
//! stage tracks a watermark, so each run only reads input that arrived
//! since the last commit:
//!
//! - **Schema inference**: a bounded sample decides column types; fields the
//!   schema does not know are rescued instead of dropped
//! - **Flattening**: array explode, dotted projections, defaults and derived
//!   columns as plain data
//! - **Quality constraints**: drop or flag rows per declared policy
//! - **Current-state merge**: last writer wins by sequence, order independent
//! - **Atomic commits**: output and watermark advance together or not at all
//! - **Batch and streaming**: the same pass, run once or on a poll interval
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cyclestream::prelude::*;
//!
//! let config = PipelineConfig::bike_share_defaults("landing");
//! let runner = config.build_runner().await?;
//! let report = runner.run_once(&CancellationToken::new()).await?;
//! println!("{} stages committed", report.committed_stages());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod merge;
pub mod observability;
pub mod pipeline;
pub mod quality;
pub mod schema;
pub mod source;
pub mod stages;
pub mod storage;
pub mod transform;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        ExecutionMode, FlattenConfig, MergeConfig, OriginConfig, PipelineConfig, SourceConfig,
        StoreConfig,
    };
    pub use crate::core::{
        BatchMetrics, FlatRow, QualityTier, Row, SourceRecord, StageKind, StageOutput,
        StageStatus,
    };
    pub use crate::errors::{
        ContractErrorInfo, CycleDetectedError, CyclestreamError, PipelineValidationError, Result,
    };
    pub use crate::events::{
        CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent,
    };
    pub use crate::merge::MergeSpec;
    pub use crate::observability::{init_tracing, LogConfig};
    pub use crate::pipeline::{
        FailureMode, PipelineBuilder, PipelineRunner, RetryConfig, RunMode, RunReport,
        StageGraph, StageSpec,
    };
    pub use crate::quality::{CompareOp, Predicate, QualityConstraint, ViolationPolicy};
    pub use crate::source::{InMemorySource, LocalDirectoryWatcher, SourceWatcher};
    pub use crate::stages::{FlattenStage, IngestStage, MergeStage, Stage};
    pub use crate::storage::{FileTableStore, InMemoryTableStore, TableMetadata, TableStore};
    pub use crate::transform::{DerivedColumn, DerivedExpr, FlattenSpec, Projection};
}
