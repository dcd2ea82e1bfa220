//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specifications and a validating builder
//! - The stage graph
//! - The incremental runner (batch and streaming)
//! - Retry and failure tolerance policies

mod builder;
mod dag;
mod failure_tolerance;
mod retry;
mod runner;
mod spec;


pub use builder::PipelineBuilder;
pub use dag::StageGraph;
pub use failure_tolerance::{FailureCollector, FailureMode, FailureRecord};
pub use retry::{with_retry, BackoffStrategy, JitterStrategy, RetryConfig, RetryState};
pub use runner::{PipelineRunner, RunMode, RunReport, StageReport};
pub use spec::StageSpec;
