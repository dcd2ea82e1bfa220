//! Core domain model types for cyclestream.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Stage status, stage kind and quality tier enums
//! - The row model flowing between stages (source records, flat rows,
//!   entity snapshots and current-state rows)
//! - Stage output type with factory methods

mod output;
#[cfg(test)]
mod output_tests;
mod records;
mod status;

pub use output::{BatchMetrics, StageOutput};
pub use records::{
    CurrentStateRow, EntitySnapshot, FlatRow, Row, SequenceValue, SourceRecord, columns,
};
pub use status::{QualityTier, StageKind, StageStatus, TableKind};
