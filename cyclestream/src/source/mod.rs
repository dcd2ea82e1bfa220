//! Source discovery.
//!
//! A source location is a logical directory of JSON units. Watchers list the
//! units whose order key is strictly greater than a watermark, in a stable
//! lexicographic order, and read their bytes. Listing never advances the
//! watermark; that only happens when the runner commits.
//!
//! Because the order key is the path, a unit that lands with a name at or
//! below the watermark is never ingested. Watchers log a warning for each
//! such late unit the first time they see it.

mod local;
mod memory;
mod origin;

pub use local::LocalDirectoryWatcher;
pub use memory::InMemorySource;
pub use origin::{FileNamePatternExtractor, OriginExtractor, DEFAULT_ORIGIN_PATTERN};

use crate::errors::Result;
use crate::storage::Position;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// An opaque handle to one input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Path relative to the source location, `/`-separated. Also the order key.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification token.
    pub modified: DateTime<Utc>,
}

impl Unit {
    /// Creates a new unit handle.
    #[must_use]
    pub fn new(path: impl Into<String>, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
        }
    }

    /// Returns the key units are ordered by.
    #[must_use]
    pub fn order_key(&self) -> &str {
        &self.path
    }

    /// Returns the final path segment.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if this unit sorts after the given watermark.
    #[must_use]
    pub fn is_after(&self, watermark: &Position) -> bool {
        match watermark {
            Position::Start => true,
            Position::Unit(key) => self.path.as_str() > key.as_str(),
            Position::Offset(_) => false,
        }
    }
}

/// Lists and reads units of a source location.
#[async_trait]
pub trait SourceWatcher: Send + Sync + Debug {
    /// Lists units strictly after `watermark`, sorted by order key.
    ///
    /// # Errors
    ///
    /// Returns `CyclestreamError::TransientIo` when the listing fails.
    async fn list_new_units(&self, location: &str, watermark: &Position) -> Result<Vec<Unit>>;

    /// Reads the full contents of a unit.
    ///
    /// # Errors
    ///
    /// Returns `CyclestreamError::TransientIo` when the read fails.
    async fn read_unit(&self, location: &str, unit: &Unit) -> Result<Vec<u8>>;
}

/// Sorts units by order key and keeps those after the watermark.
fn order_after(mut units: Vec<Unit>, watermark: &Position) -> Vec<Unit> {
    units.retain(|unit| unit.is_after(watermark));
    units.sort_by(|a, b| a.path.cmp(&b.path));
    units.dedup_by(|a, b| a.path == b.path);
    units
}

/// Remembers which unit paths each location has listed, so units that
/// appear behind the watermark can be reported once.
#[derive(Debug, Default)]
pub(crate) struct LateUnitTracker {
    known: Mutex<HashMap<String, HashSet<String>>>,
    late: AtomicUsize,
}

impl LateUnitTracker {
    /// Records a full listing and returns the units after the watermark.
    ///
    /// The first listing of a location is the baseline and never warns.
    pub(crate) fn order_new(
        &self,
        location: &str,
        units: Vec<Unit>,
        watermark: &Position,
    ) -> Vec<Unit> {
        {
            let mut known = self.known.lock();
            let baseline = !known.contains_key(location);
            let seen = known.entry(location.to_string()).or_default();
            for unit in &units {
                let first_sight = seen.insert(unit.path.clone());
                if first_sight && !baseline && !unit.is_after(watermark) {
                    self.late.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        location = %location,
                        unit = %unit.path,
                        watermark = ?watermark,
                        "Unit sorts at or below the watermark and will not be ingested"
                    );
                }
            }
        }
        order_after(units, watermark)
    }

    /// Returns how many late units have been reported.
    pub(crate) fn late_count(&self) -> usize {
        self.late.load(Ordering::Relaxed)
    }
}
