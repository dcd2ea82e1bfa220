//! In-memory source used by tests and embedded pipelines.

use super::{LateUnitTracker, SourceWatcher, Unit};
use crate::errors::{CyclestreamError, Result};
use crate::storage::Position;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct StoredUnit {
    bytes: Vec<u8>,
    modified: DateTime<Utc>,
}

/// A source whose units live in memory, keyed by location and path.
#[derive(Debug, Default)]
pub struct InMemorySource {
    units: RwLock<BTreeMap<String, BTreeMap<String, StoredUnit>>>,
    failing_listings: AtomicUsize,
    reads: AtomicUsize,
    late: LateUnitTracker,
}

impl InMemorySource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a unit with a modification time derived from insertion order.
    pub fn put(&self, location: &str, path: &str, bytes: impl Into<Vec<u8>>) {
        let count = self.units.read().values().map(BTreeMap::len).sum::<usize>();
        let modified = Utc
            .timestamp_opt(1_700_000_000 + count as i64, 0)
            .single()
            .unwrap_or_default();
        self.put_at(location, path, bytes, modified);
    }

    /// Adds a unit with an explicit modification time.
    pub fn put_at(
        &self,
        location: &str,
        path: &str,
        bytes: impl Into<Vec<u8>>,
        modified: DateTime<Utc>,
    ) {
        self.units
            .write()
            .entry(location.to_string())
            .or_default()
            .insert(
                path.to_string(),
                StoredUnit {
                    bytes: bytes.into(),
                    modified,
                },
            );
    }

    /// Makes the next `count` listings fail with a transient error.
    pub fn fail_next_listings(&self, count: usize) {
        self.failing_listings.store(count, Ordering::SeqCst);
    }

    /// Returns how many unit reads have been served.
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Returns how many units were listed behind the watermark after the
    /// first listing of their location.
    #[must_use]
    pub fn late_unit_count(&self) -> usize {
        self.late.late_count()
    }
}

#[async_trait]
impl SourceWatcher for InMemorySource {
    async fn list_new_units(&self, location: &str, watermark: &Position) -> Result<Vec<Unit>> {
        let remaining = self.failing_listings.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_listings.store(remaining - 1, Ordering::SeqCst);
            return Err(CyclestreamError::transient(location, "listing unavailable"));
        }

        let units = self
            .units
            .read()
            .get(location)
            .map(|files| {
                files
                    .iter()
                    .map(|(path, stored)| {
                        Unit::new(path.clone(), stored.bytes.len() as u64, stored.modified)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(self.late.order_new(location, units, watermark))
    }

    async fn read_unit(&self, location: &str, unit: &Unit) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.units
            .read()
            .get(location)
            .and_then(|files| files.get(&unit.path))
            .map(|stored| stored.bytes.clone())
            .ok_or_else(|| CyclestreamError::transient(&unit.path, "unit vanished"))
    }
}
