//! Watcher over a local directory tree.

use super::{LateUnitTracker, SourceWatcher, Unit};
use crate::errors::{CyclestreamError, Result};
use crate::storage::Position;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lists files with a given suffix under a directory, recursively.
///
/// Entries whose names are not valid UTF-8 are skipped with a warning, since
/// they cannot be carried as a unit path.
#[derive(Debug, Clone)]
pub struct LocalDirectoryWatcher {
    root: PathBuf,
    suffix: String,
    late: Arc<LateUnitTracker>,
}

impl LocalDirectoryWatcher {
    /// Creates a watcher; locations are resolved relative to `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            suffix: ".json".to_string(),
            late: Arc::default(),
        }
    }

    /// Sets the file suffix to match.
    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    fn resolve(&self, location: &str) -> PathBuf {
        let path = Path::new(location);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    async fn walk(&self, base: &Path) -> std::io::Result<Vec<Unit>> {
        let mut units = Vec::new();
        let mut pending = vec![base.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    warn!(path = %path.display(), "Skipping entry with a non UTF-8 name");
                    continue;
                };
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                // Writers stage partial files with a leading dot or underscore.
                if !name.ends_with(&self.suffix) || name.starts_with('.') || name.starts_with('_') {
                    continue;
                }
                let metadata = entry.metadata().await?;
                let modified: DateTime<Utc> = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_default();
                // Non UTF-8 directories were never descended into, so this only
                // fails if the path escaped the base.
                let Some(relative) = path
                    .strip_prefix(base)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_str())
                    .collect::<Option<Vec<_>>>()
                    .map(|parts| parts.join("/"))
                else {
                    continue;
                };
                units.push(Unit::new(relative, metadata.len(), modified));
            }
        }

        Ok(units)
    }
}

#[async_trait]
impl SourceWatcher for LocalDirectoryWatcher {
    async fn list_new_units(&self, location: &str, watermark: &Position) -> Result<Vec<Unit>> {
        let base = self.resolve(location);
        let units = self
            .walk(&base)
            .await
            .map_err(|e| CyclestreamError::transient(base.display().to_string(), e))?;
        let units = self.late.order_new(location, units, watermark);
        debug!(location = %location, new_units = units.len(), "Listed source units");
        Ok(units)
    }

    async fn read_unit(&self, location: &str, unit: &Unit) -> Result<Vec<u8>> {
        let path = self.resolve(location).join(&unit.path);
        tokio::fs::read(&path)
            .await
            .map_err(|e| CyclestreamError::transient(path.display().to_string(), e))
    }
}
