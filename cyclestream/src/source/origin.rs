//! Origin identifier extraction from unit names.

use crate::errors::{CyclestreamError, Result};
use regex::Regex;
use std::fmt::Debug;

/// Matches `<prefix>_<identifier>.json`.
pub const DEFAULT_ORIGIN_PATTERN: &str = r"^(?P<prefix>[^_]+)_(?P<id>.+)\.json$";

/// Derives an entity identifier from a unit's file name.
pub trait OriginExtractor: Send + Sync + Debug {
    /// The column the identifier is written to.
    fn column(&self) -> &str;

    /// Extracts the identifier, or `None` when the name does not match.
    fn extract(&self, file_name: &str) -> Option<String>;
}

/// Regex-based extractor reading one named capture group.
#[derive(Debug, Clone)]
pub struct FileNamePatternExtractor {
    pattern: Regex,
    group: String,
    column: String,
}

impl FileNamePatternExtractor {
    /// Compiles an extractor.
    ///
    /// # Errors
    ///
    /// Returns `CyclestreamError::Configuration` if the pattern is invalid or
    /// lacks the named group.
    pub fn new(pattern: &str, group: impl Into<String>, column: impl Into<String>) -> Result<Self> {
        let group = group.into();
        let pattern = Regex::new(pattern).map_err(|e| {
            CyclestreamError::Configuration(format!("invalid origin pattern '{pattern}': {e}"))
        })?;
        if !pattern.capture_names().flatten().any(|name| name == group) {
            return Err(CyclestreamError::Configuration(format!(
                "origin pattern has no capture group named '{group}'"
            )));
        }
        Ok(Self {
            pattern,
            group,
            column: column.into(),
        })
    }

    /// The `<prefix>_<identifier>.json` extractor writing to `column`.
    ///
    /// # Errors
    ///
    /// Never fails for the built-in pattern; the signature mirrors `new`.
    pub fn default_for(column: impl Into<String>) -> Result<Self> {
        Self::new(DEFAULT_ORIGIN_PATTERN, "id", column)
    }
}

impl OriginExtractor for FileNamePatternExtractor {
    fn column(&self) -> &str {
        &self.column
    }

    fn extract(&self, file_name: &str) -> Option<String> {
        self.pattern
            .captures(file_name)
            .and_then(|caps| caps.name(&self.group))
            .map(|m| m.as_str().to_string())
    }
}
