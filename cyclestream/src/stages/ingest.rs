//! Bronze ingest stage.

use super::{PreparedBatch, Stage, StageContext};
use crate::core::{columns, BatchMetrics, Row, SourceRecord, StageKind};
use crate::errors::{CyclestreamError, Result};
use crate::schema::{
    infer_schema, split_documents, Decoder, RawDocument, SourceFormat, DEFAULT_SAMPLE_SIZE,
};
use crate::source::{OriginExtractor, SourceWatcher, Unit};
use crate::storage::{CommitOutput, Position, TableMetadata, TableStore};
use crate::utils::{timestamp_from_value, to_date_string};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Decodes new source units into a bronze table.
///
/// The schema is inferred once per location from up to `sample_size` units
/// and cached in the table store, so every decode of a location, including
/// replays after a restart, uses the same columns.
#[derive(Debug)]
pub struct IngestStage {
    name: String,
    location: String,
    watcher: Arc<dyn SourceWatcher>,
    format: SourceFormat,
    sample_size: usize,
    origin: Option<Arc<dyn OriginExtractor>>,
    partition_timestamp_field: Option<String>,
    table: TableMetadata,
    decoder: OnceCell<Decoder>,
}

/// Builder for [`IngestStage`].
#[derive(Debug)]
pub struct IngestStageBuilder {
    name: String,
    location: String,
    watcher: Arc<dyn SourceWatcher>,
    table: TableMetadata,
    format: SourceFormat,
    sample_size: usize,
    origin: Option<Arc<dyn OriginExtractor>>,
    partition_timestamp_field: Option<String>,
}

impl IngestStageBuilder {
    /// Sets the unit layout.
    #[must_use]
    pub fn format(mut self, format: SourceFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the number of units sampled for schema inference.
    #[must_use]
    pub fn sample_size(mut self, units: usize) -> Self {
        self.sample_size = units.max(1);
        self
    }

    /// Extracts an origin column from each unit's file name.
    #[must_use]
    pub fn origin(mut self, extractor: Arc<dyn OriginExtractor>) -> Self {
        self.origin = Some(extractor);
        self
    }

    /// Derives `_partition_date` from a payload timestamp field.
    #[must_use]
    pub fn partition_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.partition_timestamp_field = Some(field.into());
        self
    }

    /// Builds the stage.
    #[must_use]
    pub fn build(self) -> IngestStage {
        IngestStage {
            name: self.name,
            location: self.location,
            watcher: self.watcher,
            format: self.format,
            sample_size: self.sample_size,
            origin: self.origin,
            partition_timestamp_field: self.partition_timestamp_field,
            table: self.table,
            decoder: OnceCell::new(),
        }
    }
}

fn resolve_path<'a>(row: &'a Row, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = row.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

impl IngestStage {
    /// Starts building an ingest stage.
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        location: impl Into<String>,
        watcher: Arc<dyn SourceWatcher>,
        table: TableMetadata,
    ) -> IngestStageBuilder {
        IngestStageBuilder {
            name: name.into(),
            location: location.into(),
            watcher,
            table,
            format: SourceFormat::default(),
            sample_size: DEFAULT_SAMPLE_SIZE,
            origin: None,
            partition_timestamp_field: None,
        }
    }

    /// Returns the source location.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    async fn decoder(&self, store: &dyn TableStore) -> Result<&Decoder> {
        self.decoder
            .get_or_try_init(|| async {
                if let Some(schema) = store.schema(&self.location).await? {
                    return Ok(Decoder::new(schema));
                }
                let sample = self.watcher.list_new_units(&self.location, &Position::Start).await?;
                let mut documents = Vec::new();
                for unit in sample.iter().take(self.sample_size) {
                    let bytes = self.watcher.read_unit(&self.location, unit).await?;
                    documents.extend(split_documents(&bytes, self.format).into_iter().filter_map(
                        |doc| match doc {
                            RawDocument::Parsed(value) => Some(value),
                            RawDocument::Corrupt(_) => None,
                        },
                    ));
                }
                let schema = infer_schema(&documents);
                info!(
                    location = %self.location,
                    units = sample.len().min(self.sample_size),
                    columns = schema.len(),
                    "Inferred schema"
                );
                let stored = store.save_schema_if_absent(&self.location, schema).await?;
                Ok::<_, CyclestreamError>(Decoder::new(stored))
            })
            .await
    }

    fn record(&self, unit: &Unit, mut fields: Row) -> SourceRecord {
        if let Some(origin) = &self.origin {
            let value = origin
                .extract(unit.file_name())
                .map_or(Value::Null, Value::String);
            fields.insert(origin.column().to_string(), value);
        }
        let partition_date = self
            .partition_timestamp_field
            .as_deref()
            .and_then(|field| resolve_path(&fields, field))
            .and_then(|value| timestamp_from_value(value).ok())
            .map(|ts| Value::String(to_date_string(&ts)));

        let record = SourceRecord::new(unit.path.clone(), unit.modified, fields);
        match partition_date {
            Some(date) => record.with_column(columns::PARTITION_DATE, date),
            None if self.partition_timestamp_field.is_some() => {
                record.with_column(columns::PARTITION_DATE, Value::Null)
            }
            None => record,
        }
    }
}

#[async_trait]
impl Stage for IngestStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Ingest
    }

    fn upstream(&self) -> Option<&str> {
        None
    }

    fn output_table(&self) -> &TableMetadata {
        &self.table
    }

    async fn prepare(&self, ctx: &StageContext) -> Result<Option<PreparedBatch>> {
        let mut units = self
            .watcher
            .list_new_units(&self.location, &ctx.watermark.position)
            .await?;
        if units.is_empty() {
            return Ok(None);
        }
        units.truncate(ctx.limits.max_units);

        let decoder = self.decoder(ctx.store.as_ref()).await?;
        let mut metrics = BatchMetrics::default();
        let mut rows = Vec::new();

        for unit in &units {
            ctx.check_cancelled()?;
            let bytes = self.watcher.read_unit(&self.location, unit).await?;
            for document in split_documents(&bytes, self.format) {
                let decoded = decoder.decode(&document);
                metrics.rows_rescued += u64::from(decoded.rescued);
                metrics.corrupt_records += u64::from(decoded.corrupt);
                rows.push(self.record(unit, decoded.fields).into_row());
            }
            metrics.units_read += 1;
        }

        metrics.rows_in = rows.len() as u64;
        metrics.rows_out = rows.len() as u64;
        let last = units
            .last()
            .map_or_else(String::new, |unit| unit.order_key().to_string());
        debug!(
            stage = %self.name,
            units = metrics.units_read,
            rows = metrics.rows_out,
            last_unit = %last,
            "Decoded units"
        );

        Ok(Some(PreparedBatch {
            position: Position::Unit(last),
            output: CommitOutput::Append(rows),
            metrics,
        }))
    }
}
