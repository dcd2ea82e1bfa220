//! Incremental pipeline runner.
//!
//! One pass runs every stage once. A stage keeps preparing and committing
//! micro-batches until it finds no new input, so a batch pass drains all
//! pending work. A stage starts once every stage it reads from has finished
//! its part of the pass; unrelated branches run concurrently.
//!
//! Output rows and the watermark are committed together by the store. A
//! stage that fails or is cancelled before its commit leaves its watermark
//! untouched, and the next pass re-reads exactly the same input.

use super::failure_tolerance::{FailureCollector, FailureMode, FailureRecord};
use super::retry::{with_retry, RetryConfig};
use super::{StageGraph, StageSpec};
use crate::cancellation::CancellationToken;
use crate::core::{BatchMetrics, StageKind, StageOutput, StageStatus};
use crate::errors::{CyclestreamError, Result};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::stages::{BatchLimits, StageContext};
use crate::storage::{Commit, Position, TableStore};
use crate::utils::{format_timestamp, generate_run_id};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long the runner keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Drain all pending input once, then stop.
    Batch,
    /// Repeat passes until cancelled, sleeping between them.
    Streaming {
        /// Pause between passes.
        poll_interval: Duration,
    },
}

/// Outcome of one stage within a run.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    /// Stage name.
    pub stage: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Output table.
    pub table: String,
    /// Status, metrics and watermark.
    #[serde(flatten)]
    pub output: StageOutput,
    /// Wall time spent in the stage.
    pub duration_ms: u64,
}

impl StageReport {
    fn new(spec: &StageSpec, output: StageOutput, started: Instant) -> Self {
        Self {
            stage: spec.name.clone(),
            kind: spec.kind,
            table: spec.output_table().to_string(),
            output,
            duration_ms: elapsed_ms(started),
        }
    }

    /// Returns the stage status.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        self.output.status
    }

    /// Returns the accumulated metrics.
    #[must_use]
    pub fn metrics(&self) -> &BatchMetrics {
        &self.output.metrics
    }

    fn absorb(&mut self, next: Self) {
        let mut metrics = self.output.metrics.clone();
        metrics.absorb(&next.output.metrics);
        let committed_before = self.output.status == StageStatus::Ok;
        let previous_watermark = self.output.watermark.take();

        self.output = next.output;
        self.output.metrics = metrics;
        if self.output.watermark.is_none() {
            self.output.watermark = previous_watermark;
        }
        // An idle pass after committed work keeps the stage reported as ok.
        if committed_before && self.output.status == StageStatus::Skip {
            self.output.status = StageStatus::Ok;
            self.output.skip_reason = None;
        }
        self.duration_ms += next.duration_ms;
    }
}

/// Summary of a run: one pass in batch mode, all passes in streaming mode.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier shared by every event of the run.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Number of passes summarised.
    pub passes: u64,
    /// When the run started.
    pub started_at: String,
    /// Wall time of the summarised passes.
    pub duration_ms: u64,
    /// Per-stage outcomes.
    pub stages: BTreeMap<String, StageReport>,
    /// Every stage failure, in the order recorded.
    pub failures: Vec<FailureRecord>,
}

impl RunReport {
    /// Returns a stage's report.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.get(name)
    }

    /// Returns true if no stage failed or was cancelled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.stages.values().all(|s| s.output.is_success())
    }

    /// Returns true if any stage stopped because of cancellation.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.stages
            .values()
            .any(|s| s.output.status == StageStatus::Cancel)
    }

    /// Returns the number of stages that committed at least one batch.
    #[must_use]
    pub fn committed_stages(&self) -> usize {
        self.stages
            .values()
            .filter(|s| s.output.metrics.batches_committed > 0)
            .count()
    }

    /// Returns metrics summed over every stage.
    #[must_use]
    pub fn total_metrics(&self) -> BatchMetrics {
        let mut total = BatchMetrics::default();
        for stage in self.stages.values() {
            total.absorb(&stage.output.metrics);
        }
        total
    }

    fn absorb(&mut self, next: Self) {
        self.passes = self.passes.max(next.passes);
        self.duration_ms += next.duration_ms;
        self.failures.extend(next.failures);
        for (name, report) in next.stages {
            match self.stages.get_mut(&name) {
                Some(existing) => existing.absorb(report),
                None => {
                    self.stages.insert(name, report);
                }
            }
        }
    }
}

/// Executes a [`StageGraph`] against a [`TableStore`].
#[derive(Debug)]
pub struct PipelineRunner {
    graph: Arc<StageGraph>,
    store: Arc<dyn TableStore>,
    events: Arc<dyn EventSink>,
    retry: RetryConfig,
    limits: BatchLimits,
    failure_mode: FailureMode,
    stage_locks: DashMap<String, Arc<Mutex<()>>>,
    tables_ready: OnceCell<()>,
}

impl PipelineRunner {
    /// Creates a runner with default retry, limits and failure mode.
    #[must_use]
    pub fn new(graph: StageGraph, store: Arc<dyn TableStore>) -> Self {
        Self {
            graph: Arc::new(graph),
            store,
            events: Arc::new(NoOpEventSink),
            retry: RetryConfig::default(),
            limits: BatchLimits::default(),
            failure_mode: FailureMode::default(),
            stage_locks: DashMap::new(),
            tables_ready: OnceCell::new(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the retry policy for transient failures.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets micro-batch bounds.
    #[must_use]
    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets how failures affect the rest of a pass.
    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Returns the stage graph.
    #[must_use]
    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Returns the table store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    /// Registers every output table with the store. Runs once per runner.
    ///
    /// # Errors
    ///
    /// Fails if a table exists with incompatible metadata.
    pub async fn initialize(&self) -> Result<()> {
        self.tables_ready
            .get_or_try_init(|| async {
                for spec in self.graph.specs() {
                    self.store
                        .ensure_table(spec.runner.output_table().clone())
                        .await?;
                }
                debug!(
                    pipeline = self.graph.name(),
                    tables = self.graph.stage_count(),
                    "Output tables ready"
                );
                Ok::<_, CyclestreamError>(())
            })
            .await
            .map(|_| ())
    }

    /// Runs a single pass.
    ///
    /// # Errors
    ///
    /// Only setup errors are returned; stage failures are in the report.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunReport> {
        self.run_pass(generate_run_id(), 1, cancel).await
    }

    /// Runs in the given mode.
    ///
    /// # Errors
    ///
    /// Only setup errors are returned; stage failures are in the report.
    pub async fn run(&self, mode: RunMode, cancel: &CancellationToken) -> Result<RunReport> {
        match mode {
            RunMode::Batch => self.run_once(cancel).await,
            RunMode::Streaming { poll_interval } => {
                self.run_streaming(poll_interval, cancel, |_| {}).await
            }
        }
    }

    /// Repeats passes until `cancel` fires, handing each pass report to
    /// `on_pass`. Returns the cumulative report.
    ///
    /// # Errors
    ///
    /// Only setup errors are returned; stage failures are in the report.
    pub async fn run_streaming<F>(
        &self,
        poll_interval: Duration,
        cancel: &CancellationToken,
        mut on_pass: F,
    ) -> Result<RunReport>
    where
        F: FnMut(&RunReport),
    {
        let run_id = generate_run_id();
        let mut pass = 1;
        let mut total = self.run_pass(run_id, pass, cancel).await?;
        on_pass(&total);

        while !cancel.is_cancelled() {
            tokio::select! {
                () = tokio::time::sleep(poll_interval) => {}
                () = cancel.cancelled() => break,
            }
            pass += 1;
            let report = self.run_pass(run_id, pass, cancel).await?;
            on_pass(&report);
            total.absorb(report);
        }

        info!(
            pipeline = self.graph.name(),
            run_id = %run_id,
            passes = pass,
            "Streaming run stopped"
        );
        Ok(total)
    }

    async fn run_pass(
        &self,
        run_id: Uuid,
        pass: u64,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        self.initialize().await?;
        let started = Instant::now();
        let started_at = format_timestamp(&Utc::now());
        let pipeline = self.graph.name().to_string();

        info!(pipeline = %pipeline, run_id = %run_id, pass, "Pipeline pass started");
        self.events
            .publish(&PipelineEvent::PipelineStarted {
                run_id,
                pipeline: pipeline.clone(),
                pass,
                stages: self.graph.stage_count(),
            })
            .await;

        let mut collector = FailureCollector::new(self.failure_mode);
        let mut in_degree = self.graph.in_degrees();
        let mut ready: VecDeque<&StageSpec> = self
            .graph
            .specs()
            .filter(|spec| in_degree.get(&spec.name) == Some(&0))
            .collect();
        let mut reports = BTreeMap::new();
        let mut active = FuturesUnordered::new();

        loop {
            while let Some(spec) = ready.pop_front() {
                let blocked = if collector.should_stop() {
                    Some("a stage failed earlier in the pass".to_string())
                } else {
                    collector
                        .blocker(&spec.dependencies)
                        .map(|dep| format!("upstream stage '{dep}' failed"))
                };
                match blocked {
                    Some(reason) => {
                        debug!(stage = %spec.name, reason = %reason, "Stage skipped");
                        collector.record_blocked(&spec.name);
                        let output = StageOutput::skip(reason);
                        reports.insert(spec.name.clone(), StageReport::new(spec, output, Instant::now()));
                        self.release(&spec.name, &mut in_degree, &mut ready);
                    }
                    None => active.push(self.run_stage(run_id, spec, cancel)),
                }
            }

            let Some((report, failure)) = active.next().await else {
                break;
            };
            match failure {
                Some(record) => collector.record_failure(record),
                None => collector.record_completion(&report.stage),
            }
            self.release(&report.stage, &mut in_degree, &mut ready);
            reports.insert(report.stage.clone(), report);
        }

        let report = RunReport {
            run_id,
            pipeline,
            passes: pass,
            started_at,
            duration_ms: elapsed_ms(started),
            stages: reports,
            failures: collector.failures().to_vec(),
        };

        info!(
            pipeline = %report.pipeline,
            run_id = %run_id,
            pass,
            committed = report.committed_stages(),
            failed = report.failures.len(),
            duration_ms = report.duration_ms,
            "Pipeline pass completed"
        );
        self.events
            .publish(&PipelineEvent::PipelineCompleted {
                run_id,
                pipeline: report.pipeline.clone(),
                pass,
                committed: report.committed_stages(),
                failed: report.failures.len(),
                duration_ms: report.duration_ms,
            })
            .await;

        Ok(report)
    }

    fn release<'g>(
        &'g self,
        finished: &str,
        in_degree: &mut HashMap<String, usize>,
        ready: &mut VecDeque<&'g StageSpec>,
    ) {
        for child in self.graph.dependents(finished) {
            if let Some(count) = in_degree.get_mut(child) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    if let Some(spec) = self.graph.stage(child) {
                        ready.push_back(spec);
                    }
                }
            }
        }
    }

    async fn run_stage(
        &self,
        run_id: Uuid,
        spec: &StageSpec,
        cancel: &CancellationToken,
    ) -> (StageReport, Option<FailureRecord>) {
        let started = Instant::now();
        let name = spec.name.as_str();

        // Executions of one stage never overlap, even across concurrent passes.
        let lock = Arc::clone(&self.stage_locks.entry(spec.name.clone()).or_default());
        let _guard = lock.lock().await;

        let mut metrics = BatchMetrics::default();
        let mut position: Option<Position> = None;
        let outcome = self
            .drain_stage(run_id, spec, cancel, &mut metrics, &mut position)
            .await;
        let watermark = position.as_ref().map(ToString::to_string);

        let (output, failure) = match outcome {
            Ok(()) if metrics.batches_committed > 0 => {
                info!(
                    stage = name,
                    batches = metrics.batches_committed,
                    rows_out = metrics.rows_out,
                    "Stage caught up"
                );
                (StageOutput::ok(metrics, watermark.unwrap_or_default()), None)
            }
            Ok(()) => {
                debug!(stage = name, "No new input");
                self.events
                    .publish(&PipelineEvent::StageIdle {
                        run_id,
                        stage: name.to_string(),
                        watermark: watermark.clone().unwrap_or_default(),
                    })
                    .await;
                (StageOutput::skip("no new input").with_watermark(watermark), None)
            }
            Err(CyclestreamError::Cancelled(reason)) => {
                warn!(stage = name, reason = %reason, "Stage cancelled before commit");
                self.events
                    .publish(&PipelineEvent::StageCancelled {
                        run_id,
                        stage: name.to_string(),
                        reason: reason.clone(),
                    })
                    .await;
                let output = StageOutput::cancel(reason)
                    .with_metrics(metrics)
                    .with_watermark(watermark);
                (output, None)
            }
            Err(err) => {
                error!(
                    stage = name,
                    code = err.error_code(),
                    retryable = err.is_retryable(),
                    error = %err,
                    "Stage failed; watermark unchanged"
                );
                self.events
                    .publish(&PipelineEvent::StageFailed {
                        run_id,
                        stage: name.to_string(),
                        error: err.to_string(),
                        code: err.error_code().to_string(),
                        retryable: err.is_retryable(),
                    })
                    .await;
                let mut record = FailureRecord::from_error(name, &err);
                if let Some(w) = &watermark {
                    record = record.with_context("watermark", serde_json::json!(w));
                }
                let output = StageOutput::from_error(&err)
                    .with_metrics(metrics)
                    .with_watermark(watermark);
                (output, Some(record))
            }
        };

        (StageReport::new(spec, output, started), failure)
    }

    /// Prepares and commits micro-batches until the stage has no new input.
    async fn drain_stage(
        &self,
        run_id: Uuid,
        spec: &StageSpec,
        cancel: &CancellationToken,
        metrics: &mut BatchMetrics,
        position: &mut Option<Position>,
    ) -> Result<()> {
        let name = spec.name.as_str();
        let table = spec.output_table().to_string();
        let input_table = self.graph.input_table(name);

        let start = self.store.watermark(name).await?;
        *position = Some(start.position.clone());
        self.events
            .publish(&PipelineEvent::StageStarted {
                run_id,
                stage: name.to_string(),
                watermark: start.position.to_string(),
            })
            .await;

        loop {
            check_cancelled(cancel)?;
            let watermark = self.store.watermark(name).await?;
            let ctx = StageContext {
                stage: name.to_string(),
                store: Arc::clone(&self.store),
                watermark: watermark.clone(),
                input_table: input_table.clone(),
                limits: self.limits,
                cancellation: cancel.clone(),
            };

            let runner = &spec.runner;
            let ctx_ref = &ctx;
            let Some(batch) = with_retry(&self.retry, name, move || runner.prepare(ctx_ref)).await? else {
                return Ok(());
            };
            if batch.position == watermark.position {
                return Err(CyclestreamError::Internal(format!(
                    "stage '{name}' prepared a batch without advancing past {}",
                    watermark.position
                )));
            }
            // A cancelled stage must not commit what it prepared.
            check_cancelled(cancel)?;

            let rows = batch.output.len() as u64;
            let mut batch_metrics = batch.metrics;
            batch_metrics.batches_committed = 1;

            let committed = self
                .store
                .commit(Commit {
                    stage: name.to_string(),
                    expected_version: watermark.version,
                    position: batch.position,
                    table: table.clone(),
                    output: batch.output,
                })
                .await?;

            info!(
                stage = name,
                table = %table,
                watermark = %committed.position,
                version = committed.version,
                rows,
                "Committed micro-batch"
            );
            metrics.absorb(&batch_metrics);
            *position = Some(committed.position.clone());

            self.events
                .publish(&PipelineEvent::StageCommitted {
                    run_id,
                    stage: name.to_string(),
                    table: table.clone(),
                    watermark: committed.position.to_string(),
                    version: committed.version,
                    rows,
                })
                .await;
            if batch_metrics.total_violations() > 0 {
                self.events
                    .publish(&PipelineEvent::QualityViolations {
                        run_id,
                        stage: name.to_string(),
                        table: table.clone(),
                        violations: batch_metrics.constraint_violations.clone(),
                        dropped: batch_metrics.rows_dropped,
                        flagged: batch_metrics.rows_flagged,
                    })
                    .await;
            }
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CyclestreamError::Cancelled(
            cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
        ));
    }
    Ok(())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
