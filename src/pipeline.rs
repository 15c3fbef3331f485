//! Aggregation pipeline: sources → resolve → (palette ∥ annotation) → aggregate.
//!
//! Each source is resolved once, then the color profiler and the style
//! annotator run concurrently on the same pixels. A failure in one analyzer
//! never discards the other's result, and no per-item failure escapes
//! [`AggregationPipeline::run`]. Only fatal collaborator errors (a resolver
//! that cannot run, rejected credentials) abort the run.
//!
//! Usage:
//! ```bash
//! style-profile analyze --request profile.json --out summary.json
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::annotation::Annotation;
use crate::annotator::{AnnotationError, StyleAnnotator};
use crate::palette::{ColorAnalysisError, ColorObservation, ColorProfiler, ColorProfilerConfig};
use crate::resolver::{ImageResolver, ResolveError, ResolvedImage};
use crate::trace::{now_epoch_ms, source_hash, ItemTrace, JsonlTraceSink, TraceError, TraceSink};

// =============================================================================
// Configuration
// =============================================================================

pub const DEFAULT_MAX_ITEMS: usize = 10;
pub const DEFAULT_COLOR_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Only the first `max_items` sources are processed.
    pub max_items: usize,
    /// Items in flight at once. Outcomes are still folded in input order.
    pub concurrency: usize,
    /// Minimum spacing between consecutive fetches, shared by every in-flight
    /// item. The first fetch also waits one delay.
    pub item_delay: Duration,
    pub color: ColorProfilerConfig,
    pub color_timeout: Duration,
    /// When false the annotator is never called.
    pub annotation_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            concurrency: 1,
            item_delay: Duration::ZERO,
            color: ColorProfilerConfig::default(),
            color_timeout: DEFAULT_COLOR_TIMEOUT,
            annotation_enabled: true,
        }
    }
}

/// JSON request accepted by `style-profile analyze --request`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfileRequest {
    #[serde(default)]
    pub sources: Vec<String>,
    /// Board page to expand into sources before `sources`.
    #[serde(default)]
    pub board_url: Option<String>,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub item_delay_ms: u64,
    #[serde(default)]
    pub color: ColorProfilerConfig,
    #[serde(default = "default_color_timeout_ms")]
    pub color_timeout_ms: u64,
    #[serde(default = "default_annotate")]
    pub annotate: bool,
    /// Vision model for annotation (default: anthropic/claude-3.5-sonnet).
    #[serde(default)]
    pub model: Option<String>,
}

fn default_max_items() -> usize {
    DEFAULT_MAX_ITEMS
}
fn default_concurrency() -> usize {
    1
}
fn default_color_timeout_ms() -> u64 {
    DEFAULT_COLOR_TIMEOUT.as_millis() as u64
}
fn default_annotate() -> bool {
    true
}

impl Default for ProfileRequest {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            board_url: None,
            max_items: DEFAULT_MAX_ITEMS,
            concurrency: 1,
            item_delay_ms: 0,
            color: ColorProfilerConfig::default(),
            color_timeout_ms: default_color_timeout_ms(),
            annotate: true,
            model: None,
        }
    }
}

impl ProfileRequest {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_items: self.max_items,
            concurrency: self.concurrency,
            item_delay: Duration::from_millis(self.item_delay_ms),
            color: self.color.clone(),
            color_timeout: Duration::from_millis(self.color_timeout_ms),
            annotation_enabled: self.annotate,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Resolve,
    ColorAnalysis,
    Annotation,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Resolve => "resolve",
            FailureKind::ColorAnalysis => "color_analysis",
            FailureKind::Annotation => "annotation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub kind: FailureKind,
    /// Collaborator error code, e.g. `http_status` or `malformed`.
    pub code: String,
    pub reason: String,
}

impl ItemFailure {
    fn resolve(e: &ResolveError) -> Self {
        Self {
            kind: FailureKind::Resolve,
            code: e.code().to_string(),
            reason: e.to_string(),
        }
    }

    fn color(e: &ColorAnalysisError) -> Self {
        Self {
            kind: FailureKind::ColorAnalysis,
            code: e.code().to_string(),
            reason: e.to_string(),
        }
    }

    fn annotation(e: &AnnotationError) -> Self {
        Self {
            kind: FailureKind::Annotation,
            code: e.code().to_string(),
            reason: e.to_string(),
        }
    }
}

/// What happened to one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// `annotation` is `None` only when annotation is disabled.
    Success {
        colors: Vec<ColorObservation>,
        annotation: Option<Annotation>,
    },
    ResolveFailure {
        failure: ItemFailure,
    },
    ColorFailure {
        failure: ItemFailure,
        annotation: Option<Annotation>,
    },
    AnnotationFailure {
        failure: ItemFailure,
        colors: Vec<ColorObservation>,
    },
    AnalysisFailure {
        color: ItemFailure,
        annotation: ItemFailure,
    },
    Cancelled,
}

impl ItemOutcome {
    fn from_analyses(
        colors: Result<Vec<ColorObservation>, ColorAnalysisError>,
        annotation: Option<Result<Annotation, AnnotationError>>,
    ) -> Self {
        match (colors, annotation) {
            (Ok(colors), None) => ItemOutcome::Success {
                colors,
                annotation: None,
            },
            (Ok(colors), Some(Ok(a))) => ItemOutcome::Success {
                colors,
                annotation: Some(a),
            },
            (Ok(colors), Some(Err(e))) => ItemOutcome::AnnotationFailure {
                failure: ItemFailure::annotation(&e),
                colors,
            },
            (Err(e), None) => ItemOutcome::ColorFailure {
                failure: ItemFailure::color(&e),
                annotation: None,
            },
            (Err(e), Some(Ok(a))) => ItemOutcome::ColorFailure {
                failure: ItemFailure::color(&e),
                annotation: Some(a),
            },
            (Err(ce), Some(Err(ae))) => ItemOutcome::AnalysisFailure {
                color: ItemFailure::color(&ce),
                annotation: ItemFailure::annotation(&ae),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ItemOutcome::Success { .. } => "success",
            ItemOutcome::ResolveFailure { .. } => "resolve_failure",
            ItemOutcome::ColorFailure { .. } => "color_failure",
            ItemOutcome::AnnotationFailure { .. } => "annotation_failure",
            ItemOutcome::AnalysisFailure { .. } => "analysis_failure",
            ItemOutcome::Cancelled => "cancelled",
        }
    }

    pub fn colors(&self) -> Option<&[ColorObservation]> {
        match self {
            ItemOutcome::Success { colors, .. } | ItemOutcome::AnnotationFailure { colors, .. } => {
                Some(colors)
            }
            _ => None,
        }
    }

    pub fn annotation(&self) -> Option<&Annotation> {
        match self {
            ItemOutcome::Success { annotation, .. } | ItemOutcome::ColorFailure { annotation, .. } => {
                annotation.as_ref()
            }
            _ => None,
        }
    }

    /// At least one analyzer produced a result.
    pub fn succeeded(&self) -> bool {
        self.colors().is_some() || self.annotation().is_some()
    }

    /// Failures in the order they happened to this item.
    pub fn failures(&self) -> Vec<&ItemFailure> {
        match self {
            ItemOutcome::ResolveFailure { failure }
            | ItemOutcome::ColorFailure { failure, .. }
            | ItemOutcome::AnnotationFailure { failure, .. } => vec![failure],
            ItemOutcome::AnalysisFailure { color, annotation } => vec![color, annotation],
            ItemOutcome::Success { .. } | ItemOutcome::Cancelled => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    pub index: usize,
    pub source: String,
    pub outcome: ItemOutcome,
    pub latency_ms: u64,
}

impl ItemReport {
    fn trace(&self, run_id: Uuid) -> ItemTrace {
        let failures = self.outcome.failures();
        let (failure_kind, failure_reason) = if failures.is_empty() {
            (None, None)
        } else {
            let kinds: Vec<&str> = failures.iter().map(|f| f.kind.as_str()).collect();
            let reasons: Vec<&str> = failures.iter().map(|f| f.reason.as_str()).collect();
            (Some(kinds.join("; ")), Some(reasons.join("; ")))
        };
        ItemTrace {
            timestamp_ms: now_epoch_ms(),
            run_id: run_id.to_string(),
            index: self.index,
            source: self.source.clone(),
            source_hash: source_hash(&self.source),
            outcome: self.outcome.kind().to_string(),
            colors: self.outcome.colors().map_or(0, <[_]>::len),
            annotated: self.outcome.annotation().is_some(),
            failure_kind,
            failure_reason,
            latency_ms: self.latency_ms,
        }
    }
}

// =============================================================================
// Aggregate state
// =============================================================================

/// Append-only collections built from item outcomes, in input order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateState {
    /// One palette per item whose color analysis succeeded.
    pub palettes: Vec<Vec<ColorObservation>>,
    pub annotations: Vec<Annotation>,
    pub items_attempted: usize,
    pub items_succeeded: usize,
    pub items_cancelled: usize,
}

impl AggregateState {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        if matches!(outcome, ItemOutcome::Cancelled) {
            self.items_cancelled += 1;
            return;
        }
        self.items_attempted += 1;
        if let Some(colors) = outcome.colors() {
            self.palettes.push(colors.to_vec());
        }
        if let Some(annotation) = outcome.annotation() {
            self.annotations.push(annotation.clone());
        }
        if outcome.succeeded() {
            self.items_succeeded += 1;
        }
    }

    /// Every color observation across all palettes, in arrival order.
    pub fn colors(&self) -> impl Iterator<Item = &ColorObservation> {
        self.palettes.iter().flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStopReason {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub stop_reason: RunStopReason,
    pub items: Vec<ItemReport>,
    pub state: AggregateState,
    pub latency_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no sources to process")]
    EmptyInput,
    #[error("resolver failed: {0}")]
    Resolver(ResolveError),
    #[error("annotator failed: {0}")]
    Annotator(AnnotationError),
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::EmptyInput => "empty_input",
            PipelineError::Resolver(e) => e.code(),
            PipelineError::Annotator(e) => e.code(),
            PipelineError::Trace(e) => e.code(),
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct AggregationPipeline {
    resolver: Arc<dyn ImageResolver>,
    annotator: Option<Arc<dyn StyleAnnotator>>,
    config: PipelineConfig,
    run_id: Uuid,
}

impl AggregationPipeline {
    pub fn new(
        resolver: Arc<dyn ImageResolver>,
        annotator: Arc<dyn StyleAnnotator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            resolver,
            annotator: Some(annotator),
            config,
            run_id: Uuid::new_v4(),
        }
    }

    /// Palette-only pipeline; no annotator is ever called.
    pub fn color_only(resolver: Arc<dyn ImageResolver>, config: PipelineConfig) -> Self {
        Self {
            resolver,
            annotator: None,
            config: PipelineConfig {
                annotation_enabled: false,
                ..config
            },
            run_id: Uuid::new_v4(),
        }
    }

    /// Use a caller-chosen run id, e.g. one already attached to the annotator.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn run(
        &self,
        sources: &[String],
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<PipelineRun, PipelineError> {
        self.run_with_trace(sources, cancel_flag, None).await
    }

    pub async fn run_with_trace(
        &self,
        sources: &[String],
        cancel_flag: Option<&AtomicBool>,
        trace: Option<&dyn TraceSink>,
    ) -> Result<PipelineRun, PipelineError> {
        let bounded: Vec<&str> = sources
            .iter()
            .take(self.config.max_items)
            .map(String::as_str)
            .collect();
        if bounded.is_empty() {
            return Err(PipelineError::EmptyInput);
        }

        let started_at = Utc::now();
        let start = Instant::now();
        tracing::info!(
            run_id = %self.run_id,
            sources = sources.len(),
            processing = bounded.len(),
            concurrency = self.config.concurrency.max(1),
            annotate = self.annotation_active(),
            "Starting style profile run"
        );

        let pacer = Pacer::new(self.config.item_delay);
        let mut results = std::pin::pin!(stream::iter(
            bounded
                .iter()
                .enumerate()
                .map(|(index, source)| self.process_item(index, source, &pacer, cancel_flag)),
        )
        .buffered(self.config.concurrency.max(1)));

        let mut state = AggregateState::default();
        let mut items = Vec::with_capacity(bounded.len());
        while let Some(result) = results.next().await {
            let report = result?;
            log_item(&report);
            if let Some(trace) = trace {
                trace.record(report.trace(self.run_id))?;
            }
            state.record(&report.outcome);
            items.push(report);
        }

        let stop_reason = if state.items_cancelled > 0 {
            RunStopReason::Cancelled
        } else {
            RunStopReason::Completed
        };
        let latency_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            run_id = %self.run_id,
            attempted = state.items_attempted,
            succeeded = state.items_succeeded,
            cancelled = state.items_cancelled,
            stop_reason = ?stop_reason,
            latency_ms,
            "Style profile run finished"
        );

        Ok(PipelineRun {
            run_id: self.run_id,
            started_at,
            stop_reason,
            items,
            state,
            latency_ms,
        })
    }

    fn annotation_active(&self) -> bool {
        self.config.annotation_enabled && self.annotator.is_some()
    }

    async fn process_item(
        &self,
        index: usize,
        source: &str,
        pacer: &Pacer,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<ItemReport, PipelineError> {
        let start = Instant::now();
        let outcome = self.analyze(source, pacer, cancel_flag).await?;
        Ok(ItemReport {
            index,
            source: source.to_string(),
            outcome,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn analyze(
        &self,
        source: &str,
        pacer: &Pacer,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<ItemOutcome, PipelineError> {
        if is_cancelled(cancel_flag) {
            return Ok(ItemOutcome::Cancelled);
        }
        if pacer.wait().await && is_cancelled(cancel_flag) {
            return Ok(ItemOutcome::Cancelled);
        }

        let image = match self.resolver.resolve(source).await {
            Ok(image) => Arc::new(image),
            Err(e) if e.is_fatal() => return Err(PipelineError::Resolver(e)),
            Err(e) => {
                return Ok(ItemOutcome::ResolveFailure {
                    failure: ItemFailure::resolve(&e),
                })
            }
        };

        let annotate = async {
            match &self.annotator {
                Some(annotator) if self.config.annotation_enabled => {
                    Some(annotator.annotate(&image).await)
                }
                _ => None,
            }
        };
        let (colors, annotation) = tokio::join!(self.profile_colors(image.clone()), annotate);

        let annotation = match annotation {
            Some(Err(e)) if e.is_fatal() => return Err(PipelineError::Annotator(e)),
            other => other,
        };
        Ok(ItemOutcome::from_analyses(colors, annotation))
    }

    async fn profile_colors(
        &self,
        image: Arc<ResolvedImage>,
    ) -> Result<Vec<ColorObservation>, ColorAnalysisError> {
        let profiler = ColorProfiler::new(self.config.color.clone());
        let timeout = self.config.color_timeout;
        let task = tokio::task::spawn_blocking(move || profiler.profile(&image.pixels));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ColorAnalysisError::Worker(join.to_string())),
            Err(_) => Err(ColorAnalysisError::Timeout(timeout)),
        }
    }
}

/// Hands out fetch slots at least `delay` apart, across all in-flight items.
struct Pacer {
    delay: Duration,
    next_slot: tokio::sync::Mutex<tokio::time::Instant>,
}

impl Pacer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_slot: tokio::sync::Mutex::new(tokio::time::Instant::now() + delay),
        }
    }

    /// Returns whether the caller actually waited.
    async fn wait(&self) -> bool {
        if self.delay.is_zero() {
            return false;
        }
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(tokio::time::Instant::now());
            *next = slot + self.delay;
            slot
        };
        tokio::time::sleep_until(slot).await;
        true
    }
}

fn is_cancelled(cancel_flag: Option<&AtomicBool>) -> bool {
    cancel_flag.is_some_and(|flag| flag.load(AtomicOrdering::Relaxed))
}

fn log_item(report: &ItemReport) {
    let outcome = &report.outcome;
    match outcome {
        ItemOutcome::Success { colors, annotation } => tracing::info!(
            index = report.index,
            source = %report.source,
            colors = colors.len(),
            annotated = annotation.is_some(),
            latency_ms = report.latency_ms,
            "Item analyzed"
        ),
        ItemOutcome::Cancelled => tracing::info!(
            index = report.index,
            source = %report.source,
            "Item skipped after cancellation"
        ),
        _ => {
            for failure in outcome.failures() {
                tracing::warn!(
                    index = report.index,
                    source = %report.source,
                    kind = failure.kind.as_str(),
                    code = %failure.code,
                    error = %failure.reason,
                    "Item analysis failed"
                );
            }
        }
    }
}

/// Convenience: run the pipeline and write one trace row per item to a JSONL file.
pub async fn run_with_trace_file(
    pipeline: &AggregationPipeline,
    sources: &[String],
    cancel_flag: Option<&AtomicBool>,
    trace_path: Option<PathBuf>,
) -> Result<PipelineRun, PipelineError> {
    let (trace_sink, trace_worker) = match trace_path {
        Some(path) => {
            let (sink, worker) = JsonlTraceSink::new(path)?;
            (Some(sink), Some(worker))
        }
        None => (None, None),
    };
    let trace_ref = trace_sink.as_ref().map(|s| s as &dyn TraceSink);

    let result = pipeline.run_with_trace(sources, cancel_flag, trace_ref).await;

    drop(trace_sink);
    if let Some(worker) = trace_worker {
        if let Err(e) = worker.join() {
            tracing::warn!(error = %e, "Trace writer failed");
        }
    }

    result
}
