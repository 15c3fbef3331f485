#![forbid(unsafe_code)]

//! # style-profile
//!
//! Turn a handful of fashion images into one consolidated style profile.
//!
//! Every image is resolved once, then analyzed twice in parallel: a seeded
//! k-means pass extracts its dominant colors, and a vision model annotates
//! garments, descriptors, occasions and styling advice against a fixed
//! schema. Items that fail are recorded and skipped. Whatever survives is
//! reduced into frequency-ranked top-N views plus a short narrative.

pub mod annotation;
pub mod annotator;
pub mod gateway;
pub mod palette;
pub mod pipeline;
pub mod report;
pub mod resolver;
pub mod summary;
pub mod trace;

pub use annotation::{Annotation, AnnotationField, SchemaViolation, ANNOTATION_SCHEMA_VERSION};
pub use annotator::{AnnotationError, GatewayAnnotator, StyleAnnotator};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use palette::{ColorAnalysisError, ColorObservation, ColorProfiler, ColorProfilerConfig};
pub use pipeline::{
    run_with_trace_file, AggregateState, AggregationPipeline, ItemOutcome, ItemReport,
    PipelineConfig, PipelineError, PipelineRun, ProfileRequest, RunStopReason,
};
pub use report::{build_report, render_markdown, render_report_markdown, ProfileReport};
pub use resolver::{HttpImageResolver, ImageResolver, ResolveError, ResolvedImage};
pub use summary::{reduce, RankedEntry, RankedSummary, RankedView, SummaryConfig};
pub use trace::{ItemTrace, JsonlTraceSink, TraceError, TraceSink, TraceWorker};
