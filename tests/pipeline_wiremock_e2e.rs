use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use style_profile::gateway::ProviderError;
use style_profile::pipeline::{FailureKind, PipelineError};
use style_profile::{
    reduce, run_with_trace_file, AggregationPipeline, Annotation, AnnotationError,
    AnnotationField, ColorProfilerConfig, HttpImageResolver, ImageResolver, ItemOutcome,
    PipelineConfig, ResolveError, ResolvedImage, RunStopReason, StyleAnnotator, SummaryConfig,
};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn stripes(colors: &[[u8; 3]]) -> RgbImage {
    let width = 60 * colors.len() as u32;
    RgbImage::from_fn(width, 40, |x, _| Rgb(colors[(x / 60) as usize]))
}

fn png(img: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

async fn serve_png(server: &MockServer, route: &str, img: &RgbImage) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png(img), "image/png"))
        .mount(server)
        .await;
}

/// Annotator that tags every image as minimalist and names a garment after its source.
#[derive(Default)]
struct FakeAnnotator {
    calls: AtomicUsize,
    fatal: bool,
}

#[async_trait]
impl StyleAnnotator for FakeAnnotator {
    async fn annotate(&self, image: &ResolvedImage) -> Result<Annotation, AnnotationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            return Err(AnnotationError::Request(ProviderError::config(
                "OPENROUTER_API_KEY not set",
            )));
        }
        if image.source.contains("unparseable") {
            return Err(AnnotationError::Malformed("expected a JSON object".into()));
        }
        let garment = image.source.rsplit('/').next().unwrap_or("").to_string();
        Ok(Annotation::empty()
            .with(AnnotationField::StyleDescriptors, ["minimalist"])
            .with(AnnotationField::Garments, [garment]))
    }
}

/// Resolver that never touches the network and records what it was asked for.
#[derive(Default)]
struct SolidResolver {
    seen: Mutex<Vec<String>>,
    started: Mutex<Vec<Instant>>,
    cancel_after_first: Option<Arc<AtomicBool>>,
    fatal: bool,
}

#[async_trait]
impl ImageResolver for SolidResolver {
    async fn resolve(&self, source: &str) -> Result<ResolvedImage, ResolveError> {
        self.seen.lock().unwrap().push(source.to_string());
        self.started.lock().unwrap().push(Instant::now());
        if let Some(flag) = &self.cancel_after_first {
            flag.store(true, Ordering::SeqCst);
        }
        if self.fatal {
            return Err(ResolveError::Fatal("client unavailable".into()));
        }
        Ok(ResolvedImage {
            source: source.to_string(),
            mime: "image/png".into(),
            pixels: RgbImage::from_pixel(10, 10, Rgb([12, 34, 56])),
        })
    }
}

fn sources(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("https://img.test/{i}.png")).collect()
}

#[tokio::test]
async fn partial_failure_run_reduces_surviving_items() {
    let server = MockServer::start().await;
    serve_png(&server, "/a.png", &stripes(&[[255, 255, 255], [0, 0, 0]])).await;
    serve_png(
        &server,
        "/b.png",
        &stripes(&[[0, 0, 0], [200, 30, 30], [255, 255, 255], [10, 90, 10]]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/missing.png"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let annotator = Arc::new(FakeAnnotator::default());
    let config = PipelineConfig {
        color: ColorProfilerConfig {
            n_colors: 3,
            ..Default::default()
        },
        ..Default::default()
    };
    let pipeline = AggregationPipeline::new(
        Arc::new(HttpImageResolver::new().unwrap()),
        annotator.clone(),
        config,
    );

    let srcs = vec![
        format!("{}/a.png", server.uri()),
        format!("{}/missing.png", server.uri()),
        format!("{}/b.png", server.uri()),
    ];
    let run = pipeline.run(&srcs, None).await.unwrap();

    assert_eq!(run.stop_reason, RunStopReason::Completed);
    assert_eq!(run.items.len(), 3);
    assert_eq!(run.state.items_attempted, 3);
    assert_eq!(run.state.items_succeeded, 2);
    assert_eq!(annotator.calls.load(Ordering::SeqCst), 2);

    match &run.items[1].outcome {
        ItemOutcome::ResolveFailure { failure } => {
            assert_eq!(failure.kind, FailureKind::Resolve);
            assert_eq!(failure.code, "http_status");
        }
        other => panic!("expected resolve failure, got {other:?}"),
    }

    assert_eq!(run.state.palettes.len(), 2);
    assert_eq!(run.state.palettes[0].len(), 2);
    assert_eq!(run.state.palettes[1].len(), 3);
    for palette in &run.state.palettes {
        let sum: f64 = palette.iter().map(|o| o.weight).sum();
        assert!((sum - 100.0).abs() <= 0.5);
    }

    let summary = reduce(&run.state, &SummaryConfig::default());
    assert!(summary.colors.entries.iter().all(|e| e.count <= 2));
    let styles = summary.field(AnnotationField::StyleDescriptors).unwrap();
    assert_eq!(styles.entries[0].value, "minimalist");
    assert_eq!(styles.entries[0].count, 2);
    let garments: Vec<&str> = summary
        .field(AnnotationField::Garments)
        .unwrap()
        .values()
        .collect();
    assert_eq!(garments, ["a.png", "b.png"]);
    assert!(summary.narrative.contains("minimalist"));
}

#[tokio::test]
async fn concurrency_does_not_change_order_or_summary() {
    let server = MockServer::start().await;
    let images = [
        stripes(&[[255, 0, 0], [0, 0, 255]]),
        stripes(&[[0, 0, 255], [250, 250, 250]]),
        stripes(&[[250, 250, 250], [255, 0, 0], [0, 0, 0]]),
        stripes(&[[0, 0, 0]]),
    ];
    let mut srcs = Vec::new();
    for (i, img) in images.iter().enumerate() {
        let route = format!("/{i}.png");
        serve_png(&server, &route, img).await;
        srcs.push(format!("{}{route}", server.uri()));
    }

    let mut summaries = Vec::new();
    for concurrency in [1, 4] {
        let pipeline = AggregationPipeline::new(
            Arc::new(HttpImageResolver::new().unwrap()),
            Arc::new(FakeAnnotator::default()),
            PipelineConfig {
                concurrency,
                ..Default::default()
            },
        );
        let run = pipeline.run(&srcs, None).await.unwrap();
        let order: Vec<usize> = run.items.iter().map(|i| i.index).collect();
        assert_eq!(order, [0, 1, 2, 3]);
        summaries.push(reduce(&run.state, &SummaryConfig::default()));
    }
    assert_eq!(summaries[0], summaries[1]);
}

#[tokio::test]
async fn sources_are_truncated_before_any_fetch() {
    let resolver = Arc::new(SolidResolver::default());
    let pipeline = AggregationPipeline::new(
        resolver.clone(),
        Arc::new(FakeAnnotator::default()),
        PipelineConfig::default(),
    );

    let run = pipeline.run(&sources(12), None).await.unwrap();
    assert_eq!(run.items.len(), 10);
    assert_eq!(resolver.seen.lock().unwrap().clone(), sources(10));
}

#[tokio::test]
async fn empty_input_fails_without_calling_collaborators() {
    let resolver = Arc::new(SolidResolver::default());
    let pipeline = AggregationPipeline::new(
        resolver.clone(),
        Arc::new(FakeAnnotator::default()),
        PipelineConfig::default(),
    );

    let err = pipeline.run(&[], None).await.unwrap_err();
    assert!(matches!(err, PipelineError::EmptyInput));

    let zero = AggregationPipeline::new(
        resolver.clone(),
        Arc::new(FakeAnnotator::default()),
        PipelineConfig {
            max_items: 0,
            ..Default::default()
        },
    );
    assert!(matches!(
        zero.run(&sources(3), None).await,
        Err(PipelineError::EmptyInput)
    ));
    assert!(resolver.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_flag_set_before_run_skips_every_item() {
    let resolver = Arc::new(SolidResolver::default());
    let pipeline = AggregationPipeline::new(
        resolver.clone(),
        Arc::new(FakeAnnotator::default()),
        PipelineConfig::default(),
    );

    let cancel = AtomicBool::new(true);
    let run = pipeline.run(&sources(3), Some(&cancel)).await.unwrap();
    assert_eq!(run.stop_reason, RunStopReason::Cancelled);
    assert!(run.items.iter().all(|i| i.outcome == ItemOutcome::Cancelled));
    assert_eq!(run.state.items_cancelled, 3);
    assert_eq!(run.state.items_attempted, 0);
    assert!(resolver.seen.lock().unwrap().is_empty());

    let summary = reduce(&run.state, &SummaryConfig::default());
    assert!(summary.colors.is_empty());
}

#[tokio::test]
async fn cancel_mid_run_keeps_completed_items() {
    let cancel = Arc::new(AtomicBool::new(false));
    let resolver = Arc::new(SolidResolver {
        cancel_after_first: Some(cancel.clone()),
        ..Default::default()
    });
    let pipeline = AggregationPipeline::new(
        resolver.clone(),
        Arc::new(FakeAnnotator::default()),
        PipelineConfig::default(),
    );

    let run = pipeline
        .run(&sources(4), Some(cancel.as_ref()))
        .await
        .unwrap();
    assert_eq!(run.stop_reason, RunStopReason::Cancelled);
    assert_eq!(run.state.items_succeeded, 1);
    assert_eq!(run.state.items_cancelled, 3);
    assert_eq!(resolver.seen.lock().unwrap().len(), 1);
    assert_eq!(run.state.palettes, vec![vec![style_profile::ColorObservation {
        hex: "#0c2238".into(),
        weight: 100.0,
    }]]);
}

#[tokio::test]
async fn annotation_failure_keeps_colors() {
    let pipeline = AggregationPipeline::new(
        Arc::new(SolidResolver::default()),
        Arc::new(FakeAnnotator::default()),
        PipelineConfig::default(),
    );
    let srcs = vec![
        "https://img.test/ok.png".to_string(),
        "https://img.test/unparseable.png".to_string(),
    ];
    let run = pipeline.run(&srcs, None).await.unwrap();

    assert_eq!(run.items[1].outcome.kind(), "annotation_failure");
    assert_eq!(run.state.items_succeeded, 2);
    assert_eq!(run.state.palettes.len(), 2);
    assert_eq!(run.state.annotations.len(), 1);
}

#[tokio::test]
async fn color_only_pipeline_never_calls_annotator() {
    let pipeline = AggregationPipeline::color_only(
        Arc::new(SolidResolver::default()),
        PipelineConfig::default(),
    );
    let run = pipeline.run(&sources(2), None).await.unwrap();
    assert_eq!(run.state.items_succeeded, 2);
    assert!(run.state.annotations.is_empty());
    assert!(matches!(
        run.items[0].outcome,
        ItemOutcome::Success {
            annotation: None,
            ..
        }
    ));

    let annotator = Arc::new(FakeAnnotator::default());
    let disabled = AggregationPipeline::new(
        Arc::new(SolidResolver::default()),
        annotator.clone(),
        PipelineConfig {
            annotation_enabled: false,
            ..Default::default()
        },
    );
    disabled.run(&sources(2), None).await.unwrap();
    assert_eq!(annotator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fatal_collaborator_errors_abort_the_run() {
    let pipeline = AggregationPipeline::new(
        Arc::new(SolidResolver::default()),
        Arc::new(FakeAnnotator {
            fatal: true,
            ..Default::default()
        }),
        PipelineConfig::default(),
    );
    match pipeline.run(&sources(3), None).await {
        Err(PipelineError::Annotator(e)) => assert!(e.is_fatal()),
        other => panic!("expected fatal annotator error, got {other:?}"),
    }

    let pipeline = AggregationPipeline::new(
        Arc::new(SolidResolver {
            fatal: true,
            ..Default::default()
        }),
        Arc::new(FakeAnnotator::default()),
        PipelineConfig::default(),
    );
    assert!(matches!(
        pipeline.run(&sources(3), None).await,
        Err(PipelineError::Resolver(ResolveError::Fatal(_)))
    ));
}

#[tokio::test]
async fn trace_file_gets_one_row_per_item() {
    let dir = tempdir().unwrap();
    let trace_path = dir.path().join("trace.jsonl");

    let pipeline = AggregationPipeline::new(
        Arc::new(SolidResolver::default()),
        Arc::new(FakeAnnotator::default()),
        PipelineConfig::default(),
    );
    let srcs = vec![
        "https://img.test/ok.png".to_string(),
        "https://img.test/unparseable.png".to_string(),
    ];
    let run = run_with_trace_file(&pipeline, &srcs, None, Some(trace_path.clone()))
        .await
        .unwrap();

    let raw = std::fs::read_to_string(&trace_path).unwrap();
    let rows: Vec<serde_json::Value> = raw
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["outcome"], "success");
    assert_eq!(rows[0]["run_id"], run.run_id.to_string());
    assert_eq!(rows[1]["outcome"], "annotation_failure");
    assert_eq!(rows[1]["failure_kind"], "annotation");
    assert_eq!(rows[1]["colors"], 1);
}

#[tokio::test]
async fn item_delay_spaces_fetches_even_when_items_run_concurrently() {
    let resolver = Arc::new(SolidResolver::default());
    let config = PipelineConfig {
        concurrency: 4,
        item_delay: Duration::from_millis(100),
        ..Default::default()
    };
    let pipeline = AggregationPipeline::color_only(resolver.clone(), config);

    let run = pipeline.run(&sources(4), None).await.unwrap();
    assert_eq!(run.state.items_succeeded, 4);

    let started = resolver.started.lock().unwrap();
    assert_eq!(started.len(), 4);
    for pair in started.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= Duration::from_millis(75), "fetches only {gap:?} apart");
    }
}

#[tokio::test]
async fn cancel_during_item_delay_skips_the_fetch() {
    let flag = Arc::new(AtomicBool::new(false));
    let resolver = Arc::new(SolidResolver {
        cancel_after_first: Some(flag.clone()),
        ..Default::default()
    });
    let config = PipelineConfig {
        concurrency: 3,
        item_delay: Duration::from_millis(50),
        ..Default::default()
    };
    let pipeline = AggregationPipeline::color_only(resolver.clone(), config);

    let run = pipeline.run(&sources(3), Some(&flag)).await.unwrap();

    // Items 1 and 2 were already waiting for a slot when item 0 set the flag.
    assert_eq!(resolver.seen.lock().unwrap().len(), 1);
    assert_eq!(run.state.items_cancelled, 2);
    assert_eq!(run.stop_reason, RunStopReason::Cancelled);
}
