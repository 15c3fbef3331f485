#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use style_profile::annotator::DEFAULT_ANNOTATION_MODEL;
use style_profile::gateway::{ProviderGateway, TracingUsageSink};
use style_profile::{
    build_report, render_report_markdown, run_with_trace_file, AggregationPipeline,
    ColorProfiler, ColorProfilerConfig, GatewayAnnotator, HttpImageResolver, ProfileRequest,
    SummaryConfig,
};

#[derive(Parser)]
#[command(name = "style-profile", version, about = "Style profile aggregator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Profile a list of image or pin URLs
    Analyze {
        /// Image or pin page URL (repeatable)
        #[arg(long)]
        source: Vec<String>,
        /// File with one source per line; `#` starts a comment
        #[arg(long)]
        sources_file: Option<PathBuf>,
        /// Path to a profile request JSON
        #[arg(long)]
        request: Option<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Profile the images on a board page
    Board {
        #[arg(long)]
        url: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Extract the dominant colors of a local image file
    Palette {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        n_colors: Option<usize>,
        #[arg(long)]
        resize_dim: Option<u32>,
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Json,
    Md,
}

/// Flags shared by `analyze` and `board`. Each one overrides the request.
#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    max_items: Option<usize>,
    #[arg(long)]
    n_colors: Option<usize>,
    #[arg(long)]
    resize_dim: Option<u32>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Vision model (default: $STYLE_PROFILE_MODEL or anthropic/claude-3.5-sonnet)
    #[arg(long)]
    model: Option<String>,
    /// Colors only; never call the vision model
    #[arg(long)]
    no_annotate: bool,
    /// Write the report here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "json")]
    format: ReportFormat,
    /// Write one JSONL row per item
    #[arg(long)]
    trace: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, req: &mut ProfileRequest) {
        if let Some(v) = self.max_items {
            req.max_items = v;
        }
        if let Some(v) = self.n_colors {
            req.color.n_colors = v;
        }
        if let Some(v) = self.resize_dim {
            req.color.resize_dim = v;
        }
        if let Some(v) = self.seed {
            req.color.random_seed = v;
        }
        if let Some(v) = self.concurrency {
            req.concurrency = v;
        }
        if let Some(v) = self.delay_ms {
            req.item_delay_ms = v;
        }
        if let Some(v) = &self.model {
            req.model = Some(v.clone());
        }
        if self.no_annotate {
            req.annotate = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            source,
            sources_file,
            request,
            run,
        } => {
            let mut req: ProfileRequest = match &request {
                Some(path) => read_json(path)?,
                None => ProfileRequest::default(),
            };
            if let Some(path) = &sources_file {
                req.sources.extend(read_sources_file(path)?);
            }
            req.sources.extend(source);
            run.apply(&mut req);
            if req.sources.is_empty() && req.board_url.is_none() {
                return Err("analyze needs --source, --sources-file or --request".into());
            }
            run_profile(req, &run).await?;
        }
        Commands::Board { url, run } => {
            let mut req = ProfileRequest {
                board_url: Some(url),
                ..ProfileRequest::default()
            };
            run.apply(&mut req);
            run_profile(req, &run).await?;
        }
        Commands::Palette {
            image,
            n_colors,
            resize_dim,
            seed,
        } => {
            let defaults = ColorProfilerConfig::default();
            let profiler = ColorProfiler::new(ColorProfilerConfig {
                n_colors: n_colors.unwrap_or(defaults.n_colors),
                resize_dim: resize_dim.unwrap_or(defaults.resize_dim),
                random_seed: seed.unwrap_or(defaults.random_seed),
                ..defaults
            });
            let pixels = image::open(&image)?.to_rgb8();
            let colors = profiler.profile(&pixels)?;
            println!("{}", serde_json::to_string_pretty(&colors)?);
        }
    }

    Ok(())
}

async fn run_profile(
    mut req: ProfileRequest,
    args: &RunArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = Arc::new(HttpImageResolver::new()?);
    if let Some(board) = req.board_url.take() {
        let mut sources = resolver.board_sources(&board).await?;
        sources.append(&mut req.sources);
        req.sources = sources;
    }

    let run_id = Uuid::new_v4();
    let config = req.pipeline_config();
    let pipeline = if req.annotate {
        let model = req
            .model
            .clone()
            .or_else(|| std::env::var("STYLE_PROFILE_MODEL").ok())
            .unwrap_or_else(|| DEFAULT_ANNOTATION_MODEL.to_string());
        let gateway = ProviderGateway::from_env(Arc::new(TracingUsageSink)).map_err(|e| {
            format!("{e} (set OPENROUTER_API_KEY or pass --no-annotate for colors only)")
        })?;
        let annotator = GatewayAnnotator::new(Arc::new(gateway))
            .model(model)
            .job(run_id);
        AggregationPipeline::new(resolver, Arc::new(annotator), config)
    } else {
        AggregationPipeline::color_only(resolver, config)
    };
    let pipeline = pipeline.with_run_id(run_id);

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted; finishing in-flight items");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let run = run_with_trace_file(
        &pipeline,
        &req.sources,
        Some(cancel.as_ref()),
        args.trace.clone(),
    )
    .await?;
    let report = build_report(&run, &SummaryConfig::default());

    let rendered = match args.format {
        ReportFormat::Json => serde_json::to_string_pretty(&report)?,
        ReportFormat::Md => render_report_markdown(&report),
    };
    match &args.out {
        Some(path) => std::fs::write(path, rendered)?,
        None => println!("{rendered}"),
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn read_sources_file(path: &Path) -> Result<Vec<String>, io::Error> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
