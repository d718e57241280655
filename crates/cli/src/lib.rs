use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use folio_core::{
    DocumentId, PageStatus, PriorityBand, SessionStats, ViewerConfig, ViewerEvent, ViewerRuntime,
};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub mod synthetic;
pub mod trace;

use synthetic::{SyntheticFetcher, SyntheticMetadata, SyntheticRenderer};
use trace::TraceStep;

#[derive(Debug, Parser)]
#[command(name = "folio")]
#[command(about = "Viewport-driven page cache and scheduler")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replay a scroll trace against synthetic collaborators and print JSON statistics.
    Simulate(SimulateArgs),
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Print the default configuration file location instead.
        #[arg(long)]
        path: bool,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, clap::Args)]
struct SimulateArgs {
    /// Trace file; without one a steady scroll from --from to --to is replayed.
    #[arg(long, value_name = "FILE")]
    trace: Option<PathBuf>,
    #[arg(long, default_value_t = 200)]
    pages: u32,
    #[arg(long, default_value_t = 1)]
    from: u32,
    #[arg(long, default_value_t = 40)]
    to: u32,
    /// Time between scroll samples of the generated trace.
    #[arg(long, default_value_t = 50)]
    interval_ms: u64,
    /// Pages visible at once, starting at the current page.
    #[arg(long, default_value_t = 1)]
    visible: u32,
    /// Configuration file; `FOLIO_*` environment variables are used otherwise.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Fixed render slot pool size.
    #[arg(long)]
    slots: Option<usize>,
    #[arg(long, default_value_t = 20)]
    fetch_latency_ms: u64,
    #[arg(long, default_value_t = 5)]
    render_latency_ms: u64,
    #[arg(long, default_value_t = 4096)]
    payload_bytes: usize,
    /// Page whose fetch always fails; may be repeated.
    #[arg(long = "fail-page", value_name = "PAGE")]
    fail_pages: Vec<u32>,
    /// Time allowed for outstanding work after the last step.
    #[arg(long, default_value_t = 500)]
    settle_ms: u64,
}

#[derive(Debug, Default, Serialize)]
struct EventCounts {
    page_ready: usize,
    page_failed: usize,
    render_ready: usize,
    render_failed: usize,
    evicted: usize,
    needs_reload: usize,
}

impl EventCounts {
    fn record(&mut self, event: &ViewerEvent) {
        match event {
            ViewerEvent::PageReady { .. } => self.page_ready += 1,
            ViewerEvent::PageFailed { .. } => self.page_failed += 1,
            ViewerEvent::RenderReady { .. } => self.render_ready += 1,
            ViewerEvent::RenderFailed { .. } => self.render_failed += 1,
            ViewerEvent::Evicted { .. } => self.evicted += 1,
            ViewerEvent::NeedsReload { .. } => self.needs_reload += 1,
        }
    }
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    document: String,
    page_count: u32,
    steps: usize,
    final_page: u32,
    cached_pages: Vec<u32>,
    failed_pages: Vec<u32>,
    events: EventCounts,
    stats: SessionStats,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Simulate(args) => run_simulate(args),
        Commands::Config { config, path } => run_config(config.as_deref(), path),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ViewerConfig> {
    match path {
        Some(path) => {
            ensure_file_exists(path)?;
            ViewerConfig::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => ViewerConfig::from_env().context("invalid FOLIO_* environment configuration"),
    }
}

fn run_config(config: Option<&Path>, path: bool) -> Result<()> {
    if path {
        println!("{}", ViewerConfig::default_config_path().display());
        return Ok(());
    }
    let config = load_config(config)?;
    print!("{}", config.to_toml()?);
    Ok(())
}

fn run_simulate(args: SimulateArgs) -> Result<()> {
    if args.pages == 0 {
        anyhow::bail!("--pages must be >= 1");
    }
    if args.visible == 0 {
        anyhow::bail!("--visible must be >= 1");
    }

    let mut config = load_config(args.config.as_deref())?;
    if let Some(slots) = args.slots {
        config = config.with_render_slots(slots);
    }
    config.validate().context("invalid configuration")?;

    let steps = match &args.trace {
        Some(path) => {
            ensure_file_exists(path)?;
            let source = fs::read_to_string(path)
                .with_context(|| format!("failed to read trace {}", path.display()))?;
            trace::parse(&source)?
        }
        None => trace::linear(args.from, args.to, Duration::from_millis(args.interval_ms)),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to start async runtime")?;
    let report = runtime.block_on(simulate(&args, config, &steps))?;

    let json = serde_json::to_string_pretty(&report)?;
    println!("{json}");
    Ok(())
}

async fn simulate(args: &SimulateArgs, config: ViewerConfig, steps: &[TraceStep]) -> Result<SimulationReport> {
    let document = DocumentId::new("synthetic.pdf");
    let fetcher = Arc::new(SyntheticFetcher {
        latency: Duration::from_millis(args.fetch_latency_ms),
        payload_size: args.payload_bytes,
        failing: args.fail_pages.clone(),
    });
    let renderer = Arc::new(SyntheticRenderer {
        latency: Duration::from_millis(args.render_latency_ms),
    });
    let metadata = Arc::new(SyntheticMetadata {
        page_count: args.pages,
    });

    let (viewer, mut events) = ViewerRuntime::start(config, document.clone(), fetcher, renderer, metadata)
        .await
        .context("failed to start viewer")?;

    let mut current = 1;
    for (index, step) in steps.iter().enumerate() {
        let result = match step {
            TraceStep::Scroll(page) | TraceStep::Jump(page) => {
                let scrolling = matches!(step, TraceStep::Scroll(_));
                viewer
                    .viewport_changed(*page, visible_pages(*page, args.visible, args.pages), scrolling)
                    .await
            }
            TraceStep::Wait(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
            TraceStep::Zoom(scale) => viewer.zoom(*scale).await,
            TraceStep::Rotate(degrees) => viewer.rotate(*degrees).await,
            TraceStep::Request(page) => viewer.request_page(*page, PriorityBand::Visible).await,
            TraceStep::Pressure => viewer.memory_pressure(),
        };
        result.with_context(|| format!("step {} ({step:?}) rejected", index + 1))?;
        if let Some(page) = step.landing_page() {
            current = page;
        }
    }

    tokio::time::sleep(Duration::from_millis(args.settle_ms)).await;

    let mut cached_pages = Vec::new();
    let mut failed_pages = Vec::new();
    for page in 1..=args.pages {
        match viewer.status(page).await?.0 {
            PageStatus::Cached => cached_pages.push(page),
            PageStatus::Failed => failed_pages.push(page),
            _ => {}
        }
    }
    let stats = viewer.stats().await?;
    viewer.stop().await;

    let mut counts = EventCounts::default();
    while let Some(event) = events.recv().await {
        counts.record(&event);
    }

    Ok(SimulationReport {
        document: document.to_string(),
        page_count: args.pages,
        steps: steps.len(),
        final_page: current,
        cached_pages,
        failed_pages,
        events: counts,
        stats,
    })
}

fn visible_pages(current: u32, visible: u32, page_count: u32) -> Vec<u32> {
    let last = current.saturating_add(visible - 1).min(page_count);
    (current..=last).collect()
}

fn ensure_file_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}
