mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use eyelign_core::{
    AlignMode, AlignOptions, AlignSettings, Batch, DetectOptions, PersistPolicy, ScrfdDetector,
    TargetSize,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "eyelign", about = "Align a directory of face photos on the eyes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect eye positions and record them in the directory's cache
    Detect {
        #[command(flatten)]
        detect: DetectArgs,
    },
    /// Write aligned copies of every image with known eye positions
    Align {
        /// Directory of source photos
        input: PathBuf,
        #[command(flatten)]
        align: AlignArgs,
        /// Number of worker threads
        #[arg(short, long)]
        jobs: Option<usize>,
    },
    /// Detect, then align
    Run {
        #[command(flatten)]
        detect: DetectArgs,
        #[command(flatten)]
        align: AlignArgs,
    },
    /// Show detection progress and list images missing eye positions
    Status {
        /// Directory of source photos
        input: PathBuf,
    },
}

#[derive(Args)]
struct DetectArgs {
    /// Directory of source photos
    input: PathBuf,
    /// Number of worker threads
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Cache write policy: "record" (after every image) or "batch" (once)
    #[arg(long, value_parser = persist_arg)]
    persist: Option<PersistPolicy>,
    /// Directory containing det_10g.onnx
    #[arg(long)]
    model_dir: Option<PathBuf>,
}

#[derive(Args)]
struct AlignArgs {
    /// Empty (or absent) directory for the aligned images
    output: PathBuf,
    /// Output width in pixels
    #[arg(long)]
    width: u32,
    /// Output height in pixels
    #[arg(long)]
    height: u32,
    /// Eye distance as a percentage of the output width
    #[arg(long)]
    eye_width_pct: Option<f64>,
    /// Align the images that have eyes and skip the rest
    #[arg(long)]
    ignore_missing: bool,
    /// Mark detected eyes on unmodified copies instead of aligning
    #[arg(long)]
    debug: bool,
}

fn persist_arg(value: &str) -> Result<PersistPolicy, String> {
    config::parse_persist(value).ok_or_else(|| format!("expected \"record\" or \"batch\", got \"{value}\""))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Detect { detect } => {
            detect_phase(&config, &detect)?;
        }
        Commands::Align { input, align, jobs } => {
            let batch = open_batch(&input)?;
            align_phase(&config, &batch, &align, jobs)?;
        }
        Commands::Run { detect, align } => {
            let batch = detect_phase(&config, &detect)?;
            align_phase(&config, &batch, &align, detect.jobs)?;
        }
        Commands::Status { input } => {
            let batch = open_batch(&input)?;
            let summary = batch.summary();
            println!("images:      {}", summary.total);
            println!("found:       {}", summary.found);
            println!("missing:     {}", summary.missing);
            println!("attempted:   {}", summary.previously_attempted);
            println!("cache:       {}", batch.cache_path().display());
            for record in batch.missing() {
                let note = if record.detection_attempted() {
                    "no eyes found"
                } else {
                    "not yet detected"
                };
                println!("  {} ({note})", record.identity());
            }
        }
    }

    Ok(())
}

fn open_batch(input: &Path) -> Result<Batch> {
    Batch::open(input).with_context(|| format!("failed to open input directory {}", input.display()))
}

fn detect_phase(config: &Config, args: &DetectArgs) -> Result<Batch> {
    let mut batch = open_batch(&args.input)?;

    if batch.records().iter().all(|r| r.detection_attempted()) {
        tracing::info!("every image was already attempted, not loading the model");
        batch.summary().log("detection", 0);
        return Ok(batch);
    }

    let model_path = args
        .model_dir
        .as_ref()
        .map(|dir| dir.join(eyelign_core::SCRFD_MODEL_FILE))
        .unwrap_or_else(|| config.scrfd_model_path());
    let detector = ScrfdDetector::load(&model_path)
        .with_context(|| format!("failed to load SCRFD model from {}", model_path.display()))?;

    let options = DetectOptions {
        concurrency: args.jobs.or(config.jobs),
        persist: args.persist.unwrap_or(config.persist),
    };
    let report = batch
        .detect_all(&detector, &options)
        .context("eye detection failed")?;
    tracing::info!(
        dispatched = report.dispatched,
        cache_writes = report.cache_writes,
        "detection pass complete"
    );
    Ok(batch)
}

fn align_phase(config: &Config, batch: &Batch, args: &AlignArgs, jobs: Option<usize>) -> Result<()> {
    let mode = if args.debug {
        AlignMode::Debug
    } else {
        AlignMode::Normal
    };
    let settings = AlignSettings::new(
        TargetSize::new(args.width, args.height),
        args.eye_width_pct.unwrap_or(config.eye_width_pct),
        mode,
    )
    .context("invalid alignment settings")?;
    let options = AlignOptions {
        concurrency: jobs.or(config.jobs),
        ignore_missing: args.ignore_missing,
    };

    let report = batch
        .align_all(&args.output, &settings, &options)
        .context("alignment failed")?;
    if report.failed > 0 {
        anyhow::bail!("{} images failed to align, see the log for details", report.failed);
    }
    Ok(())
}
