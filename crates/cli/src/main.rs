//! CLI entry point for the VMAF transcoder
//!
//! Resolves the input files, merges configuration sources and runs the pipeline
//! once. Exits non-zero only when the run could not be carried out; abandoned
//! files are reported in the outcome table.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vmaf_transcoder::config::MAX_CQ;
use vmaf_transcoder::{
    derive_plan, resolve_inputs, run_startup_checks, Config, EncodeSettings, Pipeline,
    RunOptions, RunSummary, TaskOutcome,
};

/// Batch re-encoder that keeps the highest cq meeting a VMAF threshold
#[derive(Parser, Debug)]
#[command(name = "vmaf-transcode")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input files, directories or glob patterns
    #[arg(short, long, required = true, num_args = 1..)]
    input: Vec<String>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Constant-quality value of the first attempt
    #[arg(long = "init-cq", value_parser = clap::value_parser!(u32).range(0..=MAX_CQ as i64))]
    init_cq: Option<u32>,

    /// Minimum VMAF score a candidate must reach
    #[arg(short = 'q', long)]
    quality_threshold: Option<f64>,

    /// Threads per VMAF measurement (0 = all cores)
    #[arg(short, long)]
    threads: Option<u32>,

    /// Parallel encode workers
    #[arg(long)]
    transcode_workers: Option<u32>,

    /// Parallel VMAF workers
    #[arg(long)]
    vmaf_workers: Option<u32>,

    /// Give up on a file after this many unmeasurable VMAF runs (0 = never)
    #[arg(long)]
    max_measure_attempts: Option<u32>,

    /// Path to a configuration file (config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log every external command and debug events
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Skip startup checks (ffmpeg, encoder, libvmaf). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Write the run summary as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

impl Args {
    fn apply_overrides(&self, cfg: &mut Config) {
        if let Some(dir) = &self.output {
            cfg.encode.output_dir = dir.clone();
        }
        if let Some(cq) = self.init_cq {
            cfg.encode.initial_cq = cq;
        }
        if let Some(threshold) = self.quality_threshold {
            cfg.quality.threshold = threshold;
        }
        if let Some(threads) = self.threads {
            cfg.quality.threads = threads;
        }
        if let Some(workers) = self.transcode_workers {
            cfg.workers.encode = workers;
        }
        if let Some(workers) = self.vmaf_workers {
            cfg.workers.quality = workers;
        }
        if let Some(attempts) = self.max_measure_attempts {
            // 0 lifts the cap, as VMAF_MAX_MEASURE_ATTEMPTS=0 does
            cfg.quality.max_measure_attempts = (attempts > 0).then_some(attempts);
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<Config, String> {
    let mut cfg = match &args.config {
        Some(path) => Config::load(path)
            .map_err(|e| format!("{} ({})", e, path.display()))?,
        None => Config::from_env().map_err(|e| e.to_string())?,
    };

    args.apply_overrides(&mut cfg);
    cfg.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

fn outcome_cell(outcome: Option<&TaskOutcome>) -> String {
    match outcome {
        Some(TaskOutcome::Accepted { cq, score }) => format!("accepted cq={} vmaf={:.2}", cq, score),
        Some(TaskOutcome::Abandoned(reason)) => format!("abandoned: {}", reason),
        None => "unfinished".to_string(),
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{:<48} {:<10} OUTCOME", "SOURCE", "ATTEMPTS");
    for task in &summary.tasks {
        println!(
            "{:<48} {:<10} {}",
            task.source.display(),
            task.encode_runs,
            outcome_cell(task.outcome.as_ref())
        );
    }
    println!();
    println!(
        "{} accepted, {} abandoned, {} files",
        summary.accepted(),
        summary.abandoned(),
        summary.tasks.len()
    );
}

fn write_report(path: &Path, summary: &RunSummary) -> Result<(), String> {
    let json = serde_json::to_string_pretty(summary).map_err(|e| e.to_string())?;
    std::fs::write(path, json).map_err(|e| format!("{} ({})", e, path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let cfg = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&cfg) {
        error!("Startup check failed: {}", e);
        return ExitCode::FAILURE;
    }

    let inputs = match resolve_inputs(&args.input) {
        Ok(inputs) => inputs,
        Err(e) => {
            error!("Failed to resolve inputs: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if inputs.is_empty() {
        error!("No input files found");
        return ExitCode::FAILURE;
    }

    let plan = derive_plan(&cfg);
    info!(
        cores = plan.total_cores,
        encode_workers = plan.encode_workers,
        quality_workers = plan.quality_workers,
        vmaf_threads = plan.vmaf_threads,
        output_dir = %cfg.encode.output_dir.display(),
        "configuration loaded"
    );

    let options = RunOptions::from_config(&cfg, &plan, args.verbose);
    let pipeline = Pipeline::with_ffmpeg(options, EncodeSettings::from(&cfg.encode));

    let summary = match pipeline.run(&inputs).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Run failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    print_summary(&summary);

    if let Some(path) = &args.report {
        if let Err(e) = write_report(path, &summary) {
            error!("Failed to write report: {}", e);
            return ExitCode::FAILURE;
        }
        info!(path = %path.display(), "report written");
    }

    ExitCode::SUCCESS
}
