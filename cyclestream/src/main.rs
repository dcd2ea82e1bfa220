//! Cyclestream CLI - runs and validates pipeline configurations.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cyclestream::cancellation::CancellationToken;
use cyclestream::config::{ExecutionMode, PipelineConfig};
use cyclestream::observability::{init_tracing, LogFormat};
use cyclestream::pipeline::RunReport;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "cyclestream", version, about = "Incremental bronze/silver pipelines for bike-share and weather feeds")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a pipeline.
    Run {
        /// Pipeline configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Overrides the configured execution mode.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// Check a configuration without running anything.
    Validate {
        /// Pipeline configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the bike-share pipeline configuration.
    Defaults {
        /// Directory holding the source folders.
        #[arg(long, default_value = ".")]
        source_root: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Batch,
    Streaming,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Batch => Self::Batch,
            ModeArg::Streaming => Self::Streaming,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = execute(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { config, mode } => {
            let mut config = load(&config)?;
            if let Some(mode) = mode {
                config.mode = mode.into();
            }
            if cli.json_logs {
                config.log.format = LogFormat::Json;
            }
            init_tracing(&config.log);
            run(&config).await
        }
        Commands::Validate { config } => {
            let config = load(&config)?;
            config.validate().context("configuration is invalid")?;
            println!(
                "{}: {} sources, {} flatten stages, {} merge stages",
                config.name,
                config.sources.len(),
                config.flatten.len(),
                config.merge.len()
            );
            Ok(())
        }
        Commands::Defaults { source_root } => {
            let config = PipelineConfig::bike_share_defaults(source_root);
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::from_json_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

async fn run(config: &PipelineConfig) -> Result<()> {
    let runner = config
        .build_runner()
        .await
        .context("failed to prepare pipeline")?;
    let cancel = CancellationToken::new();

    let interrupted = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, finishing in-flight stages");
                cancel.cancel("interrupted");
            }
            Err(e) => warn!(error = %e, "Cannot listen for interrupts"),
        }
    };

    let run = runner.run(config.run_mode(), &cancel);
    tokio::pin!(run);
    let report = tokio::select! {
        report = &mut run => report,
        () = interrupted => run.await,
    }
    .context("pipeline run failed")?;

    summarize(&report);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_success() && !report.was_cancelled() {
        bail!("{} stage(s) failed", report.failures.len());
    }
    Ok(())
}

fn summarize(report: &RunReport) {
    let totals = report.total_metrics();
    info!(
        run_id = %report.run_id,
        passes = report.passes,
        committed = report.committed_stages(),
        rows_out = totals.rows_out,
        rows_dropped = totals.rows_dropped,
        violations = totals.total_violations(),
        duration_ms = report.duration_ms,
        "Run finished"
    );
}
