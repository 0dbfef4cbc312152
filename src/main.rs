//! groupnorm-conformance CLI
//!
//! Exit status: 0 when every case matches, 1 when any case is out of
//! tolerance, 2 when a stage fails before a verdict exists.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use groupnorm_conformance::{Backend, ConformanceHarness, HarnessConfig, EXIT_FATAL, VERSION};

/// Verify that graph conversion preserves group normalization numerics
#[derive(Parser, Debug)]
#[command(name = "groupnorm-conformance")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to a YAML harness config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Conversion/execution backend
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// External converter program
    #[arg(long)]
    pnnx: Option<PathBuf>,

    /// External runner program for converted models
    #[arg(long)]
    runner: Option<PathBuf>,

    /// Directory receiving the artifact and converted files
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Seed for parameters and inputs
    #[arg(long)]
    seed: Option<u64>,
}

impl Cli {
    /// Config file (or defaults) with command-line overrides applied
    fn resolve_config(&self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path).context("Failed to load config")?,
            None => HarnessConfig::default(),
        };

        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(pnnx) = &self.pnnx {
            config.pnnx.program = pnnx.clone();
        }
        if let Some(runner) = &self.runner {
            config.runner.program = runner.clone();
        }
        if let Some(work_dir) = &self.work_dir {
            config.work_dir = work_dir.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }

        config.validate()?;
        Ok(config)
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn create_progress_bar(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb
}

fn run(cli: &Cli) -> Result<i32> {
    let config = cli.resolve_config()?;
    info!(
        "groupnorm-conformance v{} ({:?} backend, work dir {:?})",
        VERSION, config.backend, config.work_dir
    );

    let mut harness = ConformanceHarness::new(config);
    let pb = create_progress_bar("Running conformance check...");
    let outcome = harness.run();
    pb.finish_and_clear();

    let outcome = outcome?;
    outcome.report.print_summary();
    Ok(outcome.exit_code())
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}
