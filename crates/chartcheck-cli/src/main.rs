//! chartcheck - pre-deploy validation for cluster application charts.
//!
//! Discovers the charts referenced by each environment's ApplicationSets,
//! renders them, schema-validates the output, and verifies that every
//! referenced container image exists in its registry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use chartcheck_core::appset;
use chartcheck_core::config::CheckConfig;
use chartcheck_core::exec::SystemExecutor;
use chartcheck_core::pipeline::{ChartChecker, ChartSpec, CheckOutcome, RenderOutcome};

/// chartcheck - chart fleet validation
#[derive(Parser, Debug)]
#[command(name = "chartcheck")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run all checks against the charts of the selected environment(s):
    /// render, schema-validate, extract images, verify images exist
    RunChecks(RunArgs),

    /// Render the charts without performing validations
    RenderOnly(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Only process this environment (folder name under --envdir)
    #[arg(long)]
    env: Option<String>,

    /// Base directory containing environment folders
    #[arg(long, default_value = "../env")]
    envdir: PathBuf,

    /// Output directory for rendered charts
    #[arg(long, default_value = "manifests")]
    output: PathBuf,

    /// Worker tasks per pipeline stage
    #[arg(long, default_value_t = 10)]
    jobs: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl RunArgs {
    fn to_config(&self) -> CheckConfig {
        let mut config = CheckConfig::new()
            .with_env_dir(self.envdir.clone())
            .with_output_dir(self.output.clone())
            .with_worker_count(self.jobs);
        if let Some(env) = &self.env {
            config = config.with_env(env.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Commands::RunChecks(args) | Commands::RenderOnly(args) => args.verbose,
    };
    let filter = if verbose {
        EnvFilter::new("chartcheck=debug,chartcheck_core=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::RunChecks(args) => run_checks(&args).await,
        Commands::RenderOnly(args) => render_only(&args).await,
    }
}

/// Discovers charts and feeds them into a started pipeline.
fn discover_and_feed(
    config: &CheckConfig,
    input: tokio::sync::mpsc::Sender<ChartSpec>,
) -> Result<usize> {
    debug!(?config, "resolved configuration");
    let charts = appset::find_charts(&config.env_dir, config.env.as_deref(), &config.src_prefix)
        .context("failed to find charts in ApplicationSets")?;
    println!("Found {} charts to process.", charts.len());

    let count = charts.len();
    tokio::spawn(async move {
        for chart in charts {
            if input.send(chart).await.is_err() {
                break;
            }
        }
        // Dropping the sender ends the stream and starts the shutdown
        // cascade once the stages drain.
    });
    Ok(count)
}

async fn run_checks(args: &RunArgs) -> Result<()> {
    println!("Starting chart checks...");
    let config = args.to_config();

    let checker = ChartChecker::new(Arc::new(SystemExecutor), config.output_dir.clone())
        .with_worker_count(config.worker_count);
    let (mut handle, input) = checker.start().context("failed to start pipeline")?;
    discover_and_feed(&config, input)?;

    let mut success = true;
    let mut interrupted = false;
    loop {
        tokio::select! {
            outcome = handle.next_outcome() => {
                let Some(outcome) = outcome else { break };
                print_check_outcome(&outcome);
                if !outcome.passed() {
                    success = false;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                eprintln!("Interrupted; cancelling outstanding checks...");
                handle.cancel();
                interrupted = true;
            }
        }
    }

    if interrupted {
        bail!("chart checks were interrupted");
    }
    if success {
        println!("All chart checks completed successfully.");
        Ok(())
    } else {
        println!("Some chart checks failed. See above for details.");
        bail!("one or more chart checks failed");
    }
}

async fn render_only(args: &RunArgs) -> Result<()> {
    println!("Starting chart renders...");
    let config = args.to_config();

    let checker = ChartChecker::new(Arc::new(SystemExecutor), config.output_dir.clone())
        .with_worker_count(config.worker_count);
    let (mut handle, input) = checker
        .start_render_only()
        .context("failed to start renderer")?;
    discover_and_feed(&config, input)?;

    let mut success = true;
    while let Some(outcome) = handle.next_outcome().await {
        print_render_outcome(&outcome);
        if outcome.error.is_some() {
            success = false;
        }
    }

    if success {
        println!("All chart renders completed successfully.");
        Ok(())
    } else {
        println!("Some chart renders failed. See above for details.");
        bail!("one or more chart renders failed");
    }
}

fn print_check_outcome(outcome: &CheckOutcome) {
    let chart = &outcome.chart;
    match (&outcome.image, &outcome.error) {
        (Some(image), None) => println!(
            ">>> chart {} {} from env {} with image {}: ✓ All checks passed",
            chart.chart_name, chart.chart_version, chart.env, image
        ),
        (Some(image), Some(error)) => println!(
            ">>> chart {} {} from env {} with image {}: ✗ Error: {}",
            chart.chart_name, chart.chart_version, chart.env, image, error
        ),
        (None, Some(error)) => println!(
            ">>> chart {} {} from env {}: ✗ Error: {}",
            chart.chart_name, chart.chart_version, chart.env, error
        ),
        // An outcome always carries an image or an error; nothing to say
        // otherwise.
        (None, None) => {}
    }
}

fn print_render_outcome(outcome: &RenderOutcome) {
    let chart = &outcome.chart;
    match (&outcome.manifest_path, &outcome.error) {
        (Some(path), _) => println!(
            ">>> chart {} {} from env {}: ✓ Rendered successfully to {}",
            chart.chart_name,
            chart.chart_version,
            chart.env,
            path.display()
        ),
        (None, Some(error)) => println!(
            ">>> chart {} {} from env {}: ✗ Error: {}",
            chart.chart_name, chart.chart_version, chart.env, error
        ),
        (None, None) => {}
    }
}
