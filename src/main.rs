//! calibrix CLI - resumable calibration of stochastic simulation models.

use anyhow::{bail, Context, Result};
use calibrix::{
    CalibConfig, CalibManager, CalibrationOutcome, Collaborators, FileScorer, LocalPool, Location,
    Plotter, PriorDistribution, ResumePoint, StdinDecider, SummaryLogger, EXAMPLE_CONFIG,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "calibrix")]
#[command(version)]
#[command(about = "Resumable calibration of stochastic simulation models via IMIS")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "calibrix.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Answer yes to every confirmation prompt
    #[arg(short = 'y', long, global = true)]
    yes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new calibration
    Run,

    /// Resume a calibration from its last saved state
    Resume {
        /// Iteration to resume (default: latest)
        #[arg(short, long)]
        iteration: Option<u32>,

        /// Stage to resume at: commission, analyze, plot or next_point
        /// (default: what the iteration reached)
        #[arg(short, long)]
        stage: Option<ResumePoint>,
    },

    /// Re-score stored simulation outputs and continue from there
    Reanalyze {
        /// Iteration to re-score (default: latest)
        #[arg(short, long)]
        iteration: Option<u32>,
    },

    /// Replay plotting for every iteration
    Replot,

    /// Delete run outputs and the calibration directory
    Cleanup,

    /// Cancel the in-flight run of the latest iteration
    Kill,

    /// Show calibration progress
    Status,

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact();
    let result = match EnvFilter::try_from_default_env() {
        Ok(filter) => tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish()),
        Err(_) => tracing::subscriber::set_global_default(builder.finish()),
    };
    if let Err(e) = result {
        eprintln!("Failed to set log subscriber: {e}");
    }
}

fn load_config(path: &Path) -> Result<CalibConfig> {
    let config = CalibConfig::from_file(path)
        .with_context(|| format!("Failed to load config from {path:?}"))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {path:?}"))?;
    Ok(config)
}

fn build_manager(config: CalibConfig, assume_yes: bool) -> Result<CalibManager> {
    if config.calibration.location != Location::Local {
        bail!(
            "location '{}' needs an external execution backend; this binary only runs locally",
            config.calibration.location
        );
    }

    let site_names = config.sites.iter().map(|s| s.name.clone()).collect();
    let backend = LocalPool::new(&config.backend, site_names, config.run_dir())
        .context("Failed to create local pool")?;
    let plotters: Vec<Arc<dyn Plotter>> =
        vec![Arc::new(SummaryLogger::new(config.calibration.num_to_plot))];
    let collaborators = Collaborators {
        backend: Arc::new(backend),
        scorer: Arc::new(FileScorer::new(config.backend.score_file.clone())),
        decider: Arc::new(StdinDecider::new(assume_yes)),
        plotters,
    };

    let manager = CalibManager::new(config, collaborators).context("Failed to set up calibration")?;

    // Ctrl-C interrupts the wait; state is already on disk.
    let token = manager.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current poll");
            token.cancel();
        }
    });

    Ok(manager)
}

fn print_outcome(outcome: &CalibrationOutcome) {
    println!("\n=== Calibration Complete ===");
    println!("Iterations:  {}", outcome.iteration + 1);
    println!(
        "Stopped by:  {}",
        if outcome.converged { "convergence" } else { "iteration limit" }
    );
    println!("Samples:     {}", outcome.final_samples.len());
    println!("Parameters:  {}", outcome.final_samples.param_names.join(", "));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            println!("{EXAMPLE_CONFIG}");
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            let prior = PriorDistribution::new(config.parameters.clone())
                .context("Invalid parameter priors")?;
            config
                .algorithm
                .build(prior, config.calibration.seed)
                .context("Invalid algorithm settings")?;

            info!("Configuration is valid");
            info!("  Calibration: {}", config.calibration.name);
            info!("  Parameters: {}", config.param_names().join(", "));
            info!(
                "  Sites: {} with {} analyzers",
                config.sites.len(),
                config.sites.iter().map(|s| s.analyzers.len()).sum::<usize>()
            );
            info!("  Max iterations: {}", config.calibration.max_iterations);
        }

        Commands::Run => {
            let config = load_config(&cli.config)?;
            let mut manager = build_manager(config, cli.yes)?;
            let outcome = manager.run().await.context("Calibration failed")?;
            print_outcome(&outcome);
        }

        Commands::Resume { iteration, stage } => {
            let config = load_config(&cli.config)?;
            let mut manager = build_manager(config, cli.yes)?;
            let outcome = manager
                .resume(iteration, stage)
                .await
                .context("Resume failed")?;
            print_outcome(&outcome);
        }

        Commands::Reanalyze { iteration } => {
            let config = load_config(&cli.config)?;
            let mut manager = build_manager(config, cli.yes)?;
            let outcome = manager
                .reanalyze(iteration)
                .await
                .context("Reanalysis failed")?;
            print_outcome(&outcome);
        }

        Commands::Replot => {
            let config = load_config(&cli.config)?;
            let manager = build_manager(config, cli.yes)?;
            let plotted = manager.replot().await.context("Replot failed")?;
            println!("Replotted {plotted} iteration(s)");
        }

        Commands::Cleanup => {
            let config = load_config(&cli.config)?;
            let manager = build_manager(config, cli.yes)?;
            manager.cleanup().await.context("Cleanup failed")?;
            println!("Removed {}", manager.store().dir().display());
        }

        Commands::Kill => {
            let config = load_config(&cli.config)?;
            let manager = build_manager(config, cli.yes)?;
            if manager.kill().await.context("Kill failed")? {
                println!("Cancelled the running iteration");
            } else {
                println!("No run in flight");
            }
        }

        Commands::Status => {
            let config = load_config(&cli.config)?;
            let manager = build_manager(config, cli.yes)?;
            let status = manager.status().context("Failed to read calibration")?;
            println!("{status}");
        }
    }

    Ok(())
}
