// Cooperative ledger node entry point

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coop_config::NodeConfig;
use coop_ledger::{Distribution, Ledger};
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

/// Cooperative ledger node
#[derive(Parser, Debug)]
#[command(author, version, about = "Cooperative credit and capital ledger node")]
struct Args {
    /// Path to configuration file (defaults to COOP_CONFIG_FILE or built-in defaults)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the ledger database path
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the collateral sweep and profit distribution on their schedules
    Run,
    /// Run the collateral sweep once
    Sweep,
    /// Distribute the profit pool once
    Distribute {
        /// Distribute even if the interval since the last run has not passed
        #[arg(long)]
        force: bool,
    },
    /// Print the admin approval queue
    Pending,
    /// Check balance conservation for every member
    Audit,
    /// Create the ledger database and schema
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path).context("Failed to load configuration file")?,
        None => NodeConfig::from_env().context("Failed to load configuration")?,
    };
    if let Some(database) = args.database {
        config.database_path = database;
    }

    let default_level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        config.log_level.parse().unwrap_or(LevelFilter::INFO)
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Opening ledger at {}", config.database_path.display());
    let ledger = Arc::new(
        Ledger::open(&config.database_path, config.ledger.clone())
            .context("Failed to open ledger database")?,
    );

    match args.command {
        Command::Init => {
            info!("Ledger initialized at {}", config.database_path.display());
        }
        Command::Sweep => {
            let report = ledger.run_collateral_sweep().context("Collateral sweep failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Distribute { force } => {
            let outcome = if force {
                ledger.distribute_profits()
            } else {
                ledger.distribute_if_due()
            }
            .context("Profit distribution failed")?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Pending => {
            let items = ledger.list_pending().context("Failed to list pending items")?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Command::Audit => {
            let drifted = ledger.audit_all().context("Audit failed")?;
            if drifted.is_empty() {
                info!("All member balances match their completed transactions");
            } else {
                println!("{}", serde_json::to_string_pretty(&drifted)?);
                anyhow::bail!("{} members have balance drift", drifted.len());
            }
        }
        Command::Run => run(ledger, &config).await?,
    }

    Ok(())
}

/// Run both scheduled jobs until Ctrl+C
async fn run(ledger: Arc<Ledger>, config: &NodeConfig) -> Result<()> {
    let sweep_every = hours(config.ledger.sweep.interval_hours);
    let distribute_every = hours(config.ledger.distribution.interval_hours);
    info!(
        "Node running: sweep every {:?}, distribution every {:?}; press Ctrl+C to exit",
        sweep_every, distribute_every
    );

    let mut sweep_timer = interval(sweep_every);
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut distribution_timer = interval(distribute_every);
    distribution_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = sweep_timer.tick() => {
                let ledger = ledger.clone();
                match tokio::task::spawn_blocking(move || ledger.run_collateral_sweep()).await {
                    Ok(Ok(report)) if !report.failures.is_empty() => {
                        warn!("Collateral sweep finished with {} failures", report.failures.len());
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("Collateral sweep failed: {}", e),
                    Err(e) => error!("Collateral sweep task panicked: {}", e),
                }
            }
            _ = distribution_timer.tick() => {
                let ledger = ledger.clone();
                match tokio::task::spawn_blocking(move || ledger.distribute_if_due()).await {
                    Ok(Ok(Distribution::Distributed(report))) => {
                        info!(
                            "Distributed {} to {} members",
                            report.distributed, report.members_paid
                        );
                    }
                    Ok(Ok(Distribution::Skipped { reason })) => {
                        info!("Profit distribution skipped: {:?}", reason)
                    }
                    Ok(Err(e)) => error!("Profit distribution failed: {}", e),
                    Err(e) => error!("Profit distribution task panicked: {}", e),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Shutting down node...");
                break;
            }
        }
    }

    info!("Node shutdown complete");
    Ok(())
}

fn hours(n: i64) -> Duration {
    Duration::from_secs(n.max(1) as u64 * 3600)
}
