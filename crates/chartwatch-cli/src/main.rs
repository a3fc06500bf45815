use std::path::PathBuf;

use anyhow::Result;
use chartwatch_sync::{build_orchestrator, run_backfill, run_market_comparison, SyncConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chartwatch")]
#[command(about = "Ranked-chart snapshot and usage-metric reconciliation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Loop forever, running snapshot cycles on the configured schedule.
    Run,
    /// Run exactly one snapshot cycle and exit.
    Once,
    /// Resumable bulk backfill of usage metrics for currently charted items.
    Backfill,
    /// Fetch every market's leading ranks and write an overlap report.
    Compare {
        /// Baseline market for the versus view.
        #[arg(long, default_value = "us")]
        baseline: String,
        /// Output path for the JSON report.
        #[arg(long, default_value = "market-comparison.json")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse first so --help and usage errors never need credentials.
    let cli = Cli::parse();
    // Missing credentials are the one startup error worth dying for;
    // everything later is logged and survived.
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let orchestrator = build_orchestrator(config).await?;
            info!("chartwatch starting scheduled snapshot loop");
            tokio::select! {
                _ = orchestrator.run_forever() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                }
            }
        }
        Commands::Once => {
            let orchestrator = build_orchestrator(config).await?;
            let summary = orchestrator.run_cycle(chrono::Utc::now()).await?;
            println!(
                "cycle complete: run_id={} markets={}/{} history_rows={} grid_points={}",
                summary.run_id,
                summary.markets_persisted,
                summary.markets_selected,
                summary.history_rows,
                summary.grid_points
            );
        }
        Commands::Backfill => {
            let summary = run_backfill(config).await?;
            println!(
                "backfill complete: items={} pages={} grid_points={}",
                summary.items_processed, summary.pages_fetched, summary.grid_points_written
            );
        }
        Commands::Compare { baseline, out } => {
            let report = run_market_comparison(&config, Some(&baseline), &out).await?;
            println!(
                "comparison complete: markets={} pairs={} report={}",
                report.markets_compared,
                report.pairwise.len(),
                out.display()
            );
        }
    }

    Ok(())
}
