use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracmine_sync::{maybe_build_scheduler, IngestPipeline, RunSummary, SyncConfig, TicketOutcome};

#[derive(Debug, Parser)]
#[command(name = "tracmine")]
#[command(about = "Trac ticket ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one listing page of the most recent tickets.
    Recent { count: u32 },
    /// Ingest a single ticket by id.
    Ticket { id: u32 },
    /// Paginate through listing pages, ingesting up to COUNT tickets.
    Bulk { count: usize },
    /// Run migrations and keep the scheduled cadences running until ctrl-c.
    Serve,
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} sync complete: run_id={} attempted={} ingested={} not_found={} failed={}",
        summary.mode,
        summary.run_id,
        summary.attempted,
        summary.ingested,
        summary.not_found,
        summary.failed
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let pipeline = IngestPipeline::from_config(&config).await?;

    match cli.command {
        Commands::Recent { count } => {
            match pipeline.run_recent(count).await? {
                Some(summary) => print_summary(&summary),
                None => println!("skipped: another run is in flight"),
            }
        }
        Commands::Ticket { id } => match pipeline.ingest_ticket(id).await? {
            TicketOutcome::Ingested => println!("ticket {id} ingested"),
            TicketOutcome::NotFound => bail!("ticket {id} not found or inaccessible"),
        },
        Commands::Bulk { count } => {
            match pipeline.run_bulk(count).await? {
                Some(summary) => print_summary(&summary),
                None => println!("skipped: another run is in flight"),
            }
        }
        Commands::Serve => {
            let pipeline = Arc::new(pipeline);
            match maybe_build_scheduler(pipeline, &config).await? {
                Some(sched) => {
                    sched.start().await?;
                    info!(
                        incremental_cron = %config.incremental_cron,
                        bulk_cron = %config.bulk_cron,
                        "scheduler running; press ctrl-c to stop"
                    );
                    tokio::signal::ctrl_c().await?;
                }
                None => {
                    println!("scheduler disabled; set TRACMINE_SCHEDULER_ENABLED=1 to enable");
                }
            }
        }
    }

    Ok(())
}
