use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fome_connectors::SourceQuery;
use fome_engine::MatchPipeline;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "fome-cli")]
#[command(about = "FOME command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one aggregation cycle and print per-source results.
    Aggregate {
        /// Keywords forwarded to sources that support keyword search.
        keywords: Vec<String>,
    },
    /// Serve the JSON API (and the refresh scheduler when enabled).
    Serve,
    /// Run only the scheduled refresh loop, no API.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Aggregate { keywords } => {
            let pipeline = MatchPipeline::from_env().await?;
            let query = SourceQuery {
                keywords,
                geo: None,
            };
            let summary = pipeline.refresh_cycle_with(&query).await?;
            println!(
                "aggregation complete: run_id={} records={}",
                summary.run_id, summary.canonical_records
            );
            for report in &summary.sources {
                println!(
                    "  {:<24} {:?} records={}{}",
                    report.source_id,
                    report.health,
                    report.records,
                    report
                        .detail
                        .as_deref()
                        .map(|d| format!(" ({d})"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Serve => {
            let pipeline = Arc::new(MatchPipeline::from_env().await?);
            if let Some(scheduler) = pipeline.maybe_build_scheduler().await? {
                scheduler.start().await?;
                info!("refresh scheduler started");
            }
            fome_web::serve_from_env(pipeline).await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(MatchPipeline::from_env().await?);
            match pipeline.maybe_build_scheduler().await? {
                Some(scheduler) => {
                    scheduler.start().await?;
                    info!("refresh scheduler running, ctrl-c to stop");
                    tokio::signal::ctrl_c().await?;
                }
                None => {
                    eprintln!("scheduler disabled; set FOME_SCHEDULER_ENABLED=1");
                }
            }
        }
    }

    Ok(())
}
