use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use paddock_storage::{MemoryStore, PgStore, RaceStore};
use paddock_sync::reports::{report_recent_runs, write_run_reports};
use paddock_sync::{maybe_build_scheduler, IngestConfig, IngestPipeline, RunReport, SourceRegistry};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "paddock-cli")]
#[command(about = "Race results and exchange price reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one date or an inclusive range (defaults to yesterday).
    Ingest {
        #[arg(long, conflicts_with_all = ["from", "to"])]
        date: Option<NaiveDate>,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
        /// Match and report against an in-memory store; nothing reaches Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    Migrate,
    /// Summarize the most recent runs under the reports directory.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run the daily ingestion job until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest {
        date: None,
        from: None,
        to: None,
        dry_run: false,
    }) {
        Commands::Ingest {
            date,
            from,
            to,
            dry_run,
        } => {
            let (from, to) = match (date, from, to) {
                (Some(date), _, _) => (date, date),
                (None, Some(from), Some(to)) => (from, to),
                _ => {
                    let yesterday = Utc::now()
                        .date_naive()
                        .pred_opt()
                        .context("no previous calendar day")?;
                    (yesterday, yesterday)
                }
            };
            if from > to {
                bail!("--from {from} is after --to {to}");
            }

            let pipeline = build_pipeline(config, dry_run).await?;
            let run = pipeline.run_range(from, to).await;
            let reports_dir = write_run_reports(&pipeline.config().reports_dir, &run).await?;
            print_summary(&run);
            println!("reports: {}", reports_dir.display());
            if run.failed() > 0 {
                bail!("{} of {} dates failed", run.failed(), run.dates.len());
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs(&config.reports_dir, runs)?);
        }
        Commands::Schedule => {
            let config = IngestConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(build_pipeline(config, false).await?);
            let Some(sched) = maybe_build_scheduler(pipeline).await? else {
                bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}

async fn build_pipeline(config: IngestConfig, dry_run: bool) -> Result<IngestPipeline> {
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let store: Arc<dyn RaceStore> = if dry_run {
        info!("dry run: writing to an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(PgStore::connect(&config.database_url).await?)
    };
    IngestPipeline::new(config, &registry, store)
}

fn print_summary(run: &RunReport) {
    println!(
        "run {}: {} dates ({} ok, {} failed)",
        run.run_id,
        run.dates.len(),
        run.succeeded(),
        run.failed()
    );
    for outcome in &run.dates {
        match &outcome.report {
            Some(report) => println!(
                "  {} matched {}/{} races, priced {}/{} runners",
                outcome.date,
                report.matching.matched,
                report.matching.races,
                report.matching.runners_priced,
                report.matching.runners
            ),
            None => println!(
                "  {} failed: {}",
                outcome.date,
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}
