use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use n311_sync::{
    build_pipeline, maybe_build_scheduler, run_once_from_env, scan_test_log, LogScanConfig,
    PipelineConfig, RunOutcome,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "n311")]
#[command(about = "NYC 311 incremental ingest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Run {
        /// Logical run date (YYYY-MM-DD); defaults to now.
        #[arg(long)]
        run_date: Option<NaiveDate>,
        /// Treat this run as the first one and fetch a full year.
        #[arg(long)]
        backfill: bool,
        /// Write to an in-memory warehouse instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run on the configured cron until interrupted.
    Schedule,
    /// Summarize the newest test log.
    ScanLog {
        #[arg(long, default_value = "dbt/logs")]
        logs_dir: PathBuf,
        #[arg(long, default_value = "dbt_test_")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "n311_cli=info,n311_sync=info,n311_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        run_date: None,
        backfill: false,
        dry_run: false,
    });

    match command {
        Commands::Run {
            run_date,
            backfill,
            dry_run,
        } => {
            let run_timestamp = run_date
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| Utc.from_utc_datetime(&dt));
            let run = run_once_from_env(run_timestamp, backfill, dry_run).await?;
            match &run.outcome {
                RunOutcome::Skipped(s) => println!(
                    "run skipped: run_id={} window={}..{} reason={}",
                    s.run_id, s.window.since, s.window.until, s.reason
                ),
                RunOutcome::Completed(s) => println!(
                    "run complete: run_id={} fetched={} clean={} staged={} partition={} inserted={} ignored={} failed={}",
                    s.run_id,
                    s.fetched_records,
                    s.clean_records,
                    s.staging.inserted,
                    s.partition.spec.name,
                    s.partitioned.inserted,
                    s.partitioned.ignored,
                    s.partitioned.failed
                ),
            }
            for step in &run.downstream {
                println!(
                    "downstream: {} success={} exit_code={:?}",
                    step.name, step.success, step.exit_code
                );
            }
            if let Some(scan) = &run.log_scan {
                println!(
                    "test log: warnings={} failures={} summary={}",
                    scan.warnings,
                    scan.failures,
                    scan.summary_path.display()
                );
            }
        }
        Commands::Schedule => {
            let config = PipelineConfig::from_env()?;
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(build_pipeline(config, false)?);
            let Some(sched) = maybe_build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler disabled; set N311_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(%cron, "scheduler started");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            tracing::info!("shutting down scheduler");
        }
        Commands::ScanLog { logs_dir, prefix } => {
            let config = LogScanConfig {
                logs_dir,
                log_prefix: prefix,
            };
            match scan_test_log(&config).await? {
                Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                None => println!("no test log found in {}", config.logs_dir.display()),
            }
        }
    }

    Ok(())
}
