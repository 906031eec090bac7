use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;

use fundnav::database_ops::db::Db;
use fundnav::ingest::checkpoint::{CheckpointManager, RunParams};
use fundnav::ingest::cleaner::CleanParams;
use fundnav::ingest::coordinator::{Coordinator, NavPipeline, RunConfig, RunOutcome};
use fundnav::ingest::error_log::ErrorLogger;
use fundnav::ingest::fetcher::{FetchPolicy, MfapiClient};
use fundnav::ingest::schemes::resolve_schemes;
use fundnav::ingest::writer::NavWriter;
use fundnav::util::env as env_util;

#[derive(Parser, Debug)]
#[command(
    name = "ingest_navs",
    version,
    about = "Bulk NAV history ingestion with checkpointed resume"
)]
struct Cli {
    /// Ingest only the most recent NAV per scheme
    #[arg(long)]
    only_latest: bool,
    /// Inclusive start date (YYYY-MM-DD)
    #[arg(long)]
    since: Option<String>,
    /// Inclusive end date (YYYY-MM-DD)
    #[arg(long)]
    until: Option<String>,
    /// Comma-separated scheme codes (wins over --schemes-file and the catalog)
    #[arg(long)]
    scheme_codes: Option<String>,
    /// File with one scheme code per line
    #[arg(long)]
    schemes_file: Option<PathBuf>,
    /// Max concurrent fetch pipelines
    #[arg(long, default_value_t = 8)]
    max_concurrency: usize,
    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = 20)]
    timeout: u64,
    /// Fetch attempts per scheme before giving up on it for this run
    #[arg(long, default_value_t = 3)]
    retries: u32,
    /// Base sleep between retries in milliseconds (grows linearly per attempt)
    #[arg(long, default_value_t = 500)]
    retry_sleep_ms: u64,
    /// Process at most N schemes (applied after resume filtering)
    #[arg(long)]
    limit: Option<usize>,
    /// Checkpoint file path
    #[arg(long, default_value = "checkpoints/nav_checkpoint.json")]
    checkpoint_file: PathBuf,
    /// Save a checkpoint after every N schemes
    #[arg(long, default_value_t = 50)]
    checkpoint_every: usize,
    /// Resume from the last checkpoint
    #[arg(long)]
    resume: bool,
    /// Error log path (JSONL, append-only)
    #[arg(long, default_value = "logs/ingestion_errors.jsonl")]
    error_log: PathBuf,
    /// Upstream base URL (falls back to MFAPI_BASE_URL, then the default)
    #[arg(long)]
    base_url: Option<String>,
}

fn parse_date_arg(name: &str, raw: Option<&str>) -> Result<Option<NaiveDate>> {
    raw.map(|s| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("invalid --{name} date {s:?} (expected YYYY-MM-DD)"))
    })
    .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    fundnav::logging::init_tracing("info")?;
    let cli = Cli::parse();

    // Configuration errors abort here, before any work starts.
    let since = parse_date_arg("since", cli.since.as_deref())?;
    let until = parse_date_arg("until", cli.until.as_deref())?;

    let base_url = cli
        .base_url
        .clone()
        .or_else(|| env_util::env_opt("MFAPI_BASE_URL"));
    let client = MfapiClient::new(
        base_url.as_deref(),
        cli.timeout,
        FetchPolicy {
            attempts: cli.retries.max(1),
            base_sleep: Duration::from_millis(cli.retry_sleep_ms),
        },
    )?;

    let schemes = resolve_schemes(
        cli.scheme_codes.as_deref(),
        cli.schemes_file.as_deref(),
        &client,
    )
    .await?;

    let database_url = env_util::db_url()?;
    let db_conns: u32 = env_util::env_parse("DB_MAX_CONNS", cli.max_concurrency.max(1) as u32);
    let db = Db::connect(&database_url, db_conns).await?;

    let errors = Arc::new(ErrorLogger::new(&cli.error_log));
    let writer = NavWriter::new(db, Arc::clone(&errors));
    let clean = CleanParams {
        only_latest: cli.only_latest,
        since,
        until,
    };
    let pipeline = Arc::new(NavPipeline::new(
        client,
        writer,
        Arc::clone(&errors),
        clean,
    ));

    let config = RunConfig {
        max_concurrency: cli.max_concurrency.max(1),
        checkpoint_every: cli.checkpoint_every.max(1),
        resume: cli.resume,
        limit: cli.limit,
        params: RunParams {
            only_latest: cli.only_latest,
            since,
            until,
            limit: cli.limit,
        },
    };
    let coordinator = Coordinator::new(
        pipeline,
        CheckpointManager::new(&cli.checkpoint_file),
        config,
    );

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler means no external interrupts to react to.
            std::future::pending::<()>().await;
        }
    };

    match coordinator.run(schemes, shutdown).await? {
        RunOutcome::Completed(stats) if stats.total_errors == 0 => {
            println!(
                "[ingest] success: {} rows written across {} schemes",
                stats.total_written, stats.total_schemes
            );
            Ok(())
        }
        RunOutcome::Completed(stats) => {
            println!(
                "[ingest] completed with {} errors ({} rows written); checkpoint kept, rerun with --resume to retry failures",
                stats.total_errors, stats.total_written
            );
            std::process::exit(1);
        }
        RunOutcome::Interrupted(stats) => {
            println!(
                "[ingest] interrupted: {} rows written so far; rerun with --resume to continue",
                stats.total_written
            );
            std::process::exit(130);
        }
    }
}
