use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use sheets_bridge::app;
use sheets_bridge::config;
use sheets_bridge::db;
use sheets_bridge::outbox;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Deliver all pending follow-up calls from the outbox and exit when complete"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Exit as soon as only tasks in backoff remain
    #[arg(long)]
    skip_failed: bool,

    /// Give up once a task has failed this many times
    #[arg(long, default_value = "5")]
    max_failed_attempts: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let services = app::build(&cfg).await?;
    let pool = services.pool.clone();
    let max_backoff = cfg.app.max_backoff_seconds as i64;

    let remaining = db::count_remaining_outbox_tasks(&pool).await?;
    info!(remaining_tasks = remaining, "starting outbox drain");
    if remaining == 0 {
        info!("no outbox tasks to process, exiting");
        return Ok(());
    }

    let mut processed_count = 0_u64;
    loop {
        match outbox::process_next_task(&pool, &services.follow_up, max_backoff).await {
            Ok(true) => {
                processed_count += 1;
                if processed_count % 10 == 0 {
                    let remaining = db::count_remaining_outbox_tasks(&pool).await?;
                    info!(processed = processed_count, remaining, "drain progress");
                }
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                error!(?err, "error processing outbox task");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        // Nothing due: either done or everything left is in backoff.
        let backlog: Vec<(i64, i32, String)> =
            sqlx::query_as("SELECT id, attempt, datetime(due_at) FROM outbox")
                .fetch_all(&pool)
                .await?;
        if backlog.is_empty() {
            info!(total_processed = processed_count, "all follow-ups delivered");
            break;
        }

        let max_attempts = backlog.iter().map(|(_, attempt, _)| *attempt).max().unwrap_or(0);
        let next_due = backlog
            .iter()
            .map(|(_, _, due_at)| due_at.as_str())
            .min()
            .unwrap_or("unknown");
        warn!(
            remaining = backlog.len(),
            max_attempts,
            next_due_at = %next_due,
            "no due tasks; remaining tasks are in backoff"
        );

        if max_attempts >= args.max_failed_attempts {
            error!(
                max_attempts,
                threshold = args.max_failed_attempts,
                "tasks exceeded the failure threshold, exiting"
            );
            break;
        }
        if args.skip_failed {
            warn!("--skip-failed specified, exiting with failed tasks remaining");
            break;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    Ok(())
}
