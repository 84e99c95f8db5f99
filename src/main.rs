use anyhow::Result;
use clap::Parser;
use sheets_bridge::app;
use sheets_bridge::config::{self, DispatchMode};
use sheets_bridge::dispatch::{FollowUpTransport, HttpFollowUp, OutboxFollowUp};
use sheets_bridge::handlers::{self, AppState};
use sheets_bridge::outbox;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let transport: Arc<dyn FollowUpTransport> = match cfg.app.dispatch {
        DispatchMode::Http => {
            // Follow-ups poll remote jobs for minutes; no client timeout.
            let follow_http = reqwest::Client::builder().build()?;
            Arc::new(HttpFollowUp::new(follow_http, &cfg.app.public_url)?)
        }
        DispatchMode::Outbox => {
            // Spawn outbox worker (single-threaded)
            let worker_pool = services.pool.clone();
            let worker = services.follow_up.clone();
            let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
            let max_backoff = cfg.app.max_backoff_seconds as i64;
            tokio::spawn(async move {
                loop {
                    match outbox::process_next_task(&worker_pool, &worker, max_backoff).await {
                        Ok(processed) => {
                            if !processed {
                                tokio::time::sleep(poll_sleep).await;
                            }
                        }
                        Err(err) => {
                            error!(?err, "outbox worker error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            });
            Arc::new(OutboxFollowUp::new(services.pool.clone()))
        }
    };

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        host: services.host,
        tokens: services.tokens,
        connector: services.connector,
        follow_up: services.follow_up,
        transport,
        signer: services.signer,
    });

    let listener = TcpListener::bind(&cfg.app.listen_addr).await?;
    info!(addr = %listener.local_addr()?, dispatch = ?cfg.app.dispatch, "starting sheets bridge");
    axum::serve(listener, handlers::router(state)).await?;
    Ok(())
}
