use std::sync::Arc;

use anyhow::{Context, Result};
use chaosfeed_github::{GitHubClient, OpenItemCache};
use chaosfeed_store::PgEventStore;
use chaosfeed_sync::{
    run_backfill, BackfillOptions, FeedConfig, Ingester, IngesterSettings, MemorySink,
};
use chaosfeed_web::AppState;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chaosfeed")]
#[command(about = "Repository activity feed: ingestion loops, backfill and read API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate, start the poll loops and serve the HTTP API (default).
    Serve {
        /// Serve the API without polling the platform.
        #[arg(long)]
        no_ingest: bool,
    },
    /// Apply pending schema migrations and exit.
    Migrate,
    /// Import history from the listing endpoints.
    Backfill {
        /// Replace stored pull request and issue lifecycle rows with freshly classified ones.
        #[arg(long)]
        replace_lifecycle: bool,
        /// Fetch and normalize into memory without touching the database.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        skip_comment_reactions: bool,
        #[arg(long)]
        skip_discussions: bool,
    },
    /// Print the current platform quota.
    RateLimit,
}

fn init_tracing(development: bool) {
    let default = if development { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FeedConfig::load().context("loading configuration")?;
    init_tracing(config.is_development());

    match cli.command.unwrap_or(Commands::Serve { no_ingest: false }) {
        Commands::Serve { no_ingest } => serve(config, !no_ingest).await,
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
            store.close().await;
            Ok(())
        }
        Commands::Backfill {
            replace_lifecycle,
            dry_run,
            skip_comment_reactions,
            skip_discussions,
        } => {
            let options = BackfillOptions {
                replace_lifecycle,
                comment_reactions: !skip_comment_reactions,
                discussions: config.discussions_enabled && !skip_discussions,
            };
            backfill(config, options, dry_run).await
        }
        Commands::RateLimit => {
            let client = GitHubClient::new(config.github_config())?;
            let rate = client.rate_limit().await.context("querying quota")?;
            println!(
                "remaining={} limit={} reset_at={}",
                rate.remaining,
                rate.limit.map(|l| l.to_string()).unwrap_or_else(|| "?".into()),
                rate.reset_at.to_rfc3339()
            );
            Ok(())
        }
    }
}

async fn connect(config: &FeedConfig) -> Result<PgEventStore> {
    PgEventStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(err) = result {
                        warn!(error = %err, "ctrl-c handler failed, waiting for SIGTERM");
                        terminate.recv().await;
                    }
                }
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable, listening for ctrl-c only");
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn serve(config: FeedConfig, ingest: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let store = connect(&config).await?;
    store.migrate().await.context("running migrations")?;

    let mut state = AppState::new(store.clone());
    let ingester = if ingest {
        let client = GitHubClient::new(config.github_config())?.with_shutdown(shutdown.clone());
        let ingester = Ingester::new(
            Arc::new(client),
            Arc::new(store.clone()),
            Arc::new(OpenItemCache::new(config.open_item_ttl)),
            IngesterSettings::from(&config),
        );
        state = state.with_status(ingester.status_board());
        Some(ingester.spawn(shutdown.clone()))
    } else {
        info!("ingestion disabled, serving reads only");
        None
    };

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    let served = chaosfeed_web::serve(listener, state, shutdown.clone()).await;

    // The server may also stop on its own error; the loops go down with it.
    shutdown.cancel();
    if let Some(handle) = ingester {
        handle.stop().await;
    }
    store.close().await;
    info!("shutdown complete");
    served
}

async fn backfill(config: FeedConfig, options: BackfillOptions, dry_run: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());
    let client = GitHubClient::new(config.github_config())?.with_shutdown(shutdown);

    let report = if dry_run {
        info!(repo = %config.repo, "dry run, nothing will be written");
        run_backfill(&client, &MemorySink::new(), &config.repo, options).await?
    } else {
        let store = connect(&config).await?;
        store.migrate().await.context("running migrations")?;
        let report = run_backfill(&client, &store, &config.repo, options).await;
        store.close().await;
        report?
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
