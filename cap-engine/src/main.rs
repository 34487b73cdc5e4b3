//! cap-engine: cap-level progression and ad-revenue distribution service
//!
//! `serve` runs the periodic scheduler, the worker pool and the admin HTTP
//! API. The remaining subcommands are one-shot operator commands against the
//! same database.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cap_common::config::{prepare_root_folder, resolve_root_folder, TomlConfig, ROOT_FOLDER_ENV};
use cap_common::events::EventBus;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use cap_engine::{build_router, AppState, EngineConfig};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5790";

#[derive(Parser, Debug)]
#[command(name = "cap-engine")]
#[command(about = "Cap-level progression and ad-revenue distribution engine")]
#[command(version)]
struct Args {
    /// Folder holding cap_engine.db
    #[arg(short, long, global = true, env = ROOT_FOLDER_ENV)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scheduler, workers and the admin HTTP API (default)
    Serve {
        /// Address for the admin HTTP API
        #[arg(short, long, env = "CAP_BIND_ADDR")]
        bind: Option<SocketAddr>,
    },
    /// Upsert the canonical tier definitions
    SeedTiers,
    /// Delete all tier definitions and reseed the defaults
    ResetTiers,
    /// Run one scheduler tick now
    EvaluateNow {
        /// Also process the queued jobs before exiting
        #[arg(long)]
        drain: bool,
    },
    /// Distribute a monetized listing's promotion budget
    Distribute { listing_id: Uuid },
    /// Print a user's tier and current score
    ShowUser { user_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let toml_config = TomlConfig::load_or_default();

    let default_filter = toml_config
        .log_level
        .clone()
        .unwrap_or_else(|| "cap_engine=info,cap_common=info,tower_http=info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Build identification before any database work
    info!(
        "Starting cap-engine v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let args = Args::parse();

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), ROOT_FOLDER_ENV, &toml_config);
    let db_path = prepare_root_folder(&root_folder)
        .with_context(|| format!("Failed to prepare root folder {}", root_folder.display()))?;
    info!("Database path: {}", db_path.display());

    let db = cap_common::db::init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    let config = EngineConfig::from_database(&db).await;
    let state = AppState::new(db, config, EventBus::new(256));

    match args.command.unwrap_or(Command::Serve { bind: None }) {
        Command::Serve { bind } => {
            let bind = match bind {
                Some(addr) => addr,
                None => toml_config
                    .bind_addr
                    .as_deref()
                    .unwrap_or(DEFAULT_BIND_ADDR)
                    .parse()
                    .context("Invalid bind address")?,
            };
            serve(state, bind).await
        }
        Command::SeedTiers => {
            let report = state.registry.seed_defaults().await?;
            println!("Tier definitions: {} written, {} unchanged", report.written, report.unchanged);
            Ok(())
        }
        Command::ResetTiers => {
            let report = state.registry.reset().await?;
            println!("Tier definitions reset: {} written", report.written);
            Ok(())
        }
        Command::EvaluateNow { drain } => {
            let report = state.scheduler.trigger_now().await?;
            println!(
                "Cycle {}: {} users in {} batches",
                report.cycle_id,
                report.user_count,
                report.batch_ids.len()
            );
            if drain {
                let processed = state.worker_pool().drain().await?;
                let counts = state.queue.counts().await?;
                println!(
                    "Processed {} jobs ({} waiting, {} failed)",
                    processed, counts.waiting, counts.failed
                );
            }
            Ok(())
        }
        Command::Distribute { listing_id } => {
            let outcome = state.revenue.distribute(listing_id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::ShowUser { user_id } => {
            let user = state.engagement.user(user_id).await?;
            let score = state.engagement.current_score(user_id).await?;
            println!("User {}: tier {}, verified {}, score {}", user_id, user.tier, user.verified, score);
            Ok(())
        }
    }
}

async fn serve(state: AppState, bind: SocketAddr) -> Result<()> {
    if state.registry.list().await?.is_empty() {
        warn!("Tier registry is empty; evaluations will fail until tiers are seeded");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_handle = Arc::clone(&state.scheduler).run(shutdown_rx.clone());
    let worker_handles = Arc::new(state.worker_pool()).spawn(shutdown_rx);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("cap-engine listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop background services; in-flight jobs finish or their leases expire
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        error!("Scheduler task ended abnormally: {}", e);
    }
    for handle in worker_handles {
        if let Err(e) = handle.await {
            error!("Worker task ended abnormally: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
