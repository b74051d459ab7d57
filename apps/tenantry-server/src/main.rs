mod api;
mod config;
mod logging;
mod ops;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio::sync::Notify;

use crate::config::{AppConfig, CliOverrides};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Tenantry Server - tenant-isolated data access over MySQL, PostgreSQL and MongoDB
#[derive(Parser)]
#[command(name = "tenantry-server")]
#[command(about = "Tenantry Server - tenant-isolated data access over MySQL, PostgreSQL and MongoDB")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address override (e.g. 0.0.0.0:8087)
    #[arg(short, long)]
    bind: Option<std::net::SocketAddr>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve,
    /// Validate configuration, print it and exit
    Check,
    /// Make every unique index lead with the tenant key
    ReconcileIndexes {
        /// JSON descriptor of the target database
        #[arg(long)]
        descriptor: PathBuf,
    },
    /// Fold legacy per-tenant collections into shared ones
    MigrateLegacy {
        /// JSON descriptor of the target document database
        #[arg(long)]
        descriptor: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(&CliOverrides {
        bind_addr: cli.bind,
        verbose: cli.verbose,
        json_logs: cli.json_logs,
    });
    logging::init(&config.logging)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Check => check(&config),
        Commands::ReconcileIndexes { descriptor } => {
            ops::reconcile_indexes(&config.data, &descriptor).await
        }
        Commands::MigrateLegacy { descriptor } => {
            ops::migrate_legacy(&config.data, &descriptor).await
        }
    }
}

fn check(config: &AppConfig) -> Result<()> {
    tracing::info!("checking configuration");
    println!("Configuration is valid");
    println!("{}", config.to_pretty_json()?);
    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let state = Arc::new(api::AppState::new(config.data.clone()));
    let app = api::router(state.clone(), config.server.body_limit_bytes);

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.server.bind_addr))?;
    tracing::info!(addr = %config.server.bind_addr, "tenantry server listening");

    let draining = Arc::new(Notify::new());
    let notify = draining.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signals::wait_for_shutdown().await;
                notify.notify_one();
            })
            .await
    });

    let grace = config.server.shutdown_grace;
    let result = tokio::select! {
        joined = &mut server => finish(joined),
        () = draining.notified() => match tokio::time::timeout(grace, &mut server).await {
            Ok(joined) => finish(joined),
            Err(_) => {
                tracing::warn!(grace_secs = grace.as_secs(), "grace period elapsed, dropping open connections");
                server.abort();
                Ok(())
            }
        },
    };

    state.manager.close_all().await;
    tracing::info!("tenantry server stopped");
    result
}

fn finish(joined: Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined
        .context("server task panicked")
        .and_then(|served| served.context("server error"))
}
