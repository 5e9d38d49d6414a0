//! studyrun-server - server-of-record for participant progress
//!
//! Resolves configuration, opens (or creates) the SQLite database and
//! serves the study API until Ctrl+C or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use studyrun_common::config::{ConfigOverrides, RootFolderInitializer, ServiceConfig, TomlConfig};
use studyrun_common::db::init_database;
use studyrun_common::randomizer::Randomizer;
use studyrun_common::Catalog;
use studyrun_server::{build_router, AppState};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for studyrun-server
#[derive(Parser, Debug)]
#[command(name = "studyrun-server")]
#[command(about = "Server-of-record for study progress and audit logs")]
#[command(version)]
struct Args {
    /// Folder holding the database
    #[arg(short, long, env = "STUDYRUN_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "STUDYRUN_PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(short, long, env = "STUDYRUN_BIND")]
    bind: Option<String>,

    /// Explicit TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fixed seed for order assignment (reproducible runs)
    #[arg(long, env = "STUDYRUN_SEED")]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml = TomlConfig::load_or_default(args.config.as_deref());

    let default_filter = format!(
        "studyrun_server={level},studyrun_common={level},tower_http=info",
        level = toml.log_level.as_deref().unwrap_or("info")
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting studyrun-server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = ServiceConfig::resolve(
        "studyrun-server",
        ConfigOverrides {
            root_folder: args.root_folder,
            port: args.port,
            bind: args.bind,
            log_level: None,
        },
        &toml,
    );

    RootFolderInitializer::new(config.root_folder.clone())
        .ensure_directory_exists()
        .context("Failed to create root folder")?;
    info!("Database path: {}", config.database_path.display());

    let pool = init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    let catalog = Arc::new(Catalog::builtin());
    let randomizer = Arc::new(Randomizer::for_participant(args.seed));
    let state = AppState::new(pool, catalog, randomizer, config.max_lock_wait_ms);
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.bind, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("studyrun-server listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
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
