//! coopd - subscription engine daemon.
//!
//! Serves the subscription HTTP API and runs the background lifecycle
//! scheduler (expiry, suspension, reminders, renewals, payment replays)
//! against a shared `SQLite` store.

mod api;
mod scheduler;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use coop_core::billing::{PaymentCoordinator, SimulatedGateway};
use coop_core::config::Config;
use coop_core::lifecycle::Lifecycle;
use coop_core::notify::{Notifier, TracingNotifier};
use coop_core::store::Store;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// coop daemon - subscription lifecycle and entitlement engine
#[derive(Parser, Debug)]
#[command(name = "coopd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "coop.toml")]
    config: PathBuf,

    /// HTTP listen address (overrides config)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Path to the SQLite database (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        Config::from_file(&args.config).context("failed to load configuration")?
    } else {
        Config::default()
    };
    if let Some(listen) = args.listen {
        config.daemon.listen_addr = listen;
    }
    if let Some(db) = &args.db {
        config.daemon.db_path.clone_from(db);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !args.config.exists() {
        info!("No config file found at {:?}, using defaults", args.config);
    }
    let config = load_config(&args)?;

    let store = Arc::new(
        Store::open(&config.daemon.db_path).with_context(|| {
            format!("failed to open database at {:?}", config.daemon.db_path)
        })?,
    );
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let lifecycle = Arc::new(Lifecycle::new(
        Arc::clone(&store),
        Arc::clone(&notifier),
        config.lifecycle.clone(),
    ));
    let billing = Arc::new(PaymentCoordinator::new(
        Arc::clone(&store),
        Arc::new(SimulatedGateway),
        notifier,
        config.billing.clone(),
    ));

    let scheduler = tokio::spawn(scheduler::run(
        Arc::clone(&lifecycle),
        Arc::clone(&billing),
        config.scheduler.clone(),
    ));

    let app = api::router(api::AppState { lifecycle, store });
    let listener = tokio::net::TcpListener::bind(config.daemon.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.daemon.listen_addr))?;
    info!(
        listen_addr = %config.daemon.listen_addr,
        db_path = ?config.daemon.db_path,
        "coopd started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    scheduler.abort();
    info!("coopd shut down");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}
