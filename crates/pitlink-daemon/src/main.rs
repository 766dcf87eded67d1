//! pitlink-daemon entry point.
//!
//! Startup order matters: configuration and key material first, then the
//! session store, then the bus connection, then the worker pool, and only
//! then the listener. Any failure before the listener binds is fatal;
//! everything after that is logged and survived.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pitlink_core::crypto::DeviceKey;
use pitlink_daemon::bus::LapinTransport;
use pitlink_daemon::config::Config;
use pitlink_daemon::http::{self, AppState};
use pitlink_daemon::pipeline::PublishPipeline;
use pitlink_daemon::session::SessionManager;
use pitlink_daemon::store::SqliteSessionStore;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// pitlink telemetry ingest daemon
#[derive(Parser, Debug)]
#[command(name = "pitlink-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to serve the vehicle-facing HTTP API on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Publish workers. More than one reorders packets downstream; keep at 1
    /// when a consumer inserts into an order-sensitive table.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Session database file; defaults to `<DB_NAME>.db`
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("reading configuration from the environment")?;

    let device_key = DeviceKey::from_coordinates(&config.device_key_x, &config.device_key_y)
        .context("parsing the device public key")?;

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.db", config.db.name)));
    let store = SqliteSessionStore::open(&db_path)
        .with_context(|| format!("opening the session store at {}", db_path.display()))?;

    let sessions = Arc::new(SessionManager::new(device_key.clone(), Arc::new(store)));

    let transport = LapinTransport::connect(&config.amqp_url)
        .await
        .context("connecting to the message bus")?;

    let pipeline = Arc::new(PublishPipeline::start(
        args.workers,
        Arc::clone(&sessions),
        Arc::new(transport),
    ));

    let app = http::router(Arc::new(AppState {
        sessions,
        pipeline: Arc::clone(&pipeline),
        device_key,
    }));

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;

    info!(
        addr = %args.listen,
        workers = args.workers,
        db = %db_path.display(),
        "pitlink daemon listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    // Let the workers drain whatever the handlers enqueued before the
    // listener closed.
    info!("draining publish pipeline");
    pipeline.stop().await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
