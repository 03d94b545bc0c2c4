mod config;
mod otlp;
mod synth;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use spanvault_api::ApiState;
use spanvault_store::TraceDb;

use crate::config::Config;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "spanvault",
    about = "Local OpenTelemetry trace store with OTLP ingest"
)]
struct Args {
    /// OTLP gRPC listen address
    #[arg(long)]
    grpc_addr: Option<String>,

    /// OTLP HTTP listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Query API listen address
    #[arg(long)]
    api_addr: Option<String>,

    /// Path to the trace database file
    #[arg(long)]
    db_path: Option<String>,

    /// Days to keep spans before whole months are dropped
    #[arg(long)]
    retention_days: Option<i64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Path to config file
    #[arg(long)]
    config: Option<String>,

    /// Enable the synthetic trace generator for development/testing
    #[arg(long)]
    dev_ingest: bool,

    /// Interval (seconds) between synthetic trace bursts [default: 5]
    #[arg(long, default_value = "5")]
    dev_ingest_interval: u64,
}

/// Resolved configuration merging CLI args over config file over defaults.
struct ResolvedConfig {
    grpc_addr: String,
    http_addr: String,
    api_addr: String,
    db_path: PathBuf,
    retention_days: i64,
    cleanup_interval: Duration,
    log_level: String,
    dev_ingest: bool,
    dev_ingest_interval: u64,
}

impl ResolvedConfig {
    fn from_args_and_config(args: &Args, config: &Config) -> Self {
        Self {
            grpc_addr: args
                .grpc_addr
                .clone()
                .unwrap_or_else(|| config.ingest.grpc_addr.clone()),
            http_addr: args
                .http_addr
                .clone()
                .unwrap_or_else(|| config.ingest.http_addr.clone()),
            api_addr: args
                .api_addr
                .clone()
                .unwrap_or_else(|| config.api.addr.clone()),
            db_path: args
                .db_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| config.db_path()),
            retention_days: args.retention_days.unwrap_or(config.storage.retention_days),
            cleanup_interval: Duration::from_secs(config.storage.cleanup_interval_secs.max(1)),
            log_level: args
                .log_level
                .clone()
                .or_else(|| std::env::var("SPANVAULT_LOG").ok())
                .unwrap_or_else(|| config.logging.level.clone()),
            dev_ingest: args.dev_ingest,
            dev_ingest_interval: args.dev_ingest_interval.max(1),
        }
    }
}

fn setup_logging(log_level: &str) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = Config::log_dir();
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "spanvault.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = fmt::layer().with_target(false).with_thread_ids(false);
    let file_layer = fmt::layer().json().with_writer(file_writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}

fn parse_addr(what: &str, addr: &str) -> SocketAddr {
    match addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid {} address {:?}: {}", what, addr, e);
            std::process::exit(2);
        }
    }
}

/// Flip the shutdown channel on SIGINT or SIGTERM.
async fn handle_signals(shutdown_tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("cannot install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

/// Invoke retention cleanup on a fixed cadence until shutdown.
async fn run_cleanup(
    db: Arc<TraceDb>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => {
                info!("cleanup loop shutting down");
                return;
            }
        }
        let db = db.clone();
        match tokio::task::spawn_blocking(move || db.cleanup()).await {
            Ok(Ok(dropped)) if dropped > 0 => {
                info!(dropped, "retention cleanup dropped month partitions")
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("retention cleanup failed: {}", e),
            Err(e) => error!("retention cleanup task panicked: {}", e),
        }
    }
}

async fn serve_http(
    router: axum::Router,
    addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_rx.changed().await.ok();
        })
        .await
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from(Path::new(path)),
        None => Config::load(),
    };
    let resolved = ResolvedConfig::from_args_and_config(&args, &config);
    let _log_guard = setup_logging(&resolved.log_level);

    let grpc_addr = parse_addr("OTLP gRPC", &resolved.grpc_addr);
    let http_addr = parse_addr("OTLP HTTP", &resolved.http_addr);
    let api_addr = parse_addr("API", &resolved.api_addr);

    let db = match TraceDb::open(&resolved.db_path, resolved.retention_days) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!(
                "failed to open trace store at {}: {}",
                resolved.db_path.display(),
                e
            );
            std::process::exit(1);
        }
    };

    info!(
        grpc = %grpc_addr,
        http = %http_addr,
        api = %api_addr,
        db = %resolved.db_path.display(),
        "starting spanvault"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(handle_signals(shutdown_tx));

    let grpc = {
        let db = db.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = otlp::serve_grpc(db, grpc_addr, rx).await {
                error!("OTLP gRPC server error: {}", e);
            }
        })
    };

    let http_ingest = {
        let router = otlp::http_router(db.clone());
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_http(router, http_addr, rx).await {
                error!("OTLP HTTP server error: {}", e);
            }
        })
    };

    let api = {
        let router = spanvault_api::router(ApiState {
            db: db.clone(),
            started: Instant::now(),
        });
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_http(router, api_addr, rx).await {
                error!("API server error: {}", e);
            }
        })
    };

    let cleanup = tokio::spawn(run_cleanup(
        db.clone(),
        resolved.cleanup_interval,
        shutdown_rx.clone(),
    ));

    if resolved.dev_ingest {
        info!(
            interval_secs = resolved.dev_ingest_interval,
            "synthetic ingest enabled"
        );
        tokio::spawn(synth::run_synthetic_ingest(
            db.clone(),
            Duration::from_secs(resolved.dev_ingest_interval),
            shutdown_rx.clone(),
        ));
    }

    let mut shutdown = shutdown_rx.clone();
    shutdown.changed().await.ok();
    info!("shutting down");

    let drain = async {
        let _ = grpc.await;
        let _ = http_ingest.await;
        let _ = api.await;
        let _ = cleanup.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        warn!("servers did not drain within {:?}", SHUTDOWN_TIMEOUT);
    }

    db.close();
    info!("trace store closed");
}
