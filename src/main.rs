use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{StorageBackend, StorageConfig, TollgateConfig};
use tollgate::http::HttpServer;
use tollgate::ratelimit::{Policy, RateLimiter};
use tollgate::storage::{InMemoryStorage, RedisStorage, Storage};

/// Per-IP and per-token HTTP admission control.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the storage backend (redis or memory)
    #[arg(long, value_enum)]
    storage: Option<StorageBackend>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(backend) = args.storage {
        config.storage.backend = backend;
    }

    let limits = &config.rate_limiting;
    info!(
        port = config.server.port,
        backend = ?config.storage.backend,
        ip_limit = limits.ip_limit,
        ip_block_duration_secs = limits.ip_block_duration_secs,
        token_limit = limits.token_limit,
        token_block_duration_secs = limits.token_block_duration_secs,
        token_overrides = limits.tokens.len(),
        "Configuration loaded"
    );

    let storage = open_storage(&config.storage).await?;
    let policy = Policy::from(&config.rate_limiting);
    let rate_limiter = Arc::new(
        RateLimiter::new(storage.clone(), policy)
            .with_operation_timeout(config.storage.operation_timeout()),
    );

    let server = HttpServer::new(config.server.listen_addr(), rate_limiter);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    if let Err(e) = storage.close().await {
        warn!(error = %e, "Failed to close storage");
    }
    served?;

    info!("Tollgate stopped");
    Ok(())
}

/// Open the configured backing store.
async fn open_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn Storage>> {
    match config.backend {
        StorageBackend::Redis => {
            let store: Arc<dyn Storage> =
                Arc::new(RedisStorage::connect(&config.redis_settings()).await?);
            Ok(store)
        }
        StorageBackend::Memory => {
            let store = Arc::new(InMemoryStorage::new());
            spawn_sweeper(store.clone(), config);
            info!("Using in-memory storage");
            let store: Arc<dyn Storage> = store;
            Ok(store)
        }
    }
}

/// Periodically evict expired records from the memory store.
fn spawn_sweeper(store: Arc<InMemoryStorage>, config: &StorageConfig) {
    let mut interval = tokio::time::interval(config.sweep_interval());
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
