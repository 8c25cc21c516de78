use clap::Parser;
use gatehouse::configuration::{Config, StoreBackend};
use gatehouse::sshd::Sshd;
use gatehouse::store::{DatabaseStore, MemoryStore, Store};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(version)]
#[command(about = "An SSH bastion bridging operator sessions to granted target accounts")]
struct Args {
    config_file: String,
}

#[tokio::main]
async fn main() {
    // Respect RUST_LOG for the overall level, keep the ORM quiet
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("sea_orm", log::LevelFilter::Warn)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .filter_module("sqlx::query", log::LevelFilter::Error)
        .filter_module("russh", log::LevelFilter::Warn)
        .format_target(false)
        .init();

    let args = Args::parse();

    let config = match Config::from_file(Path::new(args.config_file.as_str())) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration from {}: {}", args.config_file, e);
            std::process::exit(1);
        }
    };
    info!("configuration loaded from {}", args.config_file);

    let store: Arc<dyn Store> = match config.store.backend {
        StoreBackend::Database => {
            info!("opening database store at {}", config.store.db_path.display());
            match DatabaseStore::new_file(&config.store.db_path).await {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    error!("failed to open store: {}", e);
                    std::process::exit(1);
                }
            }
        }
        StoreBackend::Memory => {
            warn!("using in-memory store, nothing will survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let mut sshd = match Sshd::new(config, store) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to initialize sshd: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

    let sshd_handle = tokio::spawn(async move {
        if let Err(e) = sshd.run(shutdown_rx).await {
            error!("sshd error: {}", e);
        }
    });

    info!("gatehouse is now operational");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("shutdown signal received, stopping bastion...");
        }
        Err(e) => {
            error!("failed to listen for shutdown signal: {}", e);
        }
    }

    if let Err(e) = shutdown_tx.send(()) {
        error!("failed to send shutdown signal: {:?}", e);
    }

    match tokio::time::timeout(tokio::time::Duration::from_secs(10), sshd_handle).await {
        Ok(Ok(())) => {
            info!("gatehouse shutdown completed");
        }
        Ok(Err(e)) => {
            error!("sshd task failed during shutdown: {:?}", e);
        }
        Err(_) => {
            warn!("sshd shutdown timed out after 10 seconds");
        }
    }
}
