//! jam-server - orchestrator for jamhub sessions
//!
//! Accepts browser links, hands out auth tokens, starts one worker process
//! per jam session and routes requests and replies between the two.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};

use jam_utils::{paths, LogConfig, Result};

mod auth;
mod config;
mod handlers;
mod router;
mod store;
mod workers;

use auth::AuthRegistry;
use config::{AppConfig, ConfigLoader, DEFAULT_CONFIG_TOML};
use handlers::ServerContext;
use router::MessageRouter;
use store::{DocumentStore, FileStore};
use workers::{ProcessProvisioner, WorkerManager, WorkerSettings};

#[derive(Parser, Debug)]
#[command(author, version, about = "jamhub orchestrator", long_about = None)]
struct Args {
    /// Config file (defaults to the XDG config location)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop every known worker, clear all session records and exit
    #[arg(long)]
    purge: bool,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Verbose logging to stderr
    #[arg(long, short)]
    verbose: bool,
}

fn open_store(config: &AppConfig) -> Result<Arc<dyn DocumentStore>> {
    if config.store.in_memory {
        warn!("Using in-memory store; sessions will not survive a restart");
        return Ok(Arc::new(FileStore::in_memory()));
    }
    let path = config.store.path.clone().unwrap_or_else(paths::store_file);
    Ok(Arc::new(FileStore::open(path)?))
}

fn build_manager(
    config: &AppConfig,
    store: Arc<dyn DocumentStore>,
    router: Arc<MessageRouter>,
) -> Result<Arc<WorkerManager>> {
    let worker_bin = match &config.workers.worker_bin {
        Some(path) => path.clone(),
        None => ProcessProvisioner::default_worker_bin()?,
    };
    let provisioner = Arc::new(ProcessProvisioner::new(worker_bin, config.workers.host.clone()));
    let settings = WorkerSettings::from_config(&config.workers, config.server.control_addr.clone());
    Ok(Arc::new(WorkerManager::new(provisioner, store, router, settings)))
}

async fn run(config: AppConfig, purge: bool) -> Result<()> {
    let store = open_store(&config)?;
    let auth = Arc::new(AuthRegistry::new(Duration::from_secs(config.auth.token_ttl_secs)));
    let router = Arc::new(MessageRouter::new(Arc::clone(&auth)));
    let workers = build_manager(&config, Arc::clone(&store), Arc::clone(&router))?;

    if purge {
        let purged = workers.purge_all()?;
        info!("Purged {} sessions", purged);
        return Ok(());
    }

    // Bind before reconnecting so restored workers can hand-shake again
    let control_listener = TcpListener::bind(&config.server.control_addr).await?;
    let client_listener = TcpListener::bind(&config.server.client_addr).await?;
    info!(
        "Listening for clients on {} and workers on {}",
        config.server.client_addr, config.server.control_addr
    );

    match workers.reconnect().await {
        Ok(restored) if restored > 0 => info!("Restored {} sessions", restored),
        Ok(_) => {}
        Err(e) => error!("Reconnect failed: {}", e),
    }

    let (prune_cancel_tx, prune_cancel_rx) = oneshot::channel();
    let prune_task = auth::spawn_prune_task(
        Arc::clone(&auth),
        Duration::from_secs(config.auth.prune_interval_secs),
        Duration::from_secs(config.auth.prune_phase_secs),
        prune_cancel_rx,
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let ctx = Arc::new(ServerContext::new(
        Arc::clone(&auth),
        Arc::clone(&router),
        Arc::clone(&workers),
        Arc::clone(&store),
    ));
    let handshakes = tokio::spawn(handlers::handshake::serve_handshakes(
        control_listener,
        Arc::clone(&workers),
        shutdown_tx.subscribe(),
    ));
    let clients = tokio::spawn(handlers::client::serve_clients(
        client_listener,
        ctx,
        shutdown_tx.subscribe(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down; workers keep running for the next start");

    let _ = shutdown_tx.send(());
    let _ = prune_cancel_tx.send(());
    let _ = tokio::join!(handshakes, clients, prune_task);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", DEFAULT_CONFIG_TOML);
        return Ok(());
    }

    let log_config = if args.verbose {
        LogConfig::development()
    } else {
        LogConfig::orchestrator()
    };
    jam_utils::init_logging_with_config(log_config)?;

    let config = ConfigLoader::load_and_validate(args.config.as_deref())?;
    info!("jam-server starting");
    run(config, args.purge).await
}
