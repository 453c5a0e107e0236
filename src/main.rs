//! Array Control Plane
//!
//! Runs the provisioning orchestrator over in-memory collaborators, with the
//! REST API and Prometheus metrics in front of it.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use array_control_plane::adapters::{DriveSpec, InMemoryArray};
use array_control_plane::domain::ports::PersistenceBackendRef;
use array_control_plane::store::{PeerApplier, PeerReplicator};
use array_control_plane::{
    ApiServer, ApiServerConfig, ConfigTableStore, Error, FileJournal, JobMetrics, MemoryJournal,
    Orchestrator, ProvisionContext, Result, ServiceConfig, TransactionManager,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Array Control Plane - configuration store and raid group provisioning
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML service configuration
    #[arg(long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Insert the configured standalone drives at startup
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = match &args.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };

    info!("Starting Array Control Plane");
    info!("  Version: {}", array_control_plane::VERSION);
    info!("  Controller: {}", config.controller);
    info!("  REST API: {}", args.api_addr);
    info!("  Standalone mode: {}", args.standalone);

    let store = Arc::new(ConfigTableStore::with_limits(&config.limits)?);

    let persistence: PersistenceBackendRef = match &config.journal_path {
        Some(path) => {
            if path.exists() {
                FileJournal::replay_into(path, &store).await?;
            }
            Arc::new(FileJournal::open(path.clone(), config.journal_sync).await?)
        }
        None => Arc::new(MemoryJournal::new()),
    };

    let mut txn_manager = TransactionManager::new(store.clone(), persistence);
    if config.peer_replication {
        let peer_store = Arc::new(ConfigTableStore::with_limits(&config.limits)?);
        let (replicator, inbox) =
            PeerReplicator::channel(64, config.timeouts.replication_ack_timeout());
        tokio::spawn(PeerApplier::new(peer_store, inbox).run());
        txn_manager = txn_manager.with_replicator(replicator);
        info!("Peer replication enabled");
    }
    let txn_manager = Arc::new(txn_manager);

    let array = InMemoryArray::new(store.clone());
    store.set_event_sink(array.clone());
    if args.standalone {
        for drive in &config.standalone.drives {
            if let Err(e) = array.add_drive(&txn_manager, DriveSpec::from(drive)).await {
                warn!(location = %drive.location, error = %e, "Skipping standalone drive");
            }
        }
        info!(drives = config.standalone.drives.len(), "Standalone drives inserted");
    }

    let ctx = ProvisionContext::new(txn_manager, array.collaborators(), &config);
    let orchestrator = Orchestrator::new(ctx, Arc::new(JobMetrics::new()?));
    let created = orchestrator.initialize_defaults().await?;
    info!(created, "Orchestrator initialized");

    let api_config = ApiServerConfig {
        rest_addr: parse_addr(&args.api_addr, "REST API")?,
        metrics_addr: Some(parse_addr(&args.metrics_addr, "metrics")?),
    };
    let api_server = Arc::new(ApiServer::new(api_config, orchestrator.clone()));

    let signal_server = api_server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal_server.shutdown();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    api_server.run().await?;

    info!("Control plane shutdown complete");
    Ok(())
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address: {}", what, e)))
}

fn directive(d: &str) -> Result<Directive> {
    d.parse()
        .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", d, e)))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("tower=warn")?)
        .add_directive(directive("axum=info")?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
