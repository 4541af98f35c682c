//! Simulation queue server.
//!
//! Loads the configuration and catalog, opens the store, requeues runs
//! orphaned by a previous instance and serves the HTTP/WebSocket API.
//!
//! ## Usage
//!
//! ```bash
//! negotiation-orchestrator --config orchestrator.toml
//! negotiation-orchestrator --catalog catalog.toml --executor scripted --port 9000
//! negotiation-orchestrator --print-schema > config.schema.json
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter
//! - `ORCHESTRATOR_CONFIG` — config file path (same as `--config`)

use clap::Parser;
use negotiation_orchestrator::config::{
    export_schema, loader, ExecutorKind, OrchestratorConfig, StoreBackend, StoreConfig,
};
use negotiation_orchestrator::cost::CostModel;
use negotiation_orchestrator::{
    init_tracing, metrics, web_api, Catalog, MemoryStore, Notifier, ProcessExecutor,
    QueueOrchestrator, RunExecutor, ScriptedExecutor, SimulationStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Simulation queue orchestrator for technique × tactic negotiation runs.
#[derive(Debug, Parser)]
#[command(name = "negotiation-orchestrator", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides `server.host`).
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides `server.port`).
    #[arg(short, long)]
    port: Option<u16>,

    /// Simultaneous runs (overrides `queue.max_concurrency`).
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Technique and tactic catalog (overrides `catalog_file`).
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Persistence backend: `memory` or `sqlite` (overrides `store.backend`).
    #[arg(long, value_parser = parse_store)]
    store: Option<StoreBackend>,

    /// SQLite database file (overrides `store.path`).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Run executor: `process` or `scripted` (overrides `executor.kind`).
    #[arg(long, value_parser = parse_executor)]
    executor: Option<ExecutorKind>,

    /// Print the configuration JSON Schema and exit.
    #[arg(long)]
    print_schema: bool,
}

impl Cli {
    /// Layer command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut OrchestratorConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(n) = self.max_concurrency {
            config.queue.max_concurrency = n;
        }
        if let Some(path) = &self.catalog {
            config.catalog_file = Some(path.clone());
        }
        if let Some(backend) = self.store {
            config.store.backend = backend;
        }
        if let Some(path) = &self.db {
            config.store.path = path.clone();
        }
        if let Some(kind) = self.executor {
            config.executor.kind = kind;
        }
    }
}

fn parse_store(s: &str) -> Result<StoreBackend, String> {
    match s.to_ascii_lowercase().as_str() {
        "memory" => Ok(StoreBackend::Memory),
        "sqlite" => Ok(StoreBackend::Sqlite),
        other => Err(format!("unknown store '{other}' (expected memory or sqlite)")),
    }
}

fn parse_executor(s: &str) -> Result<ExecutorKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "process" => Ok(ExecutorKind::Process),
        "scripted" => Ok(ExecutorKind::Scripted),
        other => Err(format!("unknown executor '{other}' (expected process or scripted)")),
    }
}

fn open_store(config: &StoreConfig) -> Result<Arc<dyn SimulationStore>, BoxError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "sqlite")]
        StoreBackend::Sqlite => Ok(Arc::new(
            negotiation_orchestrator::store::sqlite::SqliteStore::open(&config.path)?,
        )),
        #[cfg(not(feature = "sqlite"))]
        StoreBackend::Sqlite => Err("built without the `sqlite` feature".into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    if cli.print_schema {
        println!("{}", export_schema()?);
        return Ok(());
    }

    // Initialize structured tracing (JSON or pretty, based on LOG_FORMAT env)
    let _ = init_tracing();

    // Initialize Prometheus metrics registry before any run is dispatched.
    metrics::init_metrics()?;

    let mut config = match &cli.config {
        Some(path) => loader::load_from_file(path)?,
        None => OrchestratorConfig::default(),
    };
    cli.apply(&mut config);
    loader::check(&config)?;

    let catalog = match &config.catalog_file {
        Some(path) => Catalog::load(path)?,
        None => {
            warn!("no catalog_file configured; every queue creation will be rejected");
            Catalog::default()
        }
    };
    info!(
        techniques = catalog.techniques.len(),
        tactics = catalog.tactics.len(),
        "catalog loaded"
    );

    let store = open_store(&config.store)?;
    let executor: Arc<dyn RunExecutor> = match config.executor.kind {
        ExecutorKind::Process => Arc::new(ProcessExecutor::new(
            config.executor.clone(),
            config.evaluation.clone(),
            Duration::from_secs(config.queue.run_timeout_secs),
        )),
        ExecutorKind::Scripted => Arc::new(ScriptedExecutor::new()),
    };
    info!(
        executor = executor.name(),
        store = ?config.store.backend,
        max_concurrency = config.queue.max_concurrency,
        "starting negotiation-orchestrator"
    );

    let orchestrator = QueueOrchestrator::new(
        store,
        executor,
        Arc::new(catalog),
        Notifier::new(config.server.event_capacity),
        config.queue.clone(),
        CostModel::new(config.cost.cost_per_round),
    );
    orchestrator.recover().await?;

    web_api::start_server(config.server.clone(), orchestrator).await
}
