//! # Config — declarative service configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that configures the HTTP server, the
//! dispatch pool, the runner subprocess, evaluation, cost and persistence.
//! ```text
//! negotiation-orchestrator --config orchestrator.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `OrchestratorConfig`
//! - Complete: every field has a documented default, so an empty file is valid
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the orchestrator from config (that belongs to `main`)
//! - CLI flag parsing (that belongs to `main`)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ── Default value functions ──────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Default maximum request body: 10 MB.
fn default_max_request_size() -> usize {
    10 * 1024 * 1024
}

/// Default WebSocket broadcast buffer.
fn default_event_capacity() -> usize {
    crate::notifier::DEFAULT_CAPACITY
}

/// Default dispatch slots.
fn default_max_concurrency() -> usize {
    3
}

/// Default runner timeout: 300 seconds.
fn default_run_timeout_secs() -> u64 {
    300
}

/// Default round limit before complexity scaling.
fn default_max_rounds() -> u32 {
    6
}

/// Hard cap on rounds per run.
fn default_absolute_max_rounds() -> u32 {
    20
}

fn default_python_bin() -> String {
    "python3".to_string()
}

fn default_runner_script() -> PathBuf {
    PathBuf::from("scripts/run_production_negotiation.py")
}

fn default_evaluation_script() -> PathBuf {
    PathBuf::from("scripts/evaluate_simulation.py")
}

/// Default evaluation timeout: 120 seconds.
fn default_evaluation_timeout_secs() -> u64 {
    120
}

/// Default cost of one negotiation round (USD).
pub(crate) fn default_cost_per_round() -> f64 {
    0.02
}

fn default_store_path() -> PathBuf {
    PathBuf::from("negotiations.db")
}

fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an orchestrator instance.
///
/// # Example
///
/// ```toml
/// catalog_file = "catalog.toml"
///
/// [queue]
/// max_concurrency = 3
/// run_timeout_secs = 300
///
/// [executor]
/// python_bin = "python3"
/// script_path = "scripts/run_production_negotiation.py"
///
/// [store]
/// backend = "sqlite"
/// path = "negotiations.db"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OrchestratorConfig {
    /// HTTP and WebSocket server.
    #[serde(default)]
    pub server: ServerConfig,
    /// Dispatch pool and round limits.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Runner subprocess.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Post-run evaluation subprocess.
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Cost estimation.
    #[serde(default)]
    pub cost: CostConfig,
    /// Persistence backend.
    #[serde(default)]
    pub store: StoreConfig,
    /// TOML file listing techniques and tactics. `None` starts with an
    /// empty catalog.
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,
}

// ── Server ───────────────────────────────────────────────────────────────

/// HTTP server configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServerConfig {
    /// IP address or hostname to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port the server listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum allowed request body size in bytes.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Events buffered per WebSocket client before it starts skipping.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size: default_max_request_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

// ── Queue ────────────────────────────────────────────────────────────────

/// Dispatch pool configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct QueueConfig {
    /// Runs executing at once, across all queues.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Seconds a runner may take before it is killed and the run marked
    /// `timeout`.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Base round limit when a scenario does not set one; scaled up for
    /// scenarios with many dimensions.
    #[serde(default = "default_max_rounds")]
    pub default_max_rounds: u32,
    /// Upper bound on rounds for any run.
    #[serde(default = "default_absolute_max_rounds")]
    pub absolute_max_rounds: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            run_timeout_secs: default_run_timeout_secs(),
            default_max_rounds: default_max_rounds(),
            absolute_max_rounds: default_absolute_max_rounds(),
        }
    }
}

// ── Executor ─────────────────────────────────────────────────────────────

/// Which executor runs simulations.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Spawn the runner script per run.
    #[default]
    Process,
    /// Built-in scripted negotiations; no subprocess. For demos and tests.
    Scripted,
}

/// Runner subprocess configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ExecutorConfig {
    /// Executor backend.
    #[serde(default)]
    pub kind: ExecutorKind,
    /// Interpreter used to launch the scripts.
    #[serde(default = "default_python_bin")]
    pub python_bin: String,
    /// Path of the negotiation runner script.
    #[serde(default = "default_runner_script")]
    pub script_path: PathBuf,
    /// Working directory for the subprocess. `None` inherits the service's.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables passed to the subprocess.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            python_bin: default_python_bin(),
            script_path: default_runner_script(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

// ── Evaluation ───────────────────────────────────────────────────────────

/// Post-run evaluation configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EvaluationConfig {
    /// Run the evaluation script after `DEAL_ACCEPTED` and `WALK_AWAY` runs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Path of the evaluation script.
    #[serde(default = "default_evaluation_script")]
    pub script_path: PathBuf,
    /// Seconds before the evaluation subprocess is killed.
    #[serde(default = "default_evaluation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            script_path: default_evaluation_script(),
            timeout_secs: default_evaluation_timeout_secs(),
        }
    }
}

// ── Cost ─────────────────────────────────────────────────────────────────

/// Cost estimation configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CostConfig {
    /// Cost of one negotiation round in USD.
    #[serde(default = "default_cost_per_round")]
    pub cost_per_round: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            cost_per_round: default_cost_per_round(),
        }
    }
}

// ── Store ────────────────────────────────────────────────────────────────

/// Persistence backend.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local; lost on restart.
    #[default]
    Memory,
    /// SQLite file (requires the `sqlite` feature).
    Sqlite,
}

/// Persistence configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StoreConfig {
    /// Backend kind.
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database file for the `sqlite` backend.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

/// Export the JSON Schema for `OrchestratorConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_string_pretty(&schema)
}
