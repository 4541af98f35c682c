//! # negotiation-orchestrator
//!
//! Simulation queue orchestrator for AI buyer/seller negotiations.
//!
//! A negotiation selects N influencing techniques and M negotiation tactics.
//! Starting it expands the selection into N×M simulation runs, which are
//! dispatched to an external negotiation runner through a bounded pool.
//!
//! ## Architecture
//!
//! ```text
//! POST /start ──► QueueOrchestrator::create_queue (N×M runs, pending)
//!                      │
//!                 Dispatcher (single task, pulls FIFO into `max_concurrency` slots)
//!                      │
//!                      ├──► RunExecutor ──► runner process ──► ROUND_UPDATE lines
//!                      ├──► RunExecutor ──► runner process
//!                      │
//!                 SimulationStore (runs + recomputed queue aggregates)
//!                      │
//!                 Notifier ──► /ws clients
//! ```

// ── Lint policy ────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod cost;
pub mod metrics;
pub mod notifier;
pub mod simulation;
pub mod store;

#[cfg(feature = "web-api")]
pub mod web_api;

// Re-exports for convenience
pub use notifier::{Notifier, SimulationEvent};
pub use simulation::catalog::Catalog;
pub use simulation::executor::{ProcessExecutor, RunExecutor, ScriptedExecutor};
pub use simulation::queue::QueueOrchestrator;
pub use store::{memory::MemoryStore, SimulationStore};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level errors surfaced by process startup.
///
/// Library layers have their own error types; this enum wraps them for
/// the binary and for callers that wire the whole service together.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] config::validation::ConfigError),

    /// The persistence layer failed.
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    /// A queue operation failed.
    #[error("simulation error: {0}")]
    Simulation(#[from] simulation::SimulationError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Generate a fresh record identifier.
///
/// # Panics
///
/// This function never panics.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_other_error_display_is_message() {
        let err = OrchestratorError::Other("boom".to_string());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // Another test may have installed a subscriber already.
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
