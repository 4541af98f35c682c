//! # Store — persistence for negotiations, queues and runs
//!
//! ## Responsibility
//! Persist the orchestrator's records behind the [`SimulationStore`] trait
//! so the orchestrator never depends on a concrete backend.
//!
//! ## Backends
//!
//! - [`memory::MemoryStore`] — process-local, used by tests and demos
//! - `sqlite::SqliteStore` — file-backed, survives restarts (feature `sqlite`)
//!
//! ## Guarantees
//! - Queues are returned oldest first
//! - Runs of a queue are returned ordered by `run_number`
//! - `update_*` on an unknown ID returns [`StoreError::NotFound`]
//!
//! ## NOT Responsible For
//! - Status transition rules (see: `simulation::model`)
//! - Serializing concurrent writers (see: `simulation::queue`)

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::simulation::model::{
    Negotiation, QueueStatus, RunStatus, SimulationQueue, SimulationRun,
};
use async_trait::async_trait;
use thiserror::Error;

/// Errors returned by store backends.
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Record to update does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind (`negotiation`, `queue`, `run`).
        kind: &'static str,
        /// Record ID.
        id: String,
    },

    /// A JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite failure.
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence operations used by the orchestrator.
///
/// Implementations must be thread-safe (Send + Sync); the trait is
/// object-safe so it can be shared as `Arc<dyn SimulationStore>`.
#[async_trait]
pub trait SimulationStore: Send + Sync {
    /// Insert a new negotiation.
    async fn insert_negotiation(&self, negotiation: &Negotiation) -> StoreResult<()>;

    /// Fetch a negotiation by ID.
    async fn get_negotiation(&self, id: &str) -> StoreResult<Option<Negotiation>>;

    /// Overwrite an existing negotiation.
    async fn update_negotiation(&self, negotiation: &Negotiation) -> StoreResult<()>;

    /// Insert a queue together with all of its runs, atomically.
    async fn insert_queue(&self, queue: &SimulationQueue, runs: &[SimulationRun])
        -> StoreResult<()>;

    /// Fetch a queue by ID.
    async fn get_queue(&self, id: &str) -> StoreResult<Option<SimulationQueue>>;

    /// Overwrite an existing queue.
    async fn update_queue(&self, queue: &SimulationQueue) -> StoreResult<()>;

    /// All queues of a negotiation, oldest first.
    async fn queues_for_negotiation(&self, negotiation_id: &str)
        -> StoreResult<Vec<SimulationQueue>>;

    /// All queues in the given status, oldest first.
    async fn queues_with_status(&self, status: QueueStatus) -> StoreResult<Vec<SimulationQueue>>;

    /// Fetch a run by ID.
    async fn get_run(&self, id: &str) -> StoreResult<Option<SimulationRun>>;

    /// All runs of a queue, ordered by `run_number`.
    async fn runs_for_queue(&self, queue_id: &str) -> StoreResult<Vec<SimulationRun>>;

    /// All runs in the given status, across queues.
    async fn runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<SimulationRun>>;

    /// Overwrite an existing run.
    async fn update_run(&self, run: &SimulationRun) -> StoreResult<()>;
}
