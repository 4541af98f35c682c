//! # Simulation — technique × tactic run orchestration
//!
//! ## Responsibility
//! Expand a negotiation's selected techniques and tactics into simulation
//! runs, dispatch them through a bounded pool to an external runner, and
//! keep queue aggregates consistent with run statuses.
//!
//! ## Architecture
//!
//! ```text
//! create_queue ──► SimulationQueue + N×M SimulationRun (pending)
//!                      │
//!                 Dispatcher ──► slot 0 ──► RunExecutor
//!                      │     ──► slot 1 ──► RunExecutor
//!                      │     ──► slot K ──► RunExecutor
//!                      │
//!                 finish_run ──► outcome analysis ──► recompute aggregates
//! ```
//!
//! ## Modules
//!
//! - [`model`] — negotiations, queues, runs and their status enums
//! - [`catalog`] — technique and tactic catalog loaded from TOML
//! - [`outcome`] — deal value, dimension and product results
//! - [`executor`] — `RunExecutor` trait, subprocess and scripted executors
//! - [`queue`] — `QueueOrchestrator`: create/start/pause/resume/stop/restart
//! - [`dispatcher`] — single dispatch loop feeding the bounded pool
//!
//! ## Guarantees
//!
//! - **No double dispatch**: runs are claimed pending→running under a
//!   per-queue lock by a single dispatcher task
//! - **Consistent aggregates**: queue counts are recomputed from runs on
//!   every transition
//! - **Isolated failures**: a failed or timed-out run never aborts its queue
//! - **Cooperative stop**: pause/stop never kill an in-flight runner
//!
//! ## NOT Responsible For
//!
//! - Negotiation dialogue generation (external runner process)
//! - HTTP routing (see: `web_api`)
//! - Persistence details (see: `store`)

pub mod catalog;
pub mod dispatcher;
pub mod executor;
pub mod model;
pub mod outcome;
pub mod queue;

use crate::store::StoreError;
use thiserror::Error;

/// Errors returned by queue and run operations.
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Error, Debug)]
pub enum SimulationError {
    /// Input failed validation (empty selection, unknown catalog id, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced negotiation does not exist.
    #[error("negotiation not found: {id}")]
    NegotiationNotFound {
        /// The negotiation ID that was looked up.
        id: String,
    },

    /// Referenced queue does not exist.
    #[error("simulation queue not found: {id}")]
    QueueNotFound {
        /// The queue ID that was looked up.
        id: String,
    },

    /// Referenced run does not exist.
    #[error("simulation run not found: {id}")]
    RunNotFound {
        /// The run ID that was looked up.
        id: String,
    },

    /// The requested operation is not allowed from the current status.
    #[error("cannot {action} {entity} {id} in status {status}")]
    InvalidTransition {
        /// Kind of record (`queue` or `run`).
        entity: &'static str,
        /// Record ID.
        id: String,
        /// Status the record was in.
        status: String,
        /// Operation that was attempted.
        action: &'static str,
    },

    /// The persistence layer failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SimulationError {
    /// Build an [`SimulationError::InvalidTransition`] for a queue.
    pub(crate) fn queue_transition(
        id: &str,
        status: impl std::fmt::Display,
        action: &'static str,
    ) -> Self {
        Self::InvalidTransition {
            entity: "queue",
            id: id.to_string(),
            status: status.to_string(),
            action,
        }
    }

    /// Build an [`SimulationError::InvalidTransition`] for a run.
    pub(crate) fn run_transition(
        id: &str,
        status: impl std::fmt::Display,
        action: &'static str,
    ) -> Self {
        Self::InvalidTransition {
            entity: "run",
            id: id.to_string(),
            status: status.to_string(),
            action,
        }
    }
}
