//! # Dispatcher — bounded pull loop feeding the executor
//!
//! ## Responsibility
//! Own the global slot pool and the single task that claims pending runs
//! into free slots. Run tasks execute a claimed job, record the result and
//! signal the loop when their slot frees.
//!
//! ## Guarantees
//! - Bounded: at most `max_concurrency` runs hold a slot at any time
//! - Single claimer: only the dispatch loop claims runs, one at a time
//! - Coalescing: a burst of signals triggers one pump pass
//! - Detached: the loop exits once the orchestrator is dropped
//! - Never stranded: a run whose result cannot be recorded is failed
//!   instead, and a run no task holds can be restarted
//!
//! ## NOT Responsible For
//! - Queue status transitions (see: queue.rs)
//! - Spawning runner processes (see: executor.rs)

use super::executor::{RoundUpdate, RunJob};
use super::queue::QueueOrchestrator;
use crate::metrics;
use crate::notifier::EventKind;
use dashmap::DashSet;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Messages consumed by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DispatchSignal {
    /// A queue was started, resumed or had runs reset.
    Kick,
    /// A run released its slot.
    Finished {
        /// Run that finished.
        run_id: String,
    },
}

/// Handle to the slot pool and the dispatch loop's inbox.
///
/// # Panics
///
/// No methods on this type panic.
pub struct Dispatcher {
    slots: Arc<Semaphore>,
    capacity: usize,
    signals: mpsc::UnboundedSender<DispatchSignal>,
    held: DashSet<String>,
}

impl Dispatcher {
    /// Create a pool of `capacity` slots and the receiving end of its inbox.
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<DispatchSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        (
            Self {
                slots: Arc::new(Semaphore::new(capacity)),
                capacity,
                signals,
                held: DashSet::new(),
            },
            rx,
        )
    }

    /// Ask the loop to pull pending runs into free slots.
    pub fn kick(&self) {
        let _ = self.signals.send(DispatchSignal::Kick);
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Runs currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.slots.available_permits())
    }

    /// Whether a run task currently owns `run_id`.
    pub fn holds(&self, run_id: &str) -> bool {
        self.held.contains(run_id)
    }

    /// Mark `run_id` as owned by a run task. Called under the queue lock
    /// at claim time.
    pub(crate) fn hold(&self, run_id: &str) {
        self.held.insert(run_id.to_string());
    }

    fn finished(&self, run_id: String) {
        self.held.remove(&run_id);
        let _ = self.signals.send(DispatchSignal::Finished { run_id });
    }

    fn try_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }
}

/// Start the dispatch loop for `orchestrator`.
///
/// The loop holds a weak reference; it exits when the inbox closes or the
/// orchestrator is dropped.
///
/// # Panics
///
/// Panics if called outside a Tokio runtime.
pub(crate) fn spawn_loop(
    orchestrator: Weak<QueueOrchestrator>,
    mut rx: mpsc::UnboundedReceiver<DispatchSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            if let DispatchSignal::Finished { run_id } = &signal {
                debug!(run_id = %run_id, "slot released");
            }
            // Collapse whatever else is already queued into this pass.
            while rx.try_recv().is_ok() {}

            let Some(orch) = orchestrator.upgrade() else {
                break;
            };
            pump(&orch).await;
        }
        debug!("dispatch loop exited");
    })
}

/// Fill free slots with pending runs until either runs out.
async fn pump(orch: &Arc<QueueOrchestrator>) {
    loop {
        let Some(permit) = orch.dispatcher().try_slot() else {
            return;
        };
        match orch.claim_next().await {
            Ok(Some(job)) => {
                metrics::set_runs_in_flight(orch.dispatcher().in_flight() as i64);
                spawn_run(Arc::clone(orch), job, permit);
            }
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "claiming next run failed");
                return;
            }
        }
    }
}

/// Execute one claimed job on its own task.
fn spawn_run(orch: Arc<QueueOrchestrator>, job: RunJob, permit: OwnedSemaphorePermit) {
    tokio::spawn(async move {
        info!(
            run_id = %job.run_id,
            queue_id = %job.queue_id,
            run_number = job.run_number,
            technique = %job.technique.id,
            tactic = %job.tactic.id,
            executor = orch.executor().name(),
            "simulation dispatched"
        );
        let started = Instant::now();

        let (rounds_tx, mut rounds_rx) = mpsc::unbounded_channel::<RoundUpdate>();
        let forward = {
            let notifier = orch.notifier().clone();
            let negotiation_id = job.negotiation_id.clone();
            let run_id = job.run_id.clone();
            let queue_id = job.queue_id.clone();
            tokio::spawn(async move {
                while let Some(update) = rounds_rx.recv().await {
                    notifier.emit(
                        EventKind::SimulationRound,
                        &negotiation_id,
                        json!({
                            "runId": run_id,
                            "queueId": queue_id,
                            "round": update.round,
                            "agent": update.agent,
                            "message": update.message,
                            "offer": update.offer,
                            "action": update.action,
                        }),
                    );
                }
            })
        };

        let result = orch.executor().execute(&job, rounds_tx).await;
        let _ = forward.await;

        let evaluation = match &result {
            Ok(report) => match orch.executor().evaluate(&job, report).await {
                Ok(evaluation) => evaluation,
                Err(e) => {
                    warn!(run_id = %job.run_id, error = %e, "evaluation failed");
                    None
                }
            },
            Err(_) => None,
        };

        if let Err(e) = orch
            .finish_run(&job, result, evaluation, started.elapsed())
            .await
        {
            warn!(run_id = %job.run_id, error = %e, "recording run result failed");
            if let Err(e) = orch.fail_unrecorded(&job, &e).await {
                error!(run_id = %job.run_id, error = %e, "run left running; restart it once the store recovers");
            }
        }

        drop(permit);
        metrics::set_runs_in_flight(orch.dispatcher().in_flight() as i64);
        orch.dispatcher().finished(job.run_id);
    });
}
