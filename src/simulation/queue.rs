//! # QueueOrchestrator — simulation queue lifecycle
//!
//! ## Responsibility
//! Create queues of technique × tactic runs, drive their status through
//! start/pause/resume/stop/restart, claim runs for the dispatcher and fold
//! each run result back into the queue aggregates.
//!
//! ## Guarantees
//! - Serialized: every transition of a queue or its runs holds that
//!   queue's lock; starting a negotiation holds the negotiation's lock
//! - Bounded locks: a lock entry lives only while someone holds or awaits it
//! - Derived aggregates: counts and actual cost are recomputed from the
//!   runs after every transition
//! - Cooperative: pause and stop only block new dispatch
//! - Recoverable: runs orphaned by a previous process return to pending
//!
//! ## NOT Responsible For
//! - Slot accounting and spawning run tasks (see: dispatcher.rs)
//! - Talking to the runner (see: executor.rs)

use super::catalog::{Catalog, Tactic, Technique};
use super::dispatcher::{self, Dispatcher};
use super::executor::{ExecutorError, RunExecutor, RunJob, RunReport};
use super::model::{
    Evaluation, Negotiation, NegotiationStatus, QueueProgress, QueueStatus, RunCompletion,
    RunStatus, RunTally, Scenario, SimulationQueue, SimulationRun,
};
use super::outcome;
use super::SimulationError;
use crate::config::QueueConfig;
use crate::cost::{CostModel, CostSnapshot, CostTracker};
use crate::metrics;
use crate::notifier::{EventKind, Notifier};
use crate::store::SimulationStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Writes attempted when a run result could not be recorded.
const UNRECORDED_RETRIES: u32 = 3;
const UNRECORDED_BACKOFF: Duration = Duration::from_millis(50);

/// A run with its technique and tactic records resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// The run record.
    #[serde(flatten)]
    pub run: SimulationRun,
    /// Technique record, `None` if no longer in the catalog.
    pub technique: Option<Technique>,
    /// Tactic record, `None` if no longer in the catalog.
    pub tactic: Option<Tactic>,
}

/// Result of [`QueueOrchestrator::restart_failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartReport {
    /// Queue the runs belong to.
    pub queue_id: String,
    /// IDs of the runs reset to pending.
    pub restarted: Vec<String>,
    /// Queue status after the restart.
    pub status: QueueStatus,
}

/// Result of [`QueueOrchestrator::recover`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Runs moved from `running` back to `pending`.
    pub requeued_runs: usize,
    /// Running queues handed back to the dispatcher.
    pub resumed_queues: usize,
}

/// Owns every simulation queue and the dispatcher feeding them.
///
/// # Usage
///
/// ```rust,no_run
/// use negotiation_orchestrator::config::QueueConfig;
/// use negotiation_orchestrator::cost::CostModel;
/// use negotiation_orchestrator::{Catalog, MemoryStore, Notifier, QueueOrchestrator, ScriptedExecutor};
/// use std::sync::Arc;
///
/// # async fn example(catalog: Catalog) -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = QueueOrchestrator::new(
///     Arc::new(MemoryStore::new()),
///     Arc::new(ScriptedExecutor::new()),
///     Arc::new(catalog),
///     Notifier::default(),
///     QueueConfig::default(),
///     CostModel::default(),
/// );
/// let recovered = orchestrator.recover().await?;
/// # Ok(())
/// # }
/// ```
///
/// # Panics
///
/// [`QueueOrchestrator::new`] panics outside a Tokio runtime. No other
/// method panics.
pub struct QueueOrchestrator {
    store: Arc<dyn SimulationStore>,
    executor: Arc<dyn RunExecutor>,
    catalog: Arc<Catalog>,
    notifier: Notifier,
    config: QueueConfig,
    cost_model: CostModel,
    costs: CostTracker,
    queue_locks: KeyedLocks,
    negotiation_locks: KeyedLocks,
    dispatcher: Dispatcher,
}

impl QueueOrchestrator {
    /// Build the orchestrator and start its dispatch loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        store: Arc<dyn SimulationStore>,
        executor: Arc<dyn RunExecutor>,
        catalog: Arc<Catalog>,
        notifier: Notifier,
        config: QueueConfig,
        cost_model: CostModel,
    ) -> Arc<Self> {
        let (dispatcher, rx) = Dispatcher::new(config.max_concurrency.max(1));
        let orchestrator = Arc::new(Self {
            store,
            executor,
            catalog,
            notifier,
            config,
            cost_model,
            costs: CostTracker::new(),
            queue_locks: KeyedLocks::default(),
            negotiation_locks: KeyedLocks::default(),
            dispatcher,
        });
        dispatcher::spawn_loop(Arc::downgrade(&orchestrator), rx);
        orchestrator
    }

    /// The technique and tactic catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The event broadcaster.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// The slot pool.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn executor(&self) -> &Arc<dyn RunExecutor> {
        &self.executor
    }

    /// Service-wide cost totals since startup.
    pub fn cost_snapshot(&self) -> CostSnapshot {
        self.costs.snapshot()
    }

    async fn lock_queue(&self, queue_id: &str) -> KeyGuard<'_> {
        self.queue_locks.lock(queue_id).await
    }

    /// Lock entries currently held or awaited, per queue and per negotiation.
    pub fn tracked_locks(&self) -> (usize, usize) {
        (self.queue_locks.len(), self.negotiation_locks.len())
    }

    // ── Negotiations ────────────────────────────────────────────────────

    /// Persist a new planned negotiation.
    ///
    /// # Errors
    ///
    /// [`SimulationError::Validation`] for an empty title or a dimension
    /// whose range is inverted.
    pub async fn create_negotiation(
        &self,
        title: &str,
        scenario: Scenario,
    ) -> Result<Negotiation, SimulationError> {
        let mut problems = Vec::new();
        if title.trim().is_empty() {
            problems.push("title must not be empty".to_string());
        }
        for dim in &scenario.dimensions {
            if dim.min_value > dim.max_value {
                problems.push(format!(
                    "dimension '{}': minValue {} > maxValue {}",
                    dim.name, dim.min_value, dim.max_value
                ));
            }
        }
        if !problems.is_empty() {
            return Err(SimulationError::Validation(problems.join("; ")));
        }

        let negotiation = Negotiation::new(title.trim(), scenario);
        self.store.insert_negotiation(&negotiation).await?;
        info!(negotiation_id = %negotiation.id, title = %negotiation.title, "negotiation created");
        Ok(negotiation)
    }

    /// Fetch a negotiation.
    ///
    /// # Errors
    ///
    /// [`SimulationError::NegotiationNotFound`] if it does not exist.
    pub async fn get_negotiation(&self, id: &str) -> Result<Negotiation, SimulationError> {
        self.store
            .get_negotiation(id)
            .await?
            .ok_or_else(|| SimulationError::NegotiationNotFound { id: id.to_string() })
    }

    async fn set_negotiation_status(
        &self,
        id: &str,
        status: NegotiationStatus,
    ) -> Result<(), SimulationError> {
        let mut negotiation = self.get_negotiation(id).await?;
        if negotiation.status != status {
            negotiation.set_status(status);
            self.store.update_negotiation(&negotiation).await?;
        }
        Ok(())
    }

    /// Round limit for runs of `scenario`.
    ///
    /// An explicit per-negotiation limit wins (clamped to the absolute
    /// cap); otherwise the default is scaled by dimension count.
    pub fn max_rounds_for(&self, scenario: &Scenario) -> u32 {
        let cap = self.config.absolute_max_rounds;
        match scenario.max_rounds {
            Some(n) => n.clamp(1, cap.max(1)),
            None => outcome::dynamic_max_rounds(
                self.config.default_max_rounds,
                scenario.dimensions.len(),
                cap,
            ),
        }
    }

    // ── Queue lifecycle ─────────────────────────────────────────────────

    /// Create a pending queue with one run per technique × tactic pair.
    ///
    /// Duplicate IDs are collapsed (first occurrence wins). Runs are
    /// numbered from 1 in technique-major order.
    ///
    /// # Errors
    ///
    /// - [`SimulationError::Validation`] if either list is empty or names
    ///   an ID missing from the catalog
    /// - [`SimulationError::NegotiationNotFound`] for an unknown negotiation
    pub async fn create_queue(
        &self,
        negotiation_id: &str,
        technique_ids: &[String],
        tactic_ids: &[String],
    ) -> Result<SimulationQueue, SimulationError> {
        let techniques = dedup(technique_ids);
        let tactics = dedup(tactic_ids);
        if techniques.is_empty() {
            return Err(SimulationError::Validation(
                "at least one technique is required".to_string(),
            ));
        }
        if tactics.is_empty() {
            return Err(SimulationError::Validation(
                "at least one tactic is required".to_string(),
            ));
        }
        self.catalog.ensure_known(&techniques, &tactics)?;
        let negotiation = self.get_negotiation(negotiation_id).await?;

        let total = u32::try_from(techniques.len() * tactics.len()).map_err(|_| {
            SimulationError::Validation("too many technique × tactic combinations".to_string())
        })?;
        let max_rounds = self.max_rounds_for(&negotiation.scenario);
        let estimated = self.cost_model.estimate_queue(total, max_rounds);
        let queue = SimulationQueue::new(&negotiation.id, total, estimated);

        let runs: Vec<SimulationRun> = techniques
            .iter()
            .flat_map(|t| tactics.iter().map(move |k| (t, k)))
            .zip(1..)
            .map(|((technique, tactic), n)| {
                SimulationRun::new(&queue.id, &negotiation.id, technique, tactic, n)
            })
            .collect();

        self.store.insert_queue(&queue, &runs).await?;
        self.costs.record_estimate(estimated);
        metrics::inc_queue_transition("created");
        info!(
            queue_id = %queue.id,
            negotiation_id = %negotiation.id,
            total,
            max_rounds,
            estimated_cost = estimated,
            "simulation queue created"
        );
        self.notifier.emit(
            EventKind::QueueCreated,
            &negotiation.id,
            json!({
                "queueId": queue.id,
                "totalSimulations": total,
                "estimatedCost": estimated,
                "maxRounds": max_rounds,
            }),
        );
        Ok(queue)
    }

    /// Fetch a queue.
    ///
    /// # Errors
    ///
    /// [`SimulationError::QueueNotFound`] if it does not exist.
    pub async fn get_queue(&self, queue_id: &str) -> Result<SimulationQueue, SimulationError> {
        self.store
            .get_queue(queue_id)
            .await?
            .ok_or_else(|| SimulationError::QueueNotFound {
                id: queue_id.to_string(),
            })
    }

    /// Begin dispatching a pending (or paused) queue.
    ///
    /// Starting a running queue is a no-op.
    ///
    /// # Errors
    ///
    /// - [`SimulationError::QueueNotFound`]
    /// - [`SimulationError::InvalidTransition`] for a terminal queue
    pub async fn start(&self, queue_id: &str) -> Result<SimulationQueue, SimulationError> {
        let _guard = self.lock_queue(queue_id).await;

        let mut queue = self.get_queue(queue_id).await?;
        match queue.status {
            QueueStatus::Running => return Ok(queue),
            QueueStatus::Pending | QueueStatus::Paused => {}
            status => return Err(SimulationError::queue_transition(queue_id, status, "start")),
        }
        queue.set_status(QueueStatus::Running);
        self.store.update_queue(&queue).await?;
        self.set_negotiation_status(&queue.negotiation_id, NegotiationStatus::Running)
            .await?;

        metrics::inc_queue_transition("started");
        info!(queue_id, "simulation queue started");
        self.notifier.emit(
            EventKind::QueueStarted,
            &queue.negotiation_id,
            json!({ "queueId": queue.id, "totalSimulations": queue.total_simulations }),
        );
        let queue = self.refresh_locked(queue_id).await?;
        self.dispatcher.kick();
        Ok(queue)
    }

    /// Stop dispatching new runs. In-flight runs finish normally.
    ///
    /// Pausing a paused queue is a no-op.
    ///
    /// # Errors
    ///
    /// - [`SimulationError::QueueNotFound`]
    /// - [`SimulationError::InvalidTransition`] unless running or paused
    pub async fn pause(&self, queue_id: &str) -> Result<SimulationQueue, SimulationError> {
        let _guard = self.lock_queue(queue_id).await;

        let mut queue = self.get_queue(queue_id).await?;
        match queue.status {
            QueueStatus::Paused => return Ok(queue),
            QueueStatus::Running => {}
            status => return Err(SimulationError::queue_transition(queue_id, status, "pause")),
        }
        queue.set_status(QueueStatus::Paused);
        self.store.update_queue(&queue).await?;

        metrics::inc_queue_transition("paused");
        info!(queue_id, "simulation queue paused");
        self.notifier.emit(
            EventKind::QueuePaused,
            &queue.negotiation_id,
            json!({ "queueId": queue.id }),
        );
        Ok(queue)
    }

    /// Resume dispatching a paused queue.
    ///
    /// Resuming a running queue is a no-op.
    ///
    /// # Errors
    ///
    /// - [`SimulationError::QueueNotFound`]
    /// - [`SimulationError::InvalidTransition`] unless paused or running
    pub async fn resume(&self, queue_id: &str) -> Result<SimulationQueue, SimulationError> {
        let _guard = self.lock_queue(queue_id).await;

        let mut queue = self.get_queue(queue_id).await?;
        match queue.status {
            QueueStatus::Running => return Ok(queue),
            QueueStatus::Paused => {}
            status => return Err(SimulationError::queue_transition(queue_id, status, "resume")),
        }
        queue.set_status(QueueStatus::Running);
        self.store.update_queue(&queue).await?;

        metrics::inc_queue_transition("resumed");
        info!(queue_id, "simulation queue resumed");
        self.notifier.emit(
            EventKind::QueueResumed,
            &queue.negotiation_id,
            json!({ "queueId": queue.id }),
        );
        // A queue paused after its last dispatch may already be done.
        let queue = self.refresh_locked(queue_id).await?;
        self.dispatcher.kick();
        Ok(queue)
    }

    /// Halt a queue for good. Pending runs stay pending; in-flight runs
    /// finish and are recorded.
    ///
    /// Stopping a stopped queue is a no-op.
    ///
    /// # Errors
    ///
    /// - [`SimulationError::QueueNotFound`]
    /// - [`SimulationError::InvalidTransition`] for a completed or failed queue
    pub async fn stop(&self, queue_id: &str) -> Result<SimulationQueue, SimulationError> {
        let _guard = self.lock_queue(queue_id).await;

        let mut queue = self.get_queue(queue_id).await?;
        match queue.status {
            QueueStatus::Stopped => return Ok(queue),
            QueueStatus::Completed | QueueStatus::Failed => {
                return Err(SimulationError::queue_transition(queue_id, queue.status, "stop"))
            }
            _ => {}
        }
        queue.set_status(QueueStatus::Stopped);
        self.store.update_queue(&queue).await?;
        self.set_negotiation_status(&queue.negotiation_id, NegotiationStatus::Aborted)
            .await?;

        metrics::inc_queue_transition("stopped");
        info!(queue_id, "simulation queue stopped");
        self.notifier.emit(
            EventKind::QueueStopped,
            &queue.negotiation_id,
            json!({ "queueId": queue.id }),
        );
        Ok(queue)
    }

    /// Reset every failed and timed-out run of a queue to pending.
    ///
    /// A completed or failed queue with restarted runs reopens to running;
    /// a pending or paused queue keeps its status.
    ///
    /// # Errors
    ///
    /// - [`SimulationError::QueueNotFound`]
    /// - [`SimulationError::InvalidTransition`] for a stopped queue
    pub async fn restart_failed(&self, queue_id: &str) -> Result<RestartReport, SimulationError> {
        let _guard = self.lock_queue(queue_id).await;

        let queue = self.get_queue(queue_id).await?;
        if queue.status == QueueStatus::Stopped {
            return Err(SimulationError::queue_transition(
                queue_id,
                queue.status,
                "restart failed runs of",
            ));
        }

        let mut restarted = Vec::new();
        for mut run in self.store.runs_for_queue(queue_id).await? {
            if !run.status.is_failure() {
                continue;
            }
            run.reset()?;
            self.store.update_run(&run).await?;
            self.emit_restarted(&run);
            restarted.push(run.id);
        }

        if !restarted.is_empty() {
            self.reopen_locked(queue).await?;
        }
        let queue = self.refresh_locked(queue_id).await?;
        info!(queue_id, restarted = restarted.len(), "failed runs restarted");
        if queue.status.accepts_dispatch() {
            self.dispatcher.kick();
        }
        Ok(RestartReport {
            queue_id: queue_id.to_string(),
            restarted,
            status: queue.status,
        })
    }

    /// Reset one terminal run to pending.
    ///
    /// A pending run is returned unchanged. A completed or failed queue
    /// reopens to running; otherwise the run waits for its queue.
    ///
    /// # Errors
    ///
    /// - [`SimulationError::RunNotFound`]
    /// - [`SimulationError::InvalidTransition`] for a run a task is still
    ///   executing. A `running` run that no task holds (its result was
    ///   never recorded) is restarted like a failed one.
    pub async fn restart_single(&self, run_id: &str) -> Result<SimulationRun, SimulationError> {
        let queue_id = self.get_run(run_id).await?.queue_id;
        let _guard = self.lock_queue(&queue_id).await;

        let mut run = self.get_run(run_id).await?;
        match run.status {
            RunStatus::Pending => return Ok(run),
            RunStatus::Running if self.dispatcher.holds(run_id) => {
                return Err(SimulationError::run_transition(run_id, run.status, "restart"))
            }
            RunStatus::Running => {
                warn!(run_id, queue_id = %queue_id, "restarting run no task holds");
                run.fail(RunStatus::Failed, "abandoned without a recorded result")?;
            }
            _ => {}
        }
        run.reset()?;
        self.store.update_run(&run).await?;
        self.emit_restarted(&run);
        info!(run_id, queue_id = %queue_id, attempt = run.attempt, "run restarted");

        let queue = self.get_queue(&queue_id).await?;
        self.reopen_locked(queue).await?;
        let queue = self.refresh_locked(&queue_id).await?;
        if queue.status.accepts_dispatch() {
            self.dispatcher.kick();
        }
        Ok(run)
    }

    /// Start the negotiation's simulations.
    ///
    /// Resumes the latest queue if it is pending, paused or running;
    /// otherwise creates a new queue from the scenario's selection and
    /// starts it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::create_queue`] and [`Self::start`].
    pub async fn start_negotiation(
        &self,
        negotiation_id: &str,
    ) -> Result<SimulationQueue, SimulationError> {
        let _guard = self.negotiation_locks.lock(negotiation_id).await;
        let negotiation = self.get_negotiation(negotiation_id).await?;
        let latest = self
            .store
            .queues_for_negotiation(negotiation_id)
            .await?
            .into_iter()
            .rev()
            .find(|q| !q.status.is_terminal());

        let queue_id = match latest {
            Some(queue) => queue.id,
            None => {
                self.create_queue(
                    negotiation_id,
                    &negotiation.scenario.technique_ids,
                    &negotiation.scenario.tactic_ids,
                )
                .await?
                .id
            }
        };
        self.start(&queue_id).await
    }

    /// Put a terminal-but-reopenable queue back to running.
    async fn reopen_locked(&self, mut queue: SimulationQueue) -> Result<(), SimulationError> {
        if !matches!(queue.status, QueueStatus::Completed | QueueStatus::Failed) {
            return Ok(());
        }
        queue.set_status(QueueStatus::Running);
        self.store.update_queue(&queue).await?;
        self.set_negotiation_status(&queue.negotiation_id, NegotiationStatus::Running)
            .await?;
        metrics::inc_queue_transition("reopened");
        debug!(queue_id = %queue.id, "queue reopened");
        Ok(())
    }

    fn emit_restarted(&self, run: &SimulationRun) {
        self.notifier.emit(
            EventKind::SimulationRestarted,
            &run.negotiation_id,
            json!({
                "runId": run.id,
                "queueId": run.queue_id,
                "runNumber": run.run_number,
                "attempt": run.attempt,
            }),
        );
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Progress snapshot of a queue.
    ///
    /// # Errors
    ///
    /// [`SimulationError::QueueNotFound`] if it does not exist.
    pub async fn queue_status(&self, queue_id: &str) -> Result<QueueProgress, SimulationError> {
        let queue = self.get_queue(queue_id).await?;
        let runs = self.store.runs_for_queue(queue_id).await?;
        Ok(QueueProgress::new(&queue, &RunTally::from_runs(&runs)))
    }

    /// Every run of a queue with its technique and tactic resolved.
    ///
    /// # Errors
    ///
    /// [`SimulationError::QueueNotFound`] if it does not exist.
    pub async fn queue_results(&self, queue_id: &str) -> Result<Vec<RunResult>, SimulationError> {
        self.get_queue(queue_id).await?;
        let runs = self.store.runs_for_queue(queue_id).await?;
        Ok(runs
            .into_iter()
            .map(|run| RunResult {
                technique: self.catalog.technique(&run.technique_id).cloned(),
                tactic: self.catalog.tactic(&run.tactic_id).cloned(),
                run,
            })
            .collect())
    }

    /// Fetch a run.
    ///
    /// # Errors
    ///
    /// [`SimulationError::RunNotFound`] if it does not exist.
    pub async fn get_run(&self, run_id: &str) -> Result<SimulationRun, SimulationError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| SimulationError::RunNotFound {
                id: run_id.to_string(),
            })
    }

    /// Queues of a negotiation, oldest first.
    ///
    /// # Errors
    ///
    /// [`SimulationError::NegotiationNotFound`] if it does not exist.
    pub async fn queues_for_negotiation(
        &self,
        negotiation_id: &str,
    ) -> Result<Vec<SimulationQueue>, SimulationError> {
        self.get_negotiation(negotiation_id).await?;
        Ok(self.store.queues_for_negotiation(negotiation_id).await?)
    }

    // ── Recovery ────────────────────────────────────────────────────────

    /// Return runs left `running` by a previous process to pending and
    /// hand running queues back to the dispatcher.
    ///
    /// Call once at startup, before serving requests.
    ///
    /// # Errors
    ///
    /// [`SimulationError::Store`] if the store cannot be read or written.
    pub async fn recover(&self) -> Result<RecoveryReport, SimulationError> {
        let mut report = RecoveryReport::default();
        for run in self.store.runs_with_status(RunStatus::Running).await? {
            let _guard = self.lock_queue(&run.queue_id).await;
            let mut run = self.get_run(&run.id).await?;
            if run.status != RunStatus::Running {
                continue;
            }
            run.requeue_orphan();
            self.store.update_run(&run).await?;
            warn!(run_id = %run.id, queue_id = %run.queue_id, "orphaned run requeued");
            report.requeued_runs += 1;
        }

        for queue in self.store.queues_with_status(QueueStatus::Running).await? {
            let _guard = self.lock_queue(&queue.id).await;
            self.refresh_locked(&queue.id).await?;
            report.resumed_queues += 1;
        }

        if report.resumed_queues > 0 {
            self.dispatcher.kick();
        }
        info!(
            requeued_runs = report.requeued_runs,
            resumed_queues = report.resumed_queues,
            "recovery complete"
        );
        Ok(report)
    }

    // ── Dispatcher hooks ────────────────────────────────────────────────

    /// Claim the next pending run of the oldest running queue.
    pub(crate) async fn claim_next(&self) -> Result<Option<RunJob>, SimulationError> {
        for queue in self.store.queues_with_status(QueueStatus::Running).await? {
            match self.claim_from(&queue.id).await {
                Ok(Some(job)) => return Ok(Some(job)),
                Ok(None) => {}
                Err(e) => warn!(queue_id = %queue.id, error = %e, "skipping queue during claim"),
            }
        }
        Ok(None)
    }

    async fn claim_from(&self, queue_id: &str) -> Result<Option<RunJob>, SimulationError> {
        let _guard = self.lock_queue(queue_id).await;

        let queue = self.get_queue(queue_id).await?;
        if !queue.status.accepts_dispatch() {
            return Ok(None);
        }
        let Some(mut run) = self
            .store
            .runs_for_queue(queue_id)
            .await?
            .into_iter()
            .find(|r| r.status.is_claimable())
        else {
            return Ok(None);
        };

        let negotiation = self.get_negotiation(&queue.negotiation_id).await?;
        run.begin()?;
        self.store.update_run(&run).await?;
        self.dispatcher.hold(&run.id);

        self.notifier.emit(
            EventKind::SimulationStarted,
            &run.negotiation_id,
            json!({
                "runId": run.id,
                "queueId": run.queue_id,
                "runNumber": run.run_number,
                "techniqueId": run.technique_id,
                "tacticId": run.tactic_id,
                "attempt": run.attempt,
            }),
        );
        Ok(Some(self.job_for(&run, &negotiation)))
    }

    fn job_for(&self, run: &SimulationRun, negotiation: &Negotiation) -> RunJob {
        let technique = self
            .catalog
            .technique(&run.technique_id)
            .cloned()
            .unwrap_or_else(|| Technique {
                id: run.technique_id.clone(),
                name: run.technique_id.clone(),
                description: String::new(),
                category: None,
            });
        let tactic = self
            .catalog
            .tactic(&run.tactic_id)
            .cloned()
            .unwrap_or_else(|| Tactic {
                id: run.tactic_id.clone(),
                name: run.tactic_id.clone(),
                description: String::new(),
                category: None,
            });
        RunJob {
            run_id: run.id.clone(),
            queue_id: run.queue_id.clone(),
            negotiation_id: run.negotiation_id.clone(),
            title: negotiation.title.clone(),
            run_number: run.run_number,
            attempt: run.attempt,
            scenario: negotiation.scenario.clone(),
            technique,
            tactic,
            max_rounds: self.max_rounds_for(&negotiation.scenario),
        }
    }

    /// Record the executor's result for a claimed job and recompute the
    /// queue.
    pub(crate) async fn finish_run(
        &self,
        job: &RunJob,
        result: Result<RunReport, ExecutorError>,
        evaluation: Option<Evaluation>,
        elapsed: Duration,
    ) -> Result<(), SimulationError> {
        let _guard = self.lock_queue(&job.queue_id).await;

        let mut run = self.get_run(&job.run_id).await?;
        if run.status != RunStatus::Running || run.attempt != job.attempt {
            debug!(run_id = %run.id, status = %run.status, "discarding stale result");
            return Ok(());
        }

        let kind = match result {
            Ok(report) => {
                let completion = self.completion_for(job, report);
                let cost = completion.actual_cost;
                run.complete(completion)?;
                run.evaluation = evaluation;
                self.costs.record_run(cost);
                metrics::add_cost(cost);
                info!(
                    run_id = %run.id,
                    queue_id = %run.queue_id,
                    outcome = ?run.outcome,
                    rounds = ?run.total_rounds,
                    deal_value = ?run.deal_value,
                    cost,
                    "simulation completed"
                );
                EventKind::SimulationCompleted
            }
            Err(e) => {
                let status = if e.is_timeout() {
                    RunStatus::Timeout
                } else {
                    RunStatus::Failed
                };
                metrics::inc_executor_error(e.kind());
                warn!(run_id = %run.id, queue_id = %run.queue_id, error = %e, "simulation {status}");
                run.fail(status, e.to_string())?;
                if status == RunStatus::Timeout {
                    EventKind::SimulationTimeout
                } else {
                    EventKind::SimulationFailed
                }
            }
        };
        self.store.update_run(&run).await?;
        metrics::record_run_finished(run.status.as_str(), elapsed);

        self.notifier.emit(
            kind,
            &run.negotiation_id,
            json!({
                "runId": run.id,
                "queueId": run.queue_id,
                "runNumber": run.run_number,
                "status": run.status,
                "outcome": run.outcome,
                "totalRounds": run.total_rounds,
                "dealValue": run.deal_value,
                "actualCost": run.actual_cost,
                "error": run.error_message,
            }),
        );

        self.refresh_locked(&job.queue_id).await?;
        Ok(())
    }

    /// Fail a claimed run whose result [`Self::finish_run`] could not
    /// record, retrying the write with a short backoff.
    pub(crate) async fn fail_unrecorded(
        &self,
        job: &RunJob,
        cause: &SimulationError,
    ) -> Result<(), SimulationError> {
        let mut attempt = 1;
        loop {
            match self.fail_unrecorded_once(job, cause).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= UNRECORDED_RETRIES => return Err(e),
                Err(e) => {
                    warn!(run_id = %job.run_id, attempt, error = %e, "retrying failure record");
                    tokio::time::sleep(UNRECORDED_BACKOFF * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn fail_unrecorded_once(
        &self,
        job: &RunJob,
        cause: &SimulationError,
    ) -> Result<(), SimulationError> {
        let _guard = self.lock_queue(&job.queue_id).await;

        let mut run = self.get_run(&job.run_id).await?;
        if run.attempt != job.attempt {
            return Ok(());
        }
        if run.status == RunStatus::Running {
            run.fail(RunStatus::Failed, format!("result not recorded: {cause}"))?;
            self.store.update_run(&run).await?;
            self.notifier.emit(
                EventKind::SimulationFailed,
                &run.negotiation_id,
                json!({
                    "runId": run.id,
                    "queueId": run.queue_id,
                    "runNumber": run.run_number,
                    "status": run.status,
                    "error": run.error_message,
                }),
            );
        }
        // Also covers a terminal write that landed before the refresh failed.
        self.refresh_locked(&job.queue_id).await?;
        Ok(())
    }

    fn completion_for(&self, job: &RunJob, report: RunReport) -> RunCompletion {
        let (deal_value, dimension_results, product_results) = match &report.final_offer {
            Some(offer) => (
                outcome::deal_value(&job.scenario, offer),
                outcome::dimension_results(&job.scenario, offer),
                outcome::product_results(&job.scenario, offer),
            ),
            None => (None, Vec::new(), Vec::new()),
        };
        RunCompletion {
            outcome: report.outcome,
            total_rounds: report.total_rounds,
            deal_value,
            final_offer: report.final_offer,
            conversation_log: report.conversation_log,
            dimension_results,
            product_results,
            actual_cost: self
                .cost_model
                .actual_run(report.actual_cost, report.total_rounds),
            trace_id: report.langfuse_trace_id,
        }
    }

    /// Recompute aggregates from the runs and finish the queue once every
    /// run is terminal. Caller holds the queue lock.
    async fn refresh_locked(&self, queue_id: &str) -> Result<SimulationQueue, SimulationError> {
        let mut queue = self.get_queue(queue_id).await?;
        let runs = self.store.runs_for_queue(queue_id).await?;
        let tally = RunTally::from_runs(&runs);
        queue.apply_tally(&tally);

        let finished = queue.status == QueueStatus::Running && tally.all_terminal();
        if finished {
            queue.set_status(if tally.completed > 0 {
                QueueStatus::Completed
            } else {
                QueueStatus::Failed
            });
        }
        self.store.update_queue(&queue).await?;

        let progress = QueueProgress::new(&queue, &tally);
        self.notifier
            .emit(EventKind::QueueProgress, &queue.negotiation_id, &progress);

        if finished {
            self.set_negotiation_status(&queue.negotiation_id, NegotiationStatus::Completed)
                .await?;
            metrics::inc_queue_transition(queue.status.as_str());
            info!("{}", progress.format_status());
            self.notifier
                .emit(EventKind::QueueCompleted, &queue.negotiation_id, &progress);
        }
        Ok(queue)
    }
}

/// Map of async mutexes keyed by record ID.
///
/// Entries are created on first use and evicted when the last guard drops
/// with nobody else waiting.
#[derive(Default)]
struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = Arc::clone(self.locks.entry(key.to_string()).or_default().value());
        let guard = mutex.lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

struct KeyGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // The map's own Arc is the only one left: nobody holds or awaits it.
        self.owner
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Remove duplicates, keeping the first occurrence.
fn dedup(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.trim();
        if !id.is_empty() && !out.iter().any(|seen| seen == id) {
            out.push(id.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::executor::{Script, ScriptedExecutor};
    use crate::simulation::model::{Counterpart, Dimension, NegotiationOutcome, UserRole};
    use crate::store::memory::MemoryStore;
    use crate::store::{StoreError, StoreResult};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CATALOG: &str = r#"
[[techniques]]
id = "A"
name = "Reciprocity"
description = "Give to get."

[[techniques]]
id = "B"
name = "Scarcity"
description = "Limited availability."

[[tactics]]
id = "X"
name = "Anchoring"
description = "Open high."

[[tactics]]
id = "Y"
name = "Flinch"
description = "React visibly."

[[tactics]]
id = "Z"
name = "Silence"
description = "Say nothing."

[[tactics]]
id = "V"
name = "Nibble"
description = "Ask for a little more."

[[tactics]]
id = "W"
name = "Deadline"
description = "Set a time limit."
"#;

    fn scenario() -> Scenario {
        Scenario {
            user_role: UserRole::Buyer,
            negotiation_type: None,
            dimensions: vec![Dimension {
                name: "Price".to_string(),
                min_value: 80.0,
                max_value: 120.0,
                target_value: 95.0,
                priority: 1,
                unit: None,
            }],
            products: vec![],
            technique_ids: vec!["A".to_string(), "B".to_string()],
            tactic_ids: vec!["X".to_string(), "Y".to_string()],
            counterpart: Counterpart::default(),
            max_rounds: None,
            context: Value::Null,
        }
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn setup(
        executor: Arc<ScriptedExecutor>,
        concurrency: usize,
    ) -> (Arc<QueueOrchestrator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let catalog = Catalog::from_toml(CATALOG).expect("catalog parses");
        let config = QueueConfig {
            max_concurrency: concurrency,
            ..QueueConfig::default()
        };
        let orch = QueueOrchestrator::new(
            store.clone(),
            executor,
            Arc::new(catalog),
            Notifier::default(),
            config,
            CostModel::new(0.02),
        );
        (orch, store)
    }

    async fn wait_until<F>(orch: &QueueOrchestrator, queue_id: &str, pred: F) -> QueueProgress
    where
        F: Fn(&QueueProgress) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let progress = orch.queue_status(queue_id).await.expect("queue exists");
            if pred(&progress) {
                return progress;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("condition not reached: {}", progress.format_status());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn negotiation(orch: &QueueOrchestrator) -> Negotiation {
        orch.create_negotiation("Supplier renewal", scenario())
            .await
            .expect("negotiation created")
    }

    #[tokio::test]
    async fn test_create_queue_is_technique_major_cartesian_product() {
        let (orch, store) = setup(Arc::new(ScriptedExecutor::new()), 1);
        let n = negotiation(&orch).await;
        let queue = orch
            .create_queue(&n.id, &ids(&["A", "B"]), &ids(&["X", "Y"]))
            .await
            .expect("queue created");
        assert_eq!(queue.total_simulations, 4);
        assert_eq!(queue.status, QueueStatus::Pending);

        let runs = store.runs_for_queue(&queue.id).await.expect("runs");
        let pairs: Vec<(String, String, u32)> = runs
            .iter()
            .map(|r| (r.technique_id.clone(), r.tactic_id.clone(), r.run_number))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("A".to_string(), "X".to_string(), 1),
                ("A".to_string(), "Y".to_string(), 2),
                ("B".to_string(), "X".to_string(), 3),
                ("B".to_string(), "Y".to_string(), 4),
            ]
        );
        assert!(runs.iter().all(|r| r.status == RunStatus::Pending));
    }

    #[tokio::test]
    async fn test_create_queue_collapses_duplicates() {
        let (orch, _) = setup(Arc::new(ScriptedExecutor::new()), 1);
        let n = negotiation(&orch).await;
        let queue = orch
            .create_queue(&n.id, &ids(&["A", "A", "B"]), &ids(&["X", "X"]))
            .await
            .expect("queue created");
        assert_eq!(queue.total_simulations, 2);
    }

    #[tokio::test]
    async fn test_create_queue_rejects_empty_and_unknown() {
        let (orch, _) = setup(Arc::new(ScriptedExecutor::new()), 1);
        let n = negotiation(&orch).await;
        assert!(matches!(
            orch.create_queue(&n.id, &[], &ids(&["X"])).await,
            Err(SimulationError::Validation(_))
        ));
        assert!(matches!(
            orch.create_queue(&n.id, &ids(&["A"]), &[]).await,
            Err(SimulationError::Validation(_))
        ));
        assert!(matches!(
            orch.create_queue(&n.id, &ids(&["nope"]), &ids(&["X"])).await,
            Err(SimulationError::Validation(_))
        ));
        assert!(matches!(
            orch.create_queue("missing", &ids(&["A"]), &ids(&["X"])).await,
            Err(SimulationError::NegotiationNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_queue_estimates_cost_from_rounds() {
        let (orch, _) = setup(Arc::new(ScriptedExecutor::new()), 1);
        let n = negotiation(&orch).await;
        let queue = orch
            .create_queue(&n.id, &ids(&["A", "B"]), &ids(&["X"]))
            .await
            .expect("queue created");
        // 2 runs × 6 rounds × $0.02
        assert!((queue.estimated_cost - 0.24).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_create_negotiation_validates_input() {
        let (orch, _) = setup(Arc::new(ScriptedExecutor::new()), 1);
        let mut bad = scenario();
        bad.dimensions[0].min_value = 200.0;
        assert!(matches!(
            orch.create_negotiation("  ", bad).await,
            Err(SimulationError::Validation(msg)) if msg.contains("title") && msg.contains("Price")
        ));
    }

    #[tokio::test]
    async fn test_queue_runs_to_completion() {
        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(2)));
        let (orch, store) = setup(exec, 2);
        let n = negotiation(&orch).await;
        let queue = orch.start_negotiation(&n.id).await.expect("started");
        assert_eq!(queue.status, QueueStatus::Running);

        let done = wait_until(&orch, &queue.id, |p| p.status.is_terminal()).await;
        assert_eq!(done.status, QueueStatus::Completed);
        assert_eq!(done.completed_count, 4);
        assert_eq!(done.failed_count, 0);
        assert_eq!(done.percentage, 100.0);
        // 4 runs × 3 rounds × $0.02
        assert!((done.actual_cost - 0.24).abs() < 1e-9);

        let results = orch.queue_results(&queue.id).await.expect("results");
        assert!(results.iter().all(|r| r.run.deal_value == Some(95.0)));
        assert!(results.iter().all(|r| r.run.evaluation.is_some()));
        assert_eq!(results[0].technique.as_ref().map(|t| t.name.as_str()), Some("Reciprocity"));

        let negotiation = store.get_negotiation(&n.id).await.expect("read");
        assert_eq!(
            negotiation.map(|n| n.status),
            Some(NegotiationStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_pool() {
        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(10)));
        let (orch, _) = setup(exec.clone(), 2);
        let n = negotiation(&orch).await;
        let queue = orch
            .create_queue(&n.id, &ids(&["A", "B"]), &ids(&["X", "Y", "Z"]))
            .await
            .expect("queue created");
        orch.start(&queue.id).await.expect("started");
        wait_until(&orch, &queue.id, |p| p.status.is_terminal()).await;
        assert!(exec.max_in_flight() <= 2);
        assert_eq!(exec.executed().len(), 6);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_queue() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .with_delay(Duration::ZERO)
                .with_script("X", Script::Fail("runner crashed".to_string()))
                .with_script("Y", Script::Timeout),
        );
        let (orch, _) = setup(exec, 3);
        let n = negotiation(&orch).await;
        let queue = orch
            .create_queue(&n.id, &ids(&["A"]), &ids(&["X", "Y", "Z"]))
            .await
            .expect("queue created");
        orch.start(&queue.id).await.expect("started");

        let done = wait_until(&orch, &queue.id, |p| p.status.is_terminal()).await;
        assert_eq!(done.status, QueueStatus::Completed);
        assert_eq!(done.completed_count, 1);
        assert_eq!(done.failed_count, 2);

        let results = orch.queue_results(&queue.id).await.expect("results");
        assert_eq!(results[0].run.status, RunStatus::Failed);
        assert!(results[0]
            .run
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("runner crashed")));
        assert_eq!(results[1].run.status, RunStatus::Timeout);
    }

    #[tokio::test]
    async fn test_all_failed_marks_queue_failed() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .with_delay(Duration::ZERO)
                .with_default(Script::Fail("boom".to_string())),
        );
        let (orch, _) = setup(exec, 2);
        let n = negotiation(&orch).await;
        let queue = orch.start_negotiation(&n.id).await.expect("started");
        let done = wait_until(&orch, &queue.id, |p| p.status.is_terminal()).await;
        assert_eq!(done.status, QueueStatus::Failed);
        assert_eq!(done.failed_count, 4);
    }

    #[tokio::test]
    async fn test_stop_lets_running_finish_and_dispatches_no_more() {
        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::ZERO).gated());
        let (orch, _) = setup(exec.clone(), 2);
        let n = negotiation(&orch).await;
        let queue = orch
            .create_queue(&n.id, &ids(&["A"]), &ids(&["V", "W", "X", "Y", "Z"]))
            .await
            .expect("queue created");
        orch.start(&queue.id).await.expect("started");
        wait_until(&orch, &queue.id, |p| p.running_count == 2).await;

        orch.stop(&queue.id).await.expect("stopped");
        exec.release(10);
        let stopped = wait_until(&orch, &queue.id, |p| p.running_count == 0).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let stopped_now = orch.queue_status(&queue.id).await.expect("status");
        assert_eq!(stopped.status, QueueStatus::Stopped);
        assert_eq!(stopped_now.completed_count, 2);
        assert_eq!(stopped_now.pending_count, 3);
        assert_eq!(exec.executed().len(), 2);
        assert_eq!(
            orch.get_negotiation(&n.id).await.expect("negotiation").status,
            NegotiationStatus::Aborted
        );
    }

    #[tokio::test]
    async fn test_pause_resume_does_not_duplicate_dispatch() {
        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::ZERO).gated());
        let (orch, _) = setup(exec.clone(), 1);
        let n = negotiation(&orch).await;
        let queue = orch.start_negotiation(&n.id).await.expect("started");
        wait_until(&orch, &queue.id, |p| p.running_count == 1).await;

        orch.pause(&queue.id).await.expect("paused");
        exec.release(1);
        let paused = wait_until(&orch, &queue.id, |p| p.completed_count == 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(paused.status, QueueStatus::Paused);
        assert_eq!(exec.executed().len(), 1);

        orch.resume(&queue.id).await.expect("resumed");
        exec.release(10);
        let done = wait_until(&orch, &queue.id, |p| p.status.is_terminal()).await;
        assert_eq!(done.completed_count, 4);

        let mut executed = exec.executed();
        let total = executed.len();
        executed.sort();
        executed.dedup();
        assert_eq!(total, 4);
        assert_eq!(executed.len(), 4, "no run may be dispatched twice");
    }

    #[tokio::test]
    async fn test_restart_failed_reruns_and_clears_results() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .with_delay(Duration::ZERO)
                .with_script("Y", Script::Fail("flaky".to_string())),
        );
        let (orch, _) = setup(exec.clone(), 2);
        let n = negotiation(&orch).await;
        let queue = orch.start_negotiation(&n.id).await.expect("started");
        let done = wait_until(&orch, &queue.id, |p| p.status.is_terminal()).await;
        assert_eq!(done.failed_count, 2);

        exec.set_script(
            "Y",
            Script::Outcome {
                outcome: NegotiationOutcome::WalkAway,
                rounds: 2,
            },
        );
        let report = orch.restart_failed(&queue.id).await.expect("restarted");
        assert_eq!(report.restarted.len(), 2);
        assert_eq!(report.status, QueueStatus::Running);

        let done = wait_until(&orch, &queue.id, |p| {
            p.status.is_terminal() && p.completed_count == 4
        })
        .await;
        assert_eq!(done.failed_count, 0);
        let rerun = orch.get_run(&report.restarted[0]).await.expect("run");
        assert_eq!(rerun.attempt, 2);
        assert_eq!(rerun.outcome, Some(NegotiationOutcome::WalkAway));
    }

    #[tokio::test]
    async fn test_restart_failed_on_stopped_queue_conflicts() {
        let (orch, _) = setup(Arc::new(ScriptedExecutor::new()), 1);
        let n = negotiation(&orch).await;
        let queue = orch
            .create_queue(&n.id, &ids(&["A"]), &ids(&["X"]))
            .await
            .expect("queue created");
        orch.stop(&queue.id).await.expect("stopped");
        assert!(matches!(
            orch.restart_failed(&queue.id).await,
            Err(SimulationError::InvalidTransition { .. })
        ));
        assert!(matches!(
            orch.resume(&queue.id).await,
            Err(SimulationError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_single_rules() {
        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::ZERO).gated());
        let (orch, store) = setup(exec.clone(), 1);
        let n = negotiation(&orch).await;
        let queue = orch.start_negotiation(&n.id).await.expect("started");
        wait_until(&orch, &queue.id, |p| p.running_count == 1).await;

        let runs = store.runs_for_queue(&queue.id).await.expect("runs");
        let running = runs.iter().find(|r| r.status == RunStatus::Running).expect("one running");
        let pending = runs.iter().find(|r| r.status == RunStatus::Pending).expect("one pending");

        assert!(matches!(
            orch.restart_single(&running.id).await,
            Err(SimulationError::InvalidTransition { .. })
        ));
        let same = orch.restart_single(&pending.id).await.expect("no-op");
        assert_eq!(same.attempt, 1);
        assert_eq!(same.status, RunStatus::Pending);
        assert!(matches!(
            orch.restart_single("missing").await,
            Err(SimulationError::RunNotFound { .. })
        ));

        exec.release(10);
        wait_until(&orch, &queue.id, |p| p.status == QueueStatus::Completed).await;

        let restarted = orch.restart_single(&running.id).await.expect("restarted");
        assert_eq!(restarted.status, RunStatus::Pending);
        assert_eq!(restarted.attempt, 2);
        assert!(restarted.deal_value.is_none());
        assert!(restarted.conversation_log.is_empty());

        exec.release(1);
        let done = wait_until(&orch, &queue.id, |p| {
            p.status == QueueStatus::Completed && p.completed_count == 4
        })
        .await;
        assert_eq!(done.pending_count, 0);
    }

    #[tokio::test]
    async fn test_transitions_from_wrong_state_conflict() {
        let (orch, _) = setup(Arc::new(ScriptedExecutor::new()), 1);
        let n = negotiation(&orch).await;
        let queue = orch
            .create_queue(&n.id, &ids(&["A"]), &ids(&["X"]))
            .await
            .expect("queue created");
        assert!(matches!(
            orch.pause(&queue.id).await,
            Err(SimulationError::InvalidTransition { .. })
        ));
        assert!(matches!(
            orch.resume(&queue.id).await,
            Err(SimulationError::InvalidTransition { .. })
        ));
        assert!(matches!(
            orch.start("missing").await,
            Err(SimulationError::QueueNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_negotiation_reuses_open_queue() {
        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::ZERO).gated());
        let (orch, _) = setup(exec.clone(), 1);
        let n = negotiation(&orch).await;
        let first = orch.start_negotiation(&n.id).await.expect("started");
        orch.pause(&first.id).await.expect("paused");
        let again = orch.start_negotiation(&n.id).await.expect("resumed");
        assert_eq!(again.id, first.id);
        assert_eq!(again.status, QueueStatus::Running);
        exec.release(10);
        wait_until(&orch, &first.id, |p| p.status.is_terminal()).await;

        let next = orch.start_negotiation(&n.id).await.expect("new queue");
        assert_ne!(next.id, first.id);
        exec.release(10);
        assert_eq!(orch.queues_for_negotiation(&n.id).await.expect("queues").len(), 2);
    }

    #[tokio::test]
    async fn test_recover_requeues_orphans() {
        let store = Arc::new(MemoryStore::new());
        let negotiation = Negotiation::new("Crashed", scenario());
        store.insert_negotiation(&negotiation).await.expect("insert");
        let mut queue = SimulationQueue::new(&negotiation.id, 2, 0.0);
        queue.set_status(QueueStatus::Running);
        let mut orphan = SimulationRun::new(&queue.id, &negotiation.id, "A", "X", 1);
        orphan.begin().expect("begin");
        let pending = SimulationRun::new(&queue.id, &negotiation.id, "A", "Y", 2);
        store
            .insert_queue(&queue, &[orphan.clone(), pending])
            .await
            .expect("insert");

        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::ZERO));
        let orch = QueueOrchestrator::new(
            store.clone(),
            exec.clone(),
            Arc::new(Catalog::from_toml(CATALOG).expect("catalog")),
            Notifier::default(),
            QueueConfig::default(),
            CostModel::default(),
        );
        let report = orch.recover().await.expect("recovered");
        assert_eq!(report.requeued_runs, 1);
        assert_eq!(report.resumed_queues, 1);

        let done = wait_until(&orch, &queue.id, |p| p.status.is_terminal()).await;
        assert_eq!(done.completed_count, 2);
        assert_eq!(orch.get_run(&orphan.id).await.expect("run").attempt, 1);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::ZERO));
        let (orch, _) = setup(exec, 1);
        let mut rx = orch.notifier().subscribe();
        let n = negotiation(&orch).await;
        let queue = orch
            .create_queue(&n.id, &ids(&["A"]), &ids(&["X"]))
            .await
            .expect("queue created");
        orch.start(&queue.id).await.expect("started");
        wait_until(&orch, &queue.id, |p| p.status.is_terminal()).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.negotiation_id, n.id);
            kinds.push(event.kind);
        }
        for expected in [
            EventKind::QueueCreated,
            EventKind::QueueStarted,
            EventKind::SimulationStarted,
            EventKind::SimulationRound,
            EventKind::SimulationCompleted,
            EventKind::QueueCompleted,
        ] {
            assert!(kinds.contains(&expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_max_rounds_override_and_scaling() {
        let (orch, _) = setup(Arc::new(ScriptedExecutor::new()), 1);
        let mut s = scenario();
        assert_eq!(orch.max_rounds_for(&s), 6);
        s.max_rounds = Some(50);
        assert_eq!(orch.max_rounds_for(&s), 20);
        s.max_rounds = None;
        s.dimensions = (0..6).map(|_| s.dimensions[0].clone()).collect();
        assert_eq!(orch.max_rounds_for(&s), 9);
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        assert_eq!(dedup(&ids(&["b", "a", "b", " ", "a"])), ids(&["b", "a"]));
    }

    /// Memory store whose next `failures` terminal run writes fail.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl SimulationStore for FlakyStore {
        async fn insert_negotiation(&self, negotiation: &Negotiation) -> StoreResult<()> {
            self.inner.insert_negotiation(negotiation).await
        }

        async fn get_negotiation(&self, id: &str) -> StoreResult<Option<Negotiation>> {
            self.inner.get_negotiation(id).await
        }

        async fn update_negotiation(&self, negotiation: &Negotiation) -> StoreResult<()> {
            self.inner.update_negotiation(negotiation).await
        }

        async fn insert_queue(
            &self,
            queue: &SimulationQueue,
            runs: &[SimulationRun],
        ) -> StoreResult<()> {
            self.inner.insert_queue(queue, runs).await
        }

        async fn get_queue(&self, id: &str) -> StoreResult<Option<SimulationQueue>> {
            self.inner.get_queue(id).await
        }

        async fn update_queue(&self, queue: &SimulationQueue) -> StoreResult<()> {
            self.inner.update_queue(queue).await
        }

        async fn queues_for_negotiation(
            &self,
            negotiation_id: &str,
        ) -> StoreResult<Vec<SimulationQueue>> {
            self.inner.queues_for_negotiation(negotiation_id).await
        }

        async fn queues_with_status(
            &self,
            status: QueueStatus,
        ) -> StoreResult<Vec<SimulationQueue>> {
            self.inner.queues_with_status(status).await
        }

        async fn get_run(&self, id: &str) -> StoreResult<Option<SimulationRun>> {
            self.inner.get_run(id).await
        }

        async fn runs_for_queue(&self, queue_id: &str) -> StoreResult<Vec<SimulationRun>> {
            self.inner.runs_for_queue(queue_id).await
        }

        async fn runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<SimulationRun>> {
            self.inner.runs_with_status(status).await
        }

        async fn update_run(&self, run: &SimulationRun) -> StoreResult<()> {
            let fail = run.status.is_terminal()
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if fail {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.update_run(run).await
        }
    }

    fn flaky_setup(
        executor: Arc<ScriptedExecutor>,
        failures: usize,
    ) -> (Arc<QueueOrchestrator>, Arc<FlakyStore>) {
        let store = Arc::new(FlakyStore::new(failures));
        let orch = QueueOrchestrator::new(
            store.clone(),
            executor,
            Arc::new(Catalog::from_toml(CATALOG).expect("catalog parses")),
            Notifier::default(),
            QueueConfig::default(),
            CostModel::default(),
        );
        (orch, store)
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, pred: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !pred() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_negotiation_creates_one_queue() {
        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::ZERO).gated());
        let (orch, _) = setup(exec.clone(), 2);
        let mut queue_ids = Vec::new();
        for _ in 0..10 {
            let n = negotiation(&orch).await;
            let spawn_start = || {
                let orch = Arc::clone(&orch);
                let id = n.id.clone();
                tokio::spawn(async move { orch.start_negotiation(&id).await })
            };
            let (a, b) = tokio::join!(spawn_start(), spawn_start());
            let a = a.expect("task").expect("started");
            let b = b.expect("task").expect("started");
            assert_eq!(a.id, b.id);
            assert_eq!(orch.queues_for_negotiation(&n.id).await.expect("queues").len(), 1);
            queue_ids.push(a.id);
        }

        exec.release(100);
        for id in &queue_ids {
            wait_until(&orch, id, |p| p.status == QueueStatus::Completed).await;
        }
        let mut executed = exec.executed();
        assert_eq!(executed.len(), 40);
        executed.sort();
        executed.dedup();
        assert_eq!(executed.len(), 40, "every run executes exactly once");
    }

    #[tokio::test]
    async fn test_unrecorded_result_fails_run_and_finishes_queue() {
        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::ZERO));
        let (orch, store) = flaky_setup(exec.clone(), 1);
        let n = negotiation(&orch).await;
        let queue = orch
            .create_queue(&n.id, &ids(&["A"]), &ids(&["X"]))
            .await
            .expect("queue created");
        orch.start(&queue.id).await.expect("started");

        let done = wait_until(&orch, &queue.id, |p| p.status.is_terminal()).await;
        assert_eq!(done.status, QueueStatus::Failed);
        let run = store.runs_for_queue(&queue.id).await.expect("runs").remove(0);
        assert_eq!(run.status, RunStatus::Failed);
        let message = run.error_message.expect("error recorded");
        assert!(message.contains("result not recorded"), "{message}");
        assert!(message.contains("disk full"), "{message}");
        wait_for("run task to let go", || !orch.dispatcher().holds(&run.id)).await;

        let report = orch.restart_failed(&queue.id).await.expect("restarted");
        assert_eq!(report.restarted, vec![run.id.clone()]);
        wait_until(&orch, &queue.id, |p| p.status == QueueStatus::Completed).await;
        assert_eq!(orch.get_run(&run.id).await.expect("run").attempt, 2);
    }

    #[tokio::test]
    async fn test_restart_single_recovers_run_no_task_holds() {
        // One failed write in finish_run plus every fallback retry.
        let failures = 1 + UNRECORDED_RETRIES as usize;
        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::ZERO));
        let (orch, store) = flaky_setup(exec.clone(), failures);
        let n = negotiation(&orch).await;
        let queue = orch
            .create_queue(&n.id, &ids(&["A"]), &ids(&["X"]))
            .await
            .expect("queue created");
        orch.start(&queue.id).await.expect("started");

        let run_id = store.runs_for_queue(&queue.id).await.expect("runs")[0].id.clone();
        wait_for("run task to let go", || {
            exec.executed().len() == 1 && !orch.dispatcher().holds(&run_id)
        })
        .await;
        let stranded = orch.get_run(&run_id).await.expect("run");
        assert_eq!(stranded.status, RunStatus::Running);
        assert_eq!(orch.queue_status(&queue.id).await.expect("status").status, QueueStatus::Running);

        let reset = orch.restart_single(&run_id).await.expect("restarted");
        assert_eq!(reset.status, RunStatus::Pending);
        assert_eq!(reset.attempt, 2);

        wait_until(&orch, &queue.id, |p| p.status == QueueStatus::Completed).await;
        let run = orch.get_run(&run_id).await.expect("run");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.attempt, 2);
        assert_eq!(exec.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_lock_entries_released_after_queues_finish() {
        let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::ZERO).gated());
        let (orch, _) = setup(exec.clone(), 2);

        let n = negotiation(&orch).await;
        let completed = orch.start_negotiation(&n.id).await.expect("started");
        let other = negotiation(&orch).await;
        let stopped = orch.start_negotiation(&other.id).await.expect("started");
        orch.stop(&stopped.id).await.expect("stopped");

        exec.release(100);
        wait_until(&orch, &completed.id, |p| p.status == QueueStatus::Completed).await;
        wait_for("run tasks to finish", || orch.dispatcher().in_flight() == 0).await;
        wait_for("lock entries to drain", || orch.tracked_locks() == (0, 0)).await;

        // Touching a finished queue does not leave an entry behind.
        assert!(orch.pause(&completed.id).await.is_err());
        assert_eq!(orch.tracked_locks(), (0, 0));
    }
}
