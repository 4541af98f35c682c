//! # Model — negotiations, queues, runs
//!
//! ## Responsibility
//! Define the persisted records of the orchestrator and the legal status
//! transitions between them. Every mutation of a run's status goes through
//! a method here so the transition rules live in one place.
//!
//! ## Guarantees
//! - Runs progress `Pending` → `Running` → `Completed` | `Failed` | `Timeout`
//! - A terminal run only leaves its terminal status through [`SimulationRun::reset`]
//! - `reset` clears every outcome field
//! - Queue aggregates are derived from a [`RunTally`], never incremented
//!
//! ## NOT Responsible For
//! - Locking and dispatch (see: queue.rs, dispatcher.rs)
//! - Outcome maths (see: outcome.rs)

use super::outcome::{DimensionResult, ProductResult};
use super::SimulationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Negotiation ─────────────────────────────────────────────────────────────

/// Which side of the table the user plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    /// The user buys; lower values are better.
    Buyer,
    /// The user sells; higher values are better.
    Seller,
}

impl UserRole {
    /// The role played by the counterpart agent.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buyer => Self::Seller,
            Self::Seller => Self::Buyer,
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buyer => write!(f, "BUYER"),
            Self::Seller => write!(f, "SELLER"),
        }
    }
}

/// A negotiated dimension with its acceptable range and target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimension {
    /// Dimension name as it appears in offers (e.g. `"Price"`).
    pub name: String,
    /// Lowest acceptable value.
    pub min_value: f64,
    /// Highest acceptable value.
    pub max_value: f64,
    /// Value the user aims for.
    pub target_value: f64,
    /// 1 = must have, 3 = nice to have.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Unit label (e.g. `"EUR"`, `"days"`).
    #[serde(default)]
    pub unit: Option<String>,
}

/// A product whose unit price is negotiated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    /// Product name as it appears in offers.
    pub name: String,
    /// Unit price the user aims for.
    pub target_price: f64,
    /// Walk-away unit price (max for a buyer, min for a seller).
    #[serde(default)]
    pub min_max_price: Option<f64>,
    /// Expected order volume.
    pub estimated_volume: f64,
}

/// Description of the simulated counterpart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counterpart {
    /// Free-text description passed to the runner.
    #[serde(default)]
    pub description: String,
    /// Attitude label (e.g. `"cooperative"`, `"aggressive"`).
    #[serde(default)]
    pub attitude: String,
    /// Distance parameters per dimension (0.0 = aligned, 1.0 = far apart).
    #[serde(default)]
    pub distance: BTreeMap<String, f64>,
}

/// Everything a run needs to know about the negotiation it simulates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    /// Role played by the user.
    pub user_role: UserRole,
    /// Free-form negotiation type (e.g. `"one-shot"`).
    #[serde(default)]
    pub negotiation_type: Option<String>,
    /// Negotiated dimensions.
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    /// Negotiated products.
    #[serde(default)]
    pub products: Vec<Product>,
    /// Selected influencing technique IDs.
    #[serde(default)]
    pub technique_ids: Vec<String>,
    /// Selected negotiation tactic IDs.
    #[serde(default)]
    pub tactic_ids: Vec<String>,
    /// Counterpart profile.
    #[serde(default)]
    pub counterpart: Counterpart,
    /// Per-negotiation override of the round limit.
    #[serde(default)]
    pub max_rounds: Option<u32>,
    /// Market conditions, baseline values and other context for the runner.
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Lifecycle of a negotiation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    /// Configured, never started.
    Planned,
    /// A queue is dispatching runs.
    Running,
    /// The latest queue finished.
    Completed,
    /// The latest queue was stopped.
    Aborted,
}

impl fmt::Display for NegotiationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planned => write!(f, "planned"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// A configured negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Negotiation {
    /// Unique ID.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Scenario passed to every run.
    pub scenario: Scenario,
    /// Lifecycle status.
    pub status: NegotiationStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Negotiation {
    /// Create a planned negotiation with a fresh ID.
    pub fn new(title: impl Into<String>, scenario: Scenario) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            title: title.into(),
            scenario,
            status: NegotiationStatus::Planned,
            created_at: now,
            updated_at: now,
        }
    }

    /// Change status and bump `updated_at`.
    pub fn set_status(&mut self, status: NegotiationStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

fn default_priority() -> u8 {
    2
}

// ── Queue ───────────────────────────────────────────────────────────────────

/// Status of a simulation queue.
///
/// `Pending` → `Running` ⇄ `Paused`; `Running` → `Completed` | `Failed` once
/// every run is terminal; any non-terminal status → `Stopped` on request.
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Created, not yet started.
    Pending,
    /// Dispatching runs.
    Running,
    /// Not dispatching; in-flight runs continue.
    Paused,
    /// All runs terminal, at least one completed.
    Completed,
    /// All runs terminal, none completed.
    Failed,
    /// Halted by the user.
    Stopped,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl QueueStatus {
    /// Returns `true` if the queue will never dispatch again on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Returns `true` if pending runs of this queue may be dispatched.
    pub fn accepts_dispatch(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Stable text form used by the SQLite store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Parse the text form produced by [`QueueStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// The batch of runs created for one negotiation start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationQueue {
    /// Unique ID.
    pub id: String,
    /// Owning negotiation.
    pub negotiation_id: String,
    /// Queue status.
    pub status: QueueStatus,
    /// Number of runs (|techniques| × |tactics|).
    pub total_simulations: u32,
    /// Runs in `Completed`.
    pub completed_count: u32,
    /// Runs in `Failed` or `Timeout`.
    pub failed_count: u32,
    /// Cost estimate made at creation (USD).
    pub estimated_cost: f64,
    /// Sum of the actual cost of its runs (USD).
    pub actual_cost: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl SimulationQueue {
    /// Create a pending queue.
    pub fn new(negotiation_id: impl Into<String>, total: u32, estimated_cost: f64) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            negotiation_id: negotiation_id.into(),
            status: QueueStatus::Pending,
            total_simulations: total,
            completed_count: 0,
            failed_count: 0,
            estimated_cost,
            actual_cost: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the aggregate fields from a tally of the queue's runs.
    pub fn apply_tally(&mut self, tally: &RunTally) {
        self.completed_count = tally.completed;
        self.failed_count = tally.failed + tally.timeout;
        self.actual_cost = tally.actual_cost;
        self.updated_at = Utc::now();
    }

    /// Change status and bump `updated_at`.
    pub fn set_status(&mut self, status: QueueStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Counts of runs per status, plus their summed cost.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTally {
    /// Runs waiting for a slot.
    pub pending: u32,
    /// Runs in flight.
    pub running: u32,
    /// Runs that finished with a parsed outcome.
    pub completed: u32,
    /// Runs that failed.
    pub failed: u32,
    /// Runs that exceeded the timeout.
    pub timeout: u32,
    /// Sum of `actual_cost` over all runs.
    pub actual_cost: f64,
}

impl RunTally {
    /// Tally a slice of runs.
    pub fn from_runs(runs: &[SimulationRun]) -> Self {
        let mut tally = Self::default();
        for run in runs {
            match run.status {
                RunStatus::Pending => tally.pending += 1,
                RunStatus::Running => tally.running += 1,
                RunStatus::Completed => tally.completed += 1,
                RunStatus::Failed => tally.failed += 1,
                RunStatus::Timeout => tally.timeout += 1,
            }
            tally.actual_cost += run.actual_cost.unwrap_or(0.0);
        }
        tally
    }

    /// Total number of runs tallied.
    pub fn total(&self) -> u32 {
        self.pending + self.running + self.completed + self.failed + self.timeout
    }

    /// Number of runs in a terminal status.
    pub fn terminal(&self) -> u32 {
        self.completed + self.failed + self.timeout
    }

    /// Returns `true` once every run is terminal.
    pub fn all_terminal(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

/// Snapshot returned by the queue status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProgress {
    /// Queue ID.
    pub queue_id: String,
    /// Owning negotiation.
    pub negotiation_id: String,
    /// Queue status.
    pub status: QueueStatus,
    /// Number of runs.
    pub total_simulations: u32,
    /// Completed runs.
    pub completed_count: u32,
    /// Failed or timed-out runs.
    pub failed_count: u32,
    /// Runs in flight.
    pub running_count: u32,
    /// Runs waiting for a slot.
    pub pending_count: u32,
    /// Terminal runs as a percentage of the total (0–100).
    pub percentage: f64,
    /// Estimated cost (USD).
    pub estimated_cost: f64,
    /// Actual cost so far (USD).
    pub actual_cost: f64,
}

impl QueueProgress {
    /// Build a progress snapshot from a queue and a fresh tally of its runs.
    pub fn new(queue: &SimulationQueue, tally: &RunTally) -> Self {
        let percentage = if queue.total_simulations == 0 {
            0.0
        } else {
            let done = f64::from(queue.completed_count + queue.failed_count);
            (done / f64::from(queue.total_simulations) * 1000.0).round() / 10.0
        };
        Self {
            queue_id: queue.id.clone(),
            negotiation_id: queue.negotiation_id.clone(),
            status: queue.status,
            total_simulations: queue.total_simulations,
            completed_count: queue.completed_count,
            failed_count: queue.failed_count,
            running_count: tally.running,
            pending_count: tally.pending,
            percentage,
            estimated_cost: queue.estimated_cost,
            actual_cost: queue.actual_cost,
        }
    }

    /// Human-readable one-line summary for logs.
    pub fn format_status(&self) -> String {
        format!(
            "Queue {} [{}]: {}/{} done ({} completed, {} failed), {} running, {} pending | ${:.2} of ${:.2} est.",
            self.queue_id,
            self.status,
            self.completed_count + self.failed_count,
            self.total_simulations,
            self.completed_count,
            self.failed_count,
            self.running_count,
            self.pending_count,
            self.actual_cost,
            self.estimated_cost,
        )
    }
}

// ── Run ─────────────────────────────────────────────────────────────────────

/// Status of a single simulation run.
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for a dispatch slot.
    Pending,
    /// Runner process in flight.
    Running,
    /// Runner returned a parsed outcome.
    Completed,
    /// Runner crashed, exited non-zero or produced malformed output.
    Failed,
    /// Runner exceeded the timeout and was killed.
    Timeout,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RunStatus {
    /// Returns `true` if the run can be claimed by the dispatcher.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns `true` if the run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    /// Returns `true` for the statuses `restart_failed` picks up.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }

    /// Stable text form used by the SQLite store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    /// Parse the text form produced by [`RunStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// How a negotiation ended, as reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationOutcome {
    /// Both sides accepted an offer.
    DealAccepted,
    /// One side ended the negotiation politely.
    Terminated,
    /// One side walked away to its BATNA.
    WalkAway,
    /// Paused with partial progress.
    Paused,
    /// Round limit hit without agreement.
    MaxRoundsReached,
    /// The runner failed internally.
    Error,
    /// Any label this service does not know.
    #[serde(other)]
    Unknown,
}

impl NegotiationOutcome {
    /// Success score in `[0, 1]` used by analytics.
    pub fn success_score(&self) -> f64 {
        match self {
            Self::DealAccepted => 1.0,
            Self::Terminated => 0.6,
            Self::WalkAway => 0.4,
            Self::Paused => 0.5,
            Self::MaxRoundsReached => 0.3,
            Self::Error => 0.0,
            Self::Unknown => 0.2,
        }
    }

    /// Returns `true` for outcomes that get a post-run evaluation.
    pub fn is_evaluable(&self) -> bool {
        matches!(self, Self::DealAccepted | Self::WalkAway)
    }
}

/// One agent turn in a run's conversation log.
///
/// Field names follow the runner's output format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// 1-based round number.
    #[serde(default)]
    pub round: u32,
    /// `BUYER` or `SELLER`.
    #[serde(default)]
    pub agent: String,
    /// Public message sent to the other party.
    #[serde(default)]
    pub message: String,
    /// Offer made this turn (`{dimension_values, confidence, reasoning}`).
    #[serde(default)]
    pub offer: serde_json::Value,
    /// `continue`, `accept`, `terminate`, `walk_away` or `pause`.
    #[serde(default = "default_action")]
    pub action: String,
    /// Private reasoning of the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_analysis: Option<String>,
    /// Agent's view of its alternatives (0–1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batna_assessment: Option<f64>,
    /// Score below which the agent walks away (0–1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walk_away_threshold: Option<f64>,
}

fn default_action() -> String {
    "continue".to_string()
}

/// Post-run qualitative evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Short analysis of how the tactic played out.
    pub tactical_summary: String,
    /// 1–10.
    pub influencing_effectiveness_score: u8,
    /// 1–10.
    pub tactic_effectiveness_score: u8,
}

/// Everything recorded when a run completes successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    /// Outcome label.
    pub outcome: NegotiationOutcome,
    /// Number of rounds played.
    pub total_rounds: u32,
    /// Deal value computed from the final offer.
    pub deal_value: Option<f64>,
    /// Final offer as reported.
    pub final_offer: Option<serde_json::Value>,
    /// Ordered turns.
    pub conversation_log: Vec<ConversationTurn>,
    /// Per-dimension results.
    pub dimension_results: Vec<DimensionResult>,
    /// Per-product results.
    pub product_results: Vec<ProductResult>,
    /// Cost of the run (USD).
    pub actual_cost: f64,
    /// Trace ID reported by the runner.
    pub trace_id: Option<String>,
}

/// One technique × tactic pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRun {
    /// Unique ID.
    pub id: String,
    /// Owning queue.
    pub queue_id: String,
    /// Owning negotiation.
    pub negotiation_id: String,
    /// Influencing technique.
    pub technique_id: String,
    /// Negotiation tactic.
    pub tactic_id: String,
    /// 1-based position in the queue; dispatch order.
    pub run_number: u32,
    /// Run status.
    pub status: RunStatus,
    /// 1 on creation, incremented by every restart.
    pub attempt: u32,
    /// Outcome label once completed.
    pub outcome: Option<NegotiationOutcome>,
    /// Rounds played once completed.
    pub total_rounds: Option<u32>,
    /// Deal value once completed.
    pub deal_value: Option<f64>,
    /// Final offer once completed.
    pub final_offer: Option<serde_json::Value>,
    /// Ordered conversation turns.
    pub conversation_log: Vec<ConversationTurn>,
    /// Per-dimension results.
    pub dimension_results: Vec<DimensionResult>,
    /// Per-product results.
    pub product_results: Vec<ProductResult>,
    /// Post-run evaluation.
    pub evaluation: Option<Evaluation>,
    /// Cost of the run (USD).
    pub actual_cost: Option<f64>,
    /// Diagnostic for failed and timed-out runs.
    pub error_message: Option<String>,
    /// Trace ID reported by the runner.
    pub trace_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the current attempt was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the current attempt ended.
    pub completed_at: Option<DateTime<Utc>>,
}

impl SimulationRun {
    /// Create a pending run.
    pub fn new(
        queue_id: impl Into<String>,
        negotiation_id: impl Into<String>,
        technique_id: impl Into<String>,
        tactic_id: impl Into<String>,
        run_number: u32,
    ) -> Self {
        Self {
            id: crate::new_id(),
            queue_id: queue_id.into(),
            negotiation_id: negotiation_id.into(),
            technique_id: technique_id.into(),
            tactic_id: tactic_id.into(),
            run_number,
            status: RunStatus::Pending,
            attempt: 1,
            outcome: None,
            total_rounds: None,
            deal_value: None,
            final_offer: None,
            conversation_log: Vec::new(),
            dimension_results: Vec::new(),
            product_results: Vec::new(),
            evaluation: None,
            actual_cost: None,
            error_message: None,
            trace_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Pending → Running.
    ///
    /// # Errors
    ///
    /// [`SimulationError::InvalidTransition`] unless the run is pending.
    pub fn begin(&mut self) -> Result<(), SimulationError> {
        if !self.status.is_claimable() {
            return Err(SimulationError::run_transition(&self.id, self.status, "start"));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running → Completed, recording the outcome.
    ///
    /// # Errors
    ///
    /// [`SimulationError::InvalidTransition`] unless the run is running.
    pub fn complete(&mut self, completion: RunCompletion) -> Result<(), SimulationError> {
        if self.status != RunStatus::Running {
            return Err(SimulationError::run_transition(&self.id, self.status, "complete"));
        }
        self.status = RunStatus::Completed;
        self.outcome = Some(completion.outcome);
        self.total_rounds = Some(completion.total_rounds);
        self.deal_value = completion.deal_value;
        self.final_offer = completion.final_offer;
        self.conversation_log = completion.conversation_log;
        self.dimension_results = completion.dimension_results;
        self.product_results = completion.product_results;
        self.actual_cost = Some(completion.actual_cost);
        self.trace_id = completion.trace_id;
        self.error_message = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Running → Failed | Timeout, recording the diagnostic.
    ///
    /// # Errors
    ///
    /// [`SimulationError::InvalidTransition`] unless the run is running, or
    /// if `status` is not a failure status.
    pub fn fail(&mut self, status: RunStatus, message: impl Into<String>) -> Result<(), SimulationError> {
        if self.status != RunStatus::Running || !status.is_failure() {
            return Err(SimulationError::run_transition(&self.id, self.status, "fail"));
        }
        self.status = status;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Terminal → Pending, clearing every outcome field.
    ///
    /// # Errors
    ///
    /// [`SimulationError::InvalidTransition`] unless the run is terminal.
    pub fn reset(&mut self) -> Result<(), SimulationError> {
        if !self.status.is_terminal() {
            return Err(SimulationError::run_transition(&self.id, self.status, "restart"));
        }
        self.status = RunStatus::Pending;
        self.attempt += 1;
        self.outcome = None;
        self.total_rounds = None;
        self.deal_value = None;
        self.final_offer = None;
        self.conversation_log.clear();
        self.dimension_results.clear();
        self.product_results.clear();
        self.evaluation = None;
        self.actual_cost = None;
        self.error_message = None;
        self.trace_id = None;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }

    /// Running → Pending without counting an attempt.
    ///
    /// Used at startup for runs whose process died with the previous
    /// service instance.
    pub fn requeue_orphan(&mut self) {
        if self.status == RunStatus::Running {
            self.status = RunStatus::Pending;
            self.started_at = None;
        }
    }
}
