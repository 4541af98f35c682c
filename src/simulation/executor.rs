//! # Executor — bridge to the negotiation runner
//!
//! ## Responsibility
//! Run one simulation job and return the runner's structured report.
//! [`ProcessExecutor`] spawns the external runner script per run;
//! [`ScriptedExecutor`] produces deterministic negotiations in-process for
//! tests and demos.
//!
//! ## Runner protocol
//!
//! ```text
//! <python> <script> --negotiation-id <id> --simulation-run-id <id>
//!                   --technique-id <id> --tactic-id <id>
//!                   --max-rounds <n> --negotiation-data <json>
//!
//! stdout:  ROUND_UPDATE:{"round":1,"agent":"BUYER","message":..,"offer":..,"action":..}
//!          ...
//!          {"outcome":"DEAL_ACCEPTED","totalRounds":4,"finalOffer":..,
//!           "conversationLog":[..],"langfuseTraceId":..}      <- last line
//! ```
//!
//! ## Guarantees
//! - Timeout-safe: processes are killed after the configured timeout
//! - Streaming: round updates are forwarded while the process runs
//! - Diagnosable: failures carry the runner's error or the stderr tail
//!
//! ## NOT Responsible For
//! - Status transitions and persistence (see: queue.rs)
//! - Deal value and dimension analysis (see: outcome.rs)

use super::catalog::{Tactic, Technique};
use super::model::{ConversationTurn, Evaluation, NegotiationOutcome, Scenario};
use crate::config::{EvaluationConfig, ExecutorConfig};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

/// Prefix of streamed round lines on the runner's stdout.
pub const ROUND_UPDATE_PREFIX: &str = "ROUND_UPDATE:";

/// Characters of stderr kept for diagnostics.
const STDERR_TAIL_CHARS: usize = 2000;

/// A round streamed by the runner. Same shape as a conversation turn.
pub type RoundUpdate = ConversationTurn;

/// Errors produced while running a job.
///
/// Every variant ends the run in `failed`, except [`ExecutorError::Timeout`]
/// which ends it in `timeout`.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The process could not be started.
    #[error("failed to spawn runner: {0}")]
    Spawn(String),

    /// The process exceeded its time budget and was killed.
    #[error("run {run_id} timed out after {timeout_secs}s")]
    Timeout {
        /// Run that timed out.
        run_id: String,
        /// Configured budget.
        timeout_secs: u64,
    },

    /// The process exited with a non-zero code.
    #[error("runner exited with code {code:?}: {diagnostic}")]
    NonZeroExit {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Runner error or stderr tail.
        diagnostic: String,
    },

    /// The final stdout line was missing or not a valid report.
    #[error("malformed runner output: {0}")]
    MalformedOutput(String),

    /// The runner reported an error outcome.
    #[error("runner reported error: {0}")]
    Reported(String),

    /// Reading the process pipes failed.
    #[error("runner i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Short label used as a metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn",
            Self::Timeout { .. } => "timeout",
            Self::NonZeroExit { .. } => "exit",
            Self::MalformedOutput(_) => "malformed",
            Self::Reported(_) => "reported",
            Self::Io(_) => "io",
        }
    }

    /// Returns `true` if the run should end in `timeout` rather than `failed`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Everything a runner needs to play one technique × tactic pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct RunJob {
    /// Run being executed.
    pub run_id: String,
    /// Owning queue.
    pub queue_id: String,
    /// Owning negotiation.
    pub negotiation_id: String,
    /// Negotiation title, passed through to the runner.
    pub title: String,
    /// Position in the queue.
    pub run_number: u32,
    /// Attempt number of this execution.
    pub attempt: u32,
    /// Negotiation scenario.
    pub scenario: Scenario,
    /// Influencing technique.
    pub technique: Technique,
    /// Negotiation tactic.
    pub tactic: Tactic,
    /// Round limit for this run.
    pub max_rounds: u32,
}

impl RunJob {
    /// The `--negotiation-data` JSON document passed to the runner.
    pub fn negotiation_data(&self) -> Value {
        let s = &self.scenario;
        json!({
            "negotiation": { "id": self.negotiation_id, "title": self.title },
            "userRole": s.user_role,
            "negotiationType": s.negotiation_type,
            "context": s.context,
            "technique": self.technique,
            "tactic": self.tactic,
            "dimensions": s.dimensions,
            "products": s.products,
            "counterpart": s.counterpart,
        })
    }
}

/// Final report printed by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// How the negotiation ended.
    pub outcome: NegotiationOutcome,
    /// Rounds played.
    #[serde(default)]
    pub total_rounds: u32,
    /// Last offer on the table.
    #[serde(default)]
    pub final_offer: Option<Value>,
    /// Ordered turns.
    #[serde(default)]
    pub conversation_log: Vec<ConversationTurn>,
    /// Trace ID of the runner's LLM calls.
    #[serde(default)]
    pub langfuse_trace_id: Option<String>,
    /// Cost the runner measured, in USD.
    #[serde(default)]
    pub actual_cost: Option<f64>,
    /// Runner-side error message.
    #[serde(default)]
    pub error: Option<String>,
}

impl RunReport {
    /// Reject reports that carry an error or an `ERROR` outcome.
    ///
    /// # Errors
    ///
    /// [`ExecutorError::Reported`] with the runner's message.
    pub fn into_success(self) -> Result<Self, ExecutorError> {
        if let Some(err) = self.error.as_deref().filter(|e| !e.trim().is_empty()) {
            return Err(ExecutorError::Reported(err.to_string()));
        }
        if self.outcome == NegotiationOutcome::Error {
            return Err(ExecutorError::Reported(
                "runner returned outcome ERROR".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Runs simulation jobs.
///
/// Implementations must be thread-safe (Send + Sync); the trait is
/// object-safe to allow dynamic dispatch via `Arc<dyn RunExecutor>`.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Play one job to completion.
    ///
    /// Round updates are sent on `rounds` as they happen; the receiver may
    /// be dropped, in which case updates are discarded.
    async fn execute(
        &self,
        job: &RunJob,
        rounds: mpsc::UnboundedSender<RoundUpdate>,
    ) -> Result<RunReport, ExecutorError>;

    /// Produce a qualitative evaluation of a finished run.
    ///
    /// `Ok(None)` means the run is not evaluated.
    async fn evaluate(
        &self,
        _job: &RunJob,
        _report: &RunReport,
    ) -> Result<Option<Evaluation>, ExecutorError> {
        Ok(None)
    }

    /// Executor name for logs.
    fn name(&self) -> &str;
}

// ============================================================================
// Process executor
// ============================================================================

/// Spawns the runner script once per job.
///
/// # Usage
///
/// ```rust,no_run
/// use negotiation_orchestrator::config::{EvaluationConfig, ExecutorConfig};
/// use negotiation_orchestrator::ProcessExecutor;
/// use std::time::Duration;
///
/// let executor = ProcessExecutor::new(
///     ExecutorConfig::default(),
///     EvaluationConfig::default(),
///     Duration::from_secs(300),
/// );
/// ```
///
/// # Panics
///
/// No methods on this type panic.
pub struct ProcessExecutor {
    config: ExecutorConfig,
    evaluation: EvaluationConfig,
    timeout: Duration,
}

impl ProcessExecutor {
    /// Create an executor with the given runner and evaluation settings.
    pub fn new(config: ExecutorConfig, evaluation: EvaluationConfig, timeout: Duration) -> Self {
        Self {
            config,
            evaluation,
            timeout,
        }
    }

    fn command(&self, script: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.config.python_bin);
        cmd.arg(script)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl RunExecutor for ProcessExecutor {
    async fn execute(
        &self,
        job: &RunJob,
        rounds: mpsc::UnboundedSender<RoundUpdate>,
    ) -> Result<RunReport, ExecutorError> {
        let mut cmd = self.command(&self.config.script_path);
        cmd.arg("--negotiation-id")
            .arg(&job.negotiation_id)
            .arg("--simulation-run-id")
            .arg(&job.run_id)
            .arg("--technique-id")
            .arg(&job.technique.id)
            .arg("--tactic-id")
            .arg(&job.tactic.id)
            .arg("--max-rounds")
            .arg(job.max_rounds.to_string())
            .arg("--negotiation-data")
            .arg(job.negotiation_data().to_string());

        let mut child = cmd.spawn().map_err(|e| {
            ExecutorError::Spawn(format!(
                "{} {}: {e}",
                self.config.python_bin,
                self.config.script_path.display()
            ))
        })?;
        debug!(run_id = %job.run_id, pid = ?child.id(), "runner spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Spawn("runner stdout not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).to_string()
            })
        });

        let mut reader = BufReader::new(stdout);
        let run_id = job.run_id.as_str();
        let waited = tokio::time::timeout(self.timeout, async {
            let mut last_line: Option<String> = None;
            let mut raw = Vec::new();
            loop {
                raw.clear();
                if reader.read_until(b'\n', &mut raw).await? == 0 {
                    break;
                }
                // Runner logs may carry stray non-UTF-8 bytes.
                let text = String::from_utf8_lossy(&raw);
                let line = text.trim();
                if let Some(payload) = line.strip_prefix(ROUND_UPDATE_PREFIX) {
                    match serde_json::from_str::<RoundUpdate>(payload) {
                        Ok(update) => {
                            let _ = rounds.send(update);
                        }
                        Err(e) => warn!(run_id, error = %e, "unparseable round update"),
                    }
                } else if !line.is_empty() {
                    last_line = Some(line.to_string());
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, last_line))
        })
        .await;

        let (status, last_line) = match waited {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(ExecutorError::Io(e));
            }
            Err(_) => {
                let _ = child.kill().await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(ExecutorError::Timeout {
                    run_id: job.run_id.clone(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let parsed = last_line
            .as_deref()
            .map(|l| serde_json::from_str::<RunReport>(l));

        if !status.success() {
            let reported = parsed
                .and_then(|r| r.ok())
                .and_then(|r| r.error)
                .filter(|e| !e.trim().is_empty());
            return Err(ExecutorError::NonZeroExit {
                code: status.code(),
                diagnostic: reported.unwrap_or_else(|| tail(&stderr, STDERR_TAIL_CHARS)),
            });
        }

        match parsed {
            Some(Ok(report)) => report.into_success(),
            Some(Err(e)) => Err(ExecutorError::MalformedOutput(format!(
                "{e}; stderr: {}",
                tail(&stderr, STDERR_TAIL_CHARS)
            ))),
            None => Err(ExecutorError::MalformedOutput(format!(
                "runner printed no result; stderr: {}",
                tail(&stderr, STDERR_TAIL_CHARS)
            ))),
        }
    }

    async fn evaluate(
        &self,
        job: &RunJob,
        report: &RunReport,
    ) -> Result<Option<Evaluation>, ExecutorError> {
        if !self.evaluation.enabled || !report.outcome.is_evaluable() {
            return Ok(None);
        }

        let outcome = serde_json::to_value(report.outcome)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let log = serde_json::to_string(&report.conversation_log)
            .map_err(|e| ExecutorError::MalformedOutput(e.to_string()))?;

        let mut cmd = self.command(&self.evaluation.script_path);
        cmd.arg("--simulation-run-id")
            .arg(&job.run_id)
            .arg("--conversation-log")
            .arg(log)
            .arg("--role")
            .arg(job.scenario.user_role.to_string())
            .arg("--technique-name")
            .arg(&job.technique.name)
            .arg("--technique-description")
            .arg(&job.technique.description)
            .arg("--tactic-name")
            .arg(&job.tactic.name)
            .arg("--tactic-description")
            .arg(&job.tactic.description)
            .arg("--counterpart-attitude")
            .arg(&job.scenario.counterpart.attitude)
            .arg("--outcome")
            .arg(outcome);

        let budget = Duration::from_secs(self.evaluation.timeout_secs);
        let output = match tokio::time::timeout(budget, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ExecutorError::Spawn(e.to_string())),
            Err(_) => {
                return Err(ExecutorError::Timeout {
                    run_id: job.run_id.clone(),
                    timeout_secs: self.evaluation.timeout_secs,
                })
            }
        };

        if !output.status.success() {
            return Err(ExecutorError::NonZeroExit {
                code: output.status.code(),
                diagnostic: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_CHARS),
            });
        }

        parse_evaluation(&String::from_utf8_lossy(&output.stdout)).map(Some)
    }

    fn name(&self) -> &str {
        "process"
    }
}

#[derive(Deserialize)]
struct EvaluationOutput {
    evaluation: Evaluation,
}

/// Parse the evaluation script's stdout (a single, possibly pretty-printed,
/// JSON document).
///
/// # Errors
///
/// [`ExecutorError::MalformedOutput`] if the document has no `evaluation`.
pub fn parse_evaluation(stdout: &str) -> Result<Evaluation, ExecutorError> {
    let start = stdout.find('{').unwrap_or(0);
    serde_json::from_str::<EvaluationOutput>(stdout[start..].trim())
        .map(|o| o.evaluation)
        .map_err(|e| ExecutorError::MalformedOutput(format!("evaluation output: {e}")))
}

/// Keep the last `max` characters of `s`.
fn tail(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    let count = trimmed.chars().count();
    if count <= max {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max).collect()
}

// ============================================================================
// Scripted executor (testing / demo)
// ============================================================================

/// Behaviour of a scripted run.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    /// Play `rounds` rounds and end with `outcome`.
    Outcome {
        /// Outcome label.
        outcome: NegotiationOutcome,
        /// Rounds to play (capped by the job's `max_rounds`).
        rounds: u32,
    },
    /// Fail with a runner error.
    Fail(String),
    /// Behave as if the runner exceeded its timeout.
    Timeout,
}

impl Default for Script {
    fn default() -> Self {
        Self::Outcome {
            outcome: NegotiationOutcome::DealAccepted,
            rounds: 3,
        }
    }
}

/// Deterministic in-process executor.
///
/// Every job plays its [`Script`], chosen by tactic ID, then technique ID,
/// then the default. The final offer puts every dimension on its target
/// and every product on its target price.
///
/// A gated executor holds each job until [`ScriptedExecutor::release`]
/// hands out a permit, which lets tests observe runs in flight.
///
/// # Panics
///
/// No methods on this type panic.
pub struct ScriptedExecutor {
    default: Script,
    scripts: DashMap<String, Script>,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    /// Deal accepted after three rounds, 10 ms per job.
    pub fn new() -> Self {
        Self {
            default: Script::default(),
            scripts: DashMap::new(),
            delay: Duration::from_millis(10),
            gate: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Set the simulated run time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the script used when no override matches.
    pub fn with_default(mut self, script: Script) -> Self {
        self.default = script;
        self
    }

    /// Use `script` for jobs whose tactic or technique ID is `id`.
    pub fn with_script(self, id: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(id.into(), script);
        self
    }

    /// Hold every job until released.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `n` held jobs finish. No-op unless gated.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Replace the script for `id` at runtime.
    pub fn set_script(&self, id: impl Into<String>, script: Script) {
        self.scripts.insert(id.into(), script);
    }

    /// Run IDs in the order their execution started.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of jobs seen executing at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn script_for(&self, job: &RunJob) -> Script {
        self.scripts
            .get(&job.tactic.id)
            .or_else(|| self.scripts.get(&job.technique.id))
            .map(|s| s.value().clone())
            .unwrap_or_else(|| self.default.clone())
    }

    async fn play(
        &self,
        job: &RunJob,
        rounds_tx: &mpsc::UnboundedSender<RoundUpdate>,
    ) -> Result<RunReport, ExecutorError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| ExecutorError::Spawn(format!("gate closed: {e}")))?;
            permit.forget();
        }
        tokio::time::sleep(self.delay).await;

        let (outcome, rounds) = match self.script_for(job) {
            Script::Outcome { outcome, rounds } => (outcome, rounds.min(job.max_rounds)),
            Script::Fail(msg) => return Err(ExecutorError::Reported(msg)),
            Script::Timeout => {
                return Err(ExecutorError::Timeout {
                    run_id: job.run_id.clone(),
                    timeout_secs: 0,
                })
            }
        };

        let offer = target_offer(&job.scenario);
        let user = job.scenario.user_role;
        let mut log = Vec::with_capacity(rounds as usize);
        for round in 1..=rounds {
            let agent = if round % 2 == 1 { user } else { user.opposite() };
            let last = round == rounds;
            let action = match (last, outcome) {
                (true, NegotiationOutcome::DealAccepted) => "accept",
                (true, NegotiationOutcome::WalkAway) => "walk_away",
                (true, NegotiationOutcome::Terminated) => "terminate",
                (true, NegotiationOutcome::Paused) => "pause",
                _ => "continue",
            };
            let turn = ConversationTurn {
                round,
                agent: agent.to_string(),
                message: format!(
                    "{} applies {} via {} (round {round})",
                    agent, job.technique.name, job.tactic.name
                ),
                offer: offer.clone(),
                action: action.to_string(),
                internal_analysis: None,
                batna_assessment: None,
                walk_away_threshold: None,
            };
            let _ = rounds_tx.send(turn.clone());
            log.push(turn);
        }

        Ok(RunReport {
            outcome,
            total_rounds: rounds,
            final_offer: Some(offer),
            conversation_log: log,
            langfuse_trace_id: Some(format!("scripted-{}", job.run_id)),
            actual_cost: None,
            error: None,
        })
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn target_offer(scenario: &Scenario) -> Value {
    let mut values = serde_json::Map::new();
    for dim in &scenario.dimensions {
        values.insert(dim.name.clone(), json!(dim.target_value));
    }
    for product in &scenario.products {
        values.insert(product.name.clone(), json!(product.target_price));
    }
    json!({ "dimension_values": values, "confidence": 0.8 })
}

#[async_trait]
impl RunExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        job: &RunJob,
        rounds: mpsc::UnboundedSender<RoundUpdate>,
    ) -> Result<RunReport, ExecutorError> {
        self.executed.lock().push(job.run_id.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.play(job, &rounds).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn evaluate(
        &self,
        job: &RunJob,
        report: &RunReport,
    ) -> Result<Option<Evaluation>, ExecutorError> {
        if !report.outcome.is_evaluable() {
            return Ok(None);
        }
        Ok(Some(Evaluation {
            tactical_summary: format!(
                "{} combined with {} over {} rounds",
                job.technique.name, job.tactic.name, report.total_rounds
            ),
            influencing_effectiveness_score: 7,
            tactic_effectiveness_score: 6,
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
