//! Prometheus metrics for simulation queues and runs.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** the dispatcher is
//! spawned. The helper functions (`record_run_finished`, `inc_queue_transition`,
//! …) are no-ops if `init_metrics` was never called, so tests and embedders
//! can run the orchestrator without a registry.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `negotiation_runs_total` | Counter | `status` |
//! | `negotiation_run_duration_seconds` | Histogram | `status` |
//! | `negotiation_runs_in_flight` | Gauge | — |
//! | `negotiation_queue_transitions_total` | Counter | `action` |
//! | `negotiation_executor_errors_total` | Counter | `kind` |
//! | `negotiation_cost_usd_total` | Counter | — |

use crate::OrchestratorError;
use prometheus::{
    core::Collector, Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Buckets for run durations: runner processes take seconds to minutes.
const RUN_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// All Prometheus metrics for the orchestrator, stored in a single
/// [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Finished runs by terminal status.
    pub runs_total: CounterVec,
    /// Wall time of finished runs by terminal status.
    pub run_duration: HistogramVec,
    /// Runs currently holding a dispatch slot.
    pub runs_in_flight: IntGauge,
    /// Queue lifecycle transitions by action.
    pub queue_transitions: CounterVec,
    /// Executor failures by kind.
    pub executor_errors: CounterVec,
    /// Accumulated actual cost of finished runs (USD).
    pub cost_total: Counter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: C) -> Result<C, OrchestratorError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn init_err(e: prometheus::Error) -> OrchestratorError {
    OrchestratorError::Other(format!("metrics init failed: {e}"))
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if metric construction or registry
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let runs_total = register(
        &registry,
        CounterVec::new(
            Opts::new("negotiation_runs_total", "Finished simulation runs"),
            &["status"],
        )
        .map_err(init_err)?,
    )?;

    let run_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "negotiation_run_duration_seconds",
                "Wall time of simulation runs",
            )
            .buckets(RUN_DURATION_BUCKETS.to_vec()),
            &["status"],
        )
        .map_err(init_err)?,
    )?;

    let runs_in_flight = register(
        &registry,
        IntGauge::new("negotiation_runs_in_flight", "Runs holding a dispatch slot")
            .map_err(init_err)?,
    )?;

    let queue_transitions = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "negotiation_queue_transitions_total",
                "Queue lifecycle transitions",
            ),
            &["action"],
        )
        .map_err(init_err)?,
    )?;

    let executor_errors = register(
        &registry,
        CounterVec::new(
            Opts::new("negotiation_executor_errors_total", "Executor failures"),
            &["kind"],
        )
        .map_err(init_err)?,
    )?;

    let cost_total = register(
        &registry,
        Counter::new("negotiation_cost_usd_total", "Actual cost of finished runs")
            .map_err(init_err)?,
    )?;

    // First writer wins; a racing initialiser built identical descriptors.
    let _ = METRICS.set(Metrics {
        registry,
        runs_total,
        run_duration,
        runs_in_flight,
        queue_transitions,
        executor_errors,
        cost_total,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Record a run reaching a terminal status.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn record_run_finished(status: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.runs_total.get_metric_with_label_values(&[status]) {
            c.inc();
        }
        if let Ok(h) = m.run_duration.get_metric_with_label_values(&[status]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Set the number of runs currently holding a slot.
///
/// No-op if metrics have not been initialised.
pub fn set_runs_in_flight(n: i64) {
    if let Some(m) = metrics() {
        m.runs_in_flight.set(n);
    }
}

/// Count a queue transition (`created`, `started`, `paused`, ...).
///
/// No-op if metrics have not been initialised.
pub fn inc_queue_transition(action: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.queue_transitions.get_metric_with_label_values(&[action]) {
            c.inc();
        }
    }
}

/// Count an executor failure by kind (`spawn`, `timeout`, `exit`, ...).
///
/// No-op if metrics have not been initialised.
pub fn inc_executor_error(kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.executor_errors.get_metric_with_label_values(&[kind]) {
            c.inc();
        }
    }
}

/// Add the actual cost of a finished run.
///
/// Negative and non-finite values are ignored.
pub fn add_cost(usd: f64) {
    if let Some(m) = metrics() {
        if usd.is_finite() && usd > 0.0 {
            m.cost_total.inc_by(usd);
        }
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// A structured snapshot of key counters, used by the health endpoint.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Finished runs keyed by status label.
    pub runs_total: HashMap<String, u64>,
    /// Runs currently in flight.
    pub runs_in_flight: i64,
}

/// Return a structured summary of current metric values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };

    let mut summary = MetricsSummary {
        runs_in_flight: m.runs_in_flight.get(),
        ..Default::default()
    };

    for family in m.runs_total.collect() {
        for metric in family.get_metric() {
            let status = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == "status")
                .map_or("unknown", |l| l.get_value());
            let value = metric.get_counter().get_value() as u64;
            summary.runs_total.insert(status.to_string(), value);
        }
    }

    summary
}
