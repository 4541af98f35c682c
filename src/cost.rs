//! Simulation cost estimation and tracking.
//!
//! Estimates what a queue will cost before it runs, prices finished runs,
//! and keeps a service-wide running total.
//!
//! Costs are stored as micro-dollars (1 USD = 1 000 000 micro-dollars) to
//! avoid floating-point drift when summing many runs. Values cross the API
//! boundary as `f64` USD.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pricing rule for simulation runs.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostModel {
    /// Cost of one negotiation round, in micro-dollars.
    per_round_micro: u64,
}

impl CostModel {
    /// Create a model charging `cost_per_round` USD per round.
    ///
    /// Negative or non-finite rates are treated as zero.
    pub fn new(cost_per_round: f64) -> Self {
        Self {
            per_round_micro: usd_to_micro(cost_per_round),
        }
    }

    /// Rate per round in USD.
    pub fn cost_per_round(&self) -> f64 {
        micro_to_usd(self.per_round_micro)
    }

    /// Estimated cost of one run that plays `max_rounds` rounds.
    pub fn estimate_run(&self, max_rounds: u32) -> f64 {
        micro_to_usd(self.per_round_micro.saturating_mul(u64::from(max_rounds)))
    }

    /// Estimated cost of a queue of `runs` runs.
    pub fn estimate_queue(&self, runs: u32, max_rounds: u32) -> f64 {
        let per_run = self.per_round_micro.saturating_mul(u64::from(max_rounds));
        micro_to_usd(per_run.saturating_mul(u64::from(runs)))
    }

    /// Actual cost of a finished run.
    ///
    /// Prefers the cost reported by the runner; falls back to
    /// `cost_per_round × total_rounds`.
    pub fn actual_run(&self, reported: Option<f64>, total_rounds: u32) -> f64 {
        match reported {
            Some(usd) if usd.is_finite() && usd >= 0.0 => micro_to_usd(usd_to_micro(usd)),
            _ => micro_to_usd(self.per_round_micro.saturating_mul(u64::from(total_rounds))),
        }
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self::new(crate::config::default_cost_per_round())
    }
}

/// Service-wide cost totals.
///
/// All operations are lock-free via atomics.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Default)]
pub struct CostTracker {
    estimated_micro: AtomicU64,
    actual_micro: AtomicU64,
    runs_priced: AtomicU64,
}

impl CostTracker {
    /// Create a tracker with all totals at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a queue's estimate.
    pub fn record_estimate(&self, usd: f64) {
        self.estimated_micro
            .fetch_add(usd_to_micro(usd), Ordering::Relaxed);
    }

    /// Add the actual cost of one finished run.
    pub fn record_run(&self, usd: f64) {
        self.actual_micro.fetch_add(usd_to_micro(usd), Ordering::Relaxed);
        self.runs_priced.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time totals.
    pub fn snapshot(&self) -> CostSnapshot {
        let runs_priced = self.runs_priced.load(Ordering::Relaxed);
        let actual_micro = self.actual_micro.load(Ordering::Relaxed);
        CostSnapshot {
            estimated_usd: micro_to_usd(self.estimated_micro.load(Ordering::Relaxed)),
            actual_usd: micro_to_usd(actual_micro),
            runs_priced,
            average_run_usd: if runs_priced > 0 {
                micro_to_usd(actual_micro / runs_priced)
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of [`CostTracker`] totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSnapshot {
    /// Sum of queue estimates.
    pub estimated_usd: f64,
    /// Sum of actual run costs.
    pub actual_usd: f64,
    /// Number of runs priced.
    pub runs_priced: u64,
    /// Mean actual cost per priced run.
    pub average_run_usd: f64,
}

// ── Helpers ────────────────────────────────────────────────────────────

/// Convert USD to micro-dollars, clamping negatives and NaN to zero.
pub(crate) fn usd_to_micro(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * 1_000_000.0).round() as u64
    } else {
        0
    }
}

/// Convert micro-dollars to USD.
pub(crate) fn micro_to_usd(micro: u64) -> f64 {
    micro as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usd_to_micro_fractional() {
        assert_eq!(usd_to_micro(0.015), 15_000);
        assert_eq!(usd_to_micro(1.0), 1_000_000);
    }

    #[test]
    fn test_usd_to_micro_clamps_invalid() {
        assert_eq!(usd_to_micro(-3.0), 0);
        assert_eq!(usd_to_micro(f64::NAN), 0);
        assert_eq!(usd_to_micro(f64::INFINITY), 0);
    }

    #[test]
    fn test_estimate_run_multiplies_rounds() {
        let model = CostModel::new(0.02);
        assert!((model.estimate_run(10) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_queue_multiplies_runs() {
        let model = CostModel::new(0.02);
        assert!((model.estimate_queue(6, 10) - 1.2).abs() < 1e-9);
        assert!(model.estimate_queue(0, 10).abs() < f64::EPSILON);
    }

    #[test]
    fn test_actual_prefers_reported_cost() {
        let model = CostModel::new(0.02);
        assert!((model.actual_run(Some(0.37), 5) - 0.37).abs() < 1e-9);
    }

    #[test]
    fn test_actual_falls_back_to_rounds() {
        let model = CostModel::new(0.02);
        assert!((model.actual_run(None, 5) - 0.1).abs() < 1e-9);
        assert!((model.actual_run(Some(-1.0), 5) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_tracker_sums_without_drift() {
        let tracker = CostTracker::new();
        for _ in 0..1_000 {
            tracker.record_run(0.001);
        }
        tracker.record_estimate(2.5);
        let s = tracker.snapshot();
        assert_eq!(s.runs_priced, 1_000);
        assert!((s.actual_usd - 1.0).abs() < f64::EPSILON);
        assert!((s.average_run_usd - 0.001).abs() < f64::EPSILON);
        assert!((s.estimated_usd - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_tracker_average_is_zero() {
        let s = CostTracker::new().snapshot();
        assert!(s.average_run_usd.abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_recording_no_data_loss() {
        use std::sync::Arc;
        use std::thread;

        let tracker = Arc::new(CostTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = Arc::clone(&tracker);
                thread::spawn(move || {
                    for _ in 0..500 {
                        t.record_run(0.01);
                    }
                })
            })
            .collect();
        for h in handles {
            let _ = h.join();
        }
        assert_eq!(tracker.snapshot().runs_priced, 4_000);
    }
}
