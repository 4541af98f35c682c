//! In-memory [`SimulationStore`] backed by a single `RwLock`.
//!
//! Insertion order is tracked with a sequence number so listing queries
//! return the same order as a database would by insertion.

use super::{SimulationStore, StoreError, StoreResult};
use crate::simulation::model::{
    Negotiation, QueueStatus, RunStatus, SimulationQueue, SimulationRun,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    seq: u64,
    negotiations: HashMap<String, Negotiation>,
    queues: HashMap<String, (u64, SimulationQueue)>,
    runs: HashMap<String, SimulationRun>,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn sorted_queues<F>(&self, keep: F) -> Vec<SimulationQueue>
    where
        F: Fn(&SimulationQueue) -> bool,
    {
        let mut queues: Vec<&(u64, SimulationQueue)> =
            self.queues.values().filter(|(_, q)| keep(q)).collect();
        queues.sort_by_key(|(seq, _)| *seq);
        queues.into_iter().map(|(_, q)| q.clone()).collect()
    }
}

/// Process-local store. Cheap to create; contents die with the process.
///
/// # Example
///
/// ```rust
/// use negotiation_orchestrator::store::{memory::MemoryStore, SimulationStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryStore::new();
/// assert!(store.get_queue("missing").await?.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SimulationStore for MemoryStore {
    async fn insert_negotiation(&self, negotiation: &Negotiation) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .negotiations
            .insert(negotiation.id.clone(), negotiation.clone());
        Ok(())
    }

    async fn get_negotiation(&self, id: &str) -> StoreResult<Option<Negotiation>> {
        Ok(self.tables.read().await.negotiations.get(id).cloned())
    }

    async fn update_negotiation(&self, negotiation: &Negotiation) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .negotiations
            .get_mut(&negotiation.id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "negotiation",
                id: negotiation.id.clone(),
            })?;
        *slot = negotiation.clone();
        Ok(())
    }

    async fn insert_queue(
        &self,
        queue: &SimulationQueue,
        runs: &[SimulationRun],
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let seq = tables.next_seq();
        tables.queues.insert(queue.id.clone(), (seq, queue.clone()));
        for run in runs {
            tables.runs.insert(run.id.clone(), run.clone());
        }
        Ok(())
    }

    async fn get_queue(&self, id: &str) -> StoreResult<Option<SimulationQueue>> {
        Ok(self
            .tables
            .read()
            .await
            .queues
            .get(id)
            .map(|(_, q)| q.clone()))
    }

    async fn update_queue(&self, queue: &SimulationQueue) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .queues
            .get_mut(&queue.id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "queue",
                id: queue.id.clone(),
            })?;
        slot.1 = queue.clone();
        Ok(())
    }

    async fn queues_for_negotiation(
        &self,
        negotiation_id: &str,
    ) -> StoreResult<Vec<SimulationQueue>> {
        let tables = self.tables.read().await;
        Ok(tables.sorted_queues(|q| q.negotiation_id == negotiation_id))
    }

    async fn queues_with_status(&self, status: QueueStatus) -> StoreResult<Vec<SimulationQueue>> {
        let tables = self.tables.read().await;
        Ok(tables.sorted_queues(|q| q.status == status))
    }

    async fn get_run(&self, id: &str) -> StoreResult<Option<SimulationRun>> {
        Ok(self.tables.read().await.runs.get(id).cloned())
    }

    async fn runs_for_queue(&self, queue_id: &str) -> StoreResult<Vec<SimulationRun>> {
        let tables = self.tables.read().await;
        let mut runs: Vec<SimulationRun> = tables
            .runs
            .values()
            .filter(|r| r.queue_id == queue_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.run_number);
        Ok(runs)
    }

    async fn runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<SimulationRun>> {
        let tables = self.tables.read().await;
        let mut runs: Vec<SimulationRun> = tables
            .runs
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            a.queue_id
                .cmp(&b.queue_id)
                .then(a.run_number.cmp(&b.run_number))
        });
        Ok(runs)
    }

    async fn update_run(&self, run: &SimulationRun) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "run",
                id: run.id.clone(),
            })?;
        *slot = run.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::model::{Scenario, UserRole};

    fn scenario() -> Scenario {
        Scenario {
            user_role: UserRole::Buyer,
            negotiation_type: None,
            dimensions: vec![],
            products: vec![],
            technique_ids: vec![],
            tactic_ids: vec![],
            counterpart: Default::default(),
            max_rounds: None,
            context: serde_json::Value::Null,
        }
    }

    fn queue_with_runs(negotiation_id: &str, n: u32) -> (SimulationQueue, Vec<SimulationRun>) {
        let queue = SimulationQueue::new(negotiation_id, n, 0.0);
        let runs = (1..=n)
            .rev()
            .map(|i| SimulationRun::new(&queue.id, negotiation_id, "t", "k", i))
            .collect();
        (queue, runs)
    }

    #[tokio::test]
    async fn test_negotiation_insert_get_update() {
        let store = MemoryStore::new();
        let mut negotiation = Negotiation::new("Deal", scenario());
        assert!(store.insert_negotiation(&negotiation).await.is_ok());
        negotiation.title = "Renamed".to_string();
        assert!(store.update_negotiation(&negotiation).await.is_ok());
        let fetched = store.get_negotiation(&negotiation.id).await.ok().flatten();
        assert_eq!(fetched.map(|n| n.title), Some("Renamed".to_string()));
    }

    #[tokio::test]
    async fn test_update_unknown_records_is_not_found() {
        let store = MemoryStore::new();
        let (queue, runs) = queue_with_runs("n", 1);
        assert!(matches!(
            store.update_queue(&queue).await,
            Err(StoreError::NotFound { kind: "queue", .. })
        ));
        assert!(matches!(
            store.update_run(&runs[0]).await,
            Err(StoreError::NotFound { kind: "run", .. })
        ));
        let negotiation = Negotiation::new("x", scenario());
        assert!(store.update_negotiation(&negotiation).await.is_err());
    }

    #[tokio::test]
    async fn test_runs_for_queue_sorted_by_run_number() {
        let store = MemoryStore::new();
        let (queue, runs) = queue_with_runs("n", 4);
        assert!(store.insert_queue(&queue, &runs).await.is_ok());
        let fetched = store.runs_for_queue(&queue.id).await.unwrap_or_default();
        let numbers: Vec<u32> = fetched.iter().map(|r| r.run_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_queues_listed_oldest_first() {
        let store = MemoryStore::new();
        let (q1, r1) = queue_with_runs("n", 1);
        let (q2, r2) = queue_with_runs("n", 1);
        let (q3, r3) = queue_with_runs("other", 1);
        for (q, r) in [(&q1, &r1), (&q2, &r2), (&q3, &r3)] {
            assert!(store.insert_queue(q, r).await.is_ok());
        }
        let ids: Vec<String> = store
            .queues_for_negotiation("n")
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(ids, vec![q1.id.clone(), q2.id.clone()]);

        let pending = store
            .queues_with_status(QueueStatus::Pending)
            .await
            .unwrap_or_default();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[2].id, q3.id);
    }

    #[tokio::test]
    async fn test_runs_with_status_filters() {
        let store = MemoryStore::new();
        let (queue, mut runs) = queue_with_runs("n", 3);
        let _ = runs[0].begin();
        assert!(store.insert_queue(&queue, &runs).await.is_ok());
        let running = store
            .runs_with_status(RunStatus::Running)
            .await
            .unwrap_or_default();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, runs[0].id);
    }
}
