//! SQLite-backed [`SimulationStore`].
//!
//! Only this file talks to the database. The connection sits behind a
//! mutex and every query runs on the blocking pool via
//! `tokio::task::spawn_blocking`.

use super::{SimulationStore, StoreError, StoreResult};
use crate::simulation::model::{
    Negotiation, QueueStatus, RunStatus, SimulationQueue, SimulationRun,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = include_str!("../../migrations/001_simulation.sql");

/// File-backed store. Cloning shares the same connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// [`StoreError::Sqlite`] if the file cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::migrate(conn)
    }

    /// Open an in-memory database (used in tests).
    ///
    /// # Errors
    ///
    /// [`StoreError::Sqlite`] if the schema cannot be applied.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::migrate(conn)
    }

    fn migrate(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn decode<T: DeserializeOwned>(bodies: Vec<String>) -> StoreResult<Vec<T>> {
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(StoreError::from))
        .collect()
}

fn query_bodies(
    conn: &Connection,
    sql: &str,
    param: &str,
) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![param], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_body(conn: &Connection, sql: &str, id: &str) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(sql, params![id], |row| row.get::<_, String>(0))
        .optional()?)
}

fn ensure_updated(changed: usize, kind: &'static str, id: String) -> StoreResult<()> {
    if changed == 0 {
        Err(StoreError::NotFound { kind, id })
    } else {
        Ok(())
    }
}

#[async_trait]
impl SimulationStore for SqliteStore {
    async fn insert_negotiation(&self, negotiation: &Negotiation) -> StoreResult<()> {
        let id = negotiation.id.clone();
        let body = serde_json::to_string(negotiation)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO negotiation (id, body) VALUES (?1, ?2)",
                params![id, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_negotiation(&self, id: &str) -> StoreResult<Option<Negotiation>> {
        let id = id.to_string();
        let body = self
            .with_conn(move |conn| query_body(conn, "SELECT body FROM negotiation WHERE id = ?1", &id))
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    async fn update_negotiation(&self, negotiation: &Negotiation) -> StoreResult<()> {
        let id = negotiation.id.clone();
        let body = serde_json::to_string(negotiation)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE negotiation SET body = ?1 WHERE id = ?2",
                params![body, id],
            )?;
            ensure_updated(changed, "negotiation", id)
        })
        .await
    }

    async fn insert_queue(
        &self,
        queue: &SimulationQueue,
        runs: &[SimulationRun],
    ) -> StoreResult<()> {
        let queue_row = (
            queue.id.clone(),
            queue.negotiation_id.clone(),
            queue.status.as_str(),
            serde_json::to_string(queue)?,
        );
        let run_rows = runs
            .iter()
            .map(|r| {
                Ok((
                    r.id.clone(),
                    r.queue_id.clone(),
                    i64::from(r.run_number),
                    r.status.as_str(),
                    serde_json::to_string(r)?,
                ))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO simulation_queue (id, negotiation_id, status, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![queue_row.0, queue_row.1, queue_row.2, queue_row.3],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO simulation_run (id, queue_id, run_number, status, body)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (id, queue_id, run_number, status, body) in &run_rows {
                    stmt.execute(params![id, queue_id, run_number, status, body])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_queue(&self, id: &str) -> StoreResult<Option<SimulationQueue>> {
        let id = id.to_string();
        let body = self
            .with_conn(move |conn| {
                query_body(conn, "SELECT body FROM simulation_queue WHERE id = ?1", &id)
            })
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    async fn update_queue(&self, queue: &SimulationQueue) -> StoreResult<()> {
        let id = queue.id.clone();
        let status = queue.status.as_str();
        let body = serde_json::to_string(queue)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE simulation_queue SET status = ?1, body = ?2 WHERE id = ?3",
                params![status, body, id],
            )?;
            ensure_updated(changed, "queue", id)
        })
        .await
    }

    async fn queues_for_negotiation(
        &self,
        negotiation_id: &str,
    ) -> StoreResult<Vec<SimulationQueue>> {
        let negotiation_id = negotiation_id.to_string();
        let bodies = self
            .with_conn(move |conn| {
                query_bodies(
                    conn,
                    "SELECT body FROM simulation_queue WHERE negotiation_id = ?1 ORDER BY seq ASC",
                    &negotiation_id,
                )
            })
            .await?;
        decode(bodies)
    }

    async fn queues_with_status(&self, status: QueueStatus) -> StoreResult<Vec<SimulationQueue>> {
        let bodies = self
            .with_conn(move |conn| {
                query_bodies(
                    conn,
                    "SELECT body FROM simulation_queue WHERE status = ?1 ORDER BY seq ASC",
                    status.as_str(),
                )
            })
            .await?;
        decode(bodies)
    }

    async fn get_run(&self, id: &str) -> StoreResult<Option<SimulationRun>> {
        let id = id.to_string();
        let body = self
            .with_conn(move |conn| {
                query_body(conn, "SELECT body FROM simulation_run WHERE id = ?1", &id)
            })
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    async fn runs_for_queue(&self, queue_id: &str) -> StoreResult<Vec<SimulationRun>> {
        let queue_id = queue_id.to_string();
        let bodies = self
            .with_conn(move |conn| {
                query_bodies(
                    conn,
                    "SELECT body FROM simulation_run WHERE queue_id = ?1 ORDER BY run_number ASC",
                    &queue_id,
                )
            })
            .await?;
        decode(bodies)
    }

    async fn runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<SimulationRun>> {
        let bodies = self
            .with_conn(move |conn| {
                query_bodies(
                    conn,
                    "SELECT body FROM simulation_run WHERE status = ?1
                     ORDER BY queue_id ASC, run_number ASC",
                    status.as_str(),
                )
            })
            .await?;
        decode(bodies)
    }

    async fn update_run(&self, run: &SimulationRun) -> StoreResult<()> {
        let id = run.id.clone();
        let status = run.status.as_str();
        let body = serde_json::to_string(run)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE simulation_run SET status = ?1, body = ?2 WHERE id = ?3",
                params![status, body, id],
            )?;
            ensure_updated(changed, "run", id)
        })
        .await
    }
}
