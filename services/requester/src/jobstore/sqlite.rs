//! SQLite-backed job store.
//!
//! Jobs and their states are stored as JSON documents alongside the few
//! columns needed for lookups and conditional writes.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bidmesh_id::JobId;
use bidmesh_model::{Job, JobState};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use super::{check_update, JobQuery, JobStore, StoreError};

/// SQLite job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("job store connection lock poisoned".into()))
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                job TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_states (
                job_id TEXT PRIMARY KEY REFERENCES jobs(job_id),
                state TEXT NOT NULL,
                version INTEGER NOT NULL,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_job_states_state ON job_states(state);
            "#,
        )?;

        debug!("Job store schema initialized");
        Ok(())
    }
}

fn load_state(conn: &Connection, id: &JobId) -> Result<Option<JobState>, StoreError> {
    let record: Option<String> = conn
        .query_row(
            "SELECT record FROM job_states WHERE job_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    record
        .map(|r| serde_json::from_str(&r).map_err(StoreError::from))
        .transpose()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: &Job) -> Result<JobState, StoreError> {
        let id = *job.id();
        let state = JobState::new(id);
        let job_json = serde_json::to_string(job)?;
        let state_json = serde_json::to_string(&state)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM jobs WHERE job_id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(StoreError::AlreadyExists(id));
        }

        tx.execute(
            "INSERT INTO jobs (job_id, job, created_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), job_json, job.metadata.created_at.to_rfc3339()],
        )?;
        tx.execute(
            "INSERT INTO job_states (job_id, state, version, record, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                state.state.as_str(),
                state.version as i64,
                state_json,
                state.update_time.to_rfc3339()
            ],
        )?;
        tx.commit()?;

        debug!(job_id = %id, "Created job");
        Ok(state)
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StoreError> {
        let conn = self.conn()?;
        let job: Option<String> = conn
            .query_row(
                "SELECT job FROM jobs WHERE job_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let job = job.ok_or(StoreError::NotFound(*id))?;
        Ok(serde_json::from_str(&job)?)
    }

    async fn get_job_state(&self, id: &JobId) -> Result<JobState, StoreError> {
        let conn = self.conn()?;
        load_state(&conn, id)?.ok_or(StoreError::NotFound(*id))
    }

    async fn update_job_state(
        &self,
        state: &JobState,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let record = serde_json::to_string(state)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stored = load_state(&tx, &state.job_id)?.ok_or(StoreError::NotFound(state.job_id))?;
        check_update(&stored, state, expected_version)?;

        let updated = tx.execute(
            "UPDATE job_states
             SET state = ?1, version = ?2, record = ?3, updated_at = ?4
             WHERE job_id = ?5 AND version = ?6",
            params![
                state.state.as_str(),
                state.version as i64,
                record,
                state.update_time.to_rfc3339(),
                state.job_id.to_string(),
                expected_version as i64
            ],
        )?;
        if updated != 1 {
            return Err(StoreError::VersionConflict {
                job_id: state.job_id,
                expected: expected_version,
                actual: stored.version,
            });
        }
        tx.commit()?;
        Ok(())
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<(Job, JobState)>, StoreError> {
        let mut sql = String::from(
            "SELECT j.job, s.record FROM jobs j JOIN job_states s ON s.job_id = j.job_id",
        );
        if !query.states.is_empty() {
            let placeholders = vec!["?"; query.states.len()].join(", ");
            sql.push_str(&format!(" WHERE s.state IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY j.job_id");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(query.states.iter().map(|s| s.as_str())),
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;

        let mut jobs = Vec::new();
        for row in rows {
            let (job, state) = row?;
            jobs.push((serde_json::from_str(&job)?, serde_json::from_str(&state)?));
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobstore::conformance;

    fn store() -> SqliteJobStore {
        SqliteJobStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_create_then_get() {
        conformance::create_then_get(&store()).await;
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        conformance::duplicate_create_fails(&store()).await;
    }

    #[tokio::test]
    async fn test_missing_job() {
        conformance::missing_job(&store()).await;
    }

    #[tokio::test]
    async fn test_conditional_update() {
        conformance::conditional_update(&store()).await;
    }

    #[tokio::test]
    async fn test_terminal_is_final() {
        conformance::terminal_is_final(&store()).await;
    }

    #[tokio::test]
    async fn test_list_by_state() {
        conformance::list_by_state(&store()).await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let job = conformance::job();
        {
            let store = SqliteJobStore::open(&path).unwrap();
            store.create_job(&job).await.unwrap();
        }
        let store = SqliteJobStore::open(&path).unwrap();
        assert_eq!(store.get_job(job.id()).await.unwrap(), job);
    }
}
