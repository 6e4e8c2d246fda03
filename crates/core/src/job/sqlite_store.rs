//! SQLite-backed job store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::watch;

use crate::config::DatabaseConfig;

use super::{
    Download, DownloadState, Job, JobStatus, JobStore, NewDownload, NewJob, Operation,
    OperationState, StoreError, StoreStats,
};

const JOB_COLUMNS: &str =
    "id, job_index, text, tail_key, status, submitted_at, error, created_at, updated_at";

const OPERATION_COLUMNS: &str = "id, job_id, op_name, state, artifact_url, created_at, updated_at";

const DOWNLOAD_COLUMNS: &str = "d.id, d.job_id, d.operation_id, d.take_index, d.source_url, d.target_filename, d.state, d.attempts, d.local_path, d.last_error, d.created_at, d.updated_at";

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
    changes: watch::Sender<u64>,
}

impl SqliteJobStore {
    /// Create a new SQLite job store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open the store at the configured path, creating its directory if needed.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("{}: {}", parent.display(), e))
            })?;
        }
        Self::new(&config.path)
    }

    /// Create an in-memory SQLite job store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::initialize_schema(&conn)?;
        let (changes, _) = watch::channel(0);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_index INTEGER NOT NULL UNIQUE,
                text TEXT NOT NULL,
                tail_key TEXT NOT NULL,
                status TEXT NOT NULL,
                submitted_at TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, job_index);

            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                op_name TEXT NOT NULL UNIQUE,
                state TEXT NOT NULL,
                artifact_url TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_operations_job ON operations(job_id);

            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                operation_id TEXT REFERENCES operations(id) ON DELETE SET NULL,
                take_index INTEGER NOT NULL,
                source_url TEXT NOT NULL,
                target_filename TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                local_path TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(job_id, take_index)
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_state ON downloads(state);

            -- One download per artifact, whichever path discovered it first
            CREATE UNIQUE INDEX IF NOT EXISTS idx_downloads_source ON downloads(job_id, source_url);
            "#,
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))
    }

    /// Wake everyone waiting on store changes.
    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn parse_time(value: &str) -> DateTime<Utc> {
        // Only ever written by us in RFC 3339.
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    fn conversion_error(column: usize, message: String) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            message.into(),
        )
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status_str: String = row.get(4)?;
        let submitted_at: Option<String> = row.get(5)?;
        let created_at: String = row.get(7)?;
        let updated_at: String = row.get(8)?;

        Ok(Job {
            id: row.get(0)?,
            index: row.get(1)?,
            text: row.get(2)?,
            tail_key: row.get(3)?,
            status: status_str
                .parse()
                .map_err(|e| Self::conversion_error(4, e))?,
            submitted_at: submitted_at.as_deref().map(Self::parse_time),
            error: row.get(6)?,
            created_at: Self::parse_time(&created_at),
            updated_at: Self::parse_time(&updated_at),
        })
    }

    fn row_to_operation(row: &rusqlite::Row) -> rusqlite::Result<Operation> {
        let state_str: String = row.get(3)?;
        let created_at: String = row.get(5)?;
        let updated_at: String = row.get(6)?;

        Ok(Operation {
            id: row.get(0)?,
            job_id: row.get(1)?,
            op_name: row.get(2)?,
            state: state_str
                .parse()
                .map_err(|e| Self::conversion_error(3, e))?,
            artifact_url: row.get(4)?,
            created_at: Self::parse_time(&created_at),
            updated_at: Self::parse_time(&updated_at),
        })
    }

    fn row_to_download(row: &rusqlite::Row) -> rusqlite::Result<Download> {
        let state_str: String = row.get(6)?;
        let created_at: String = row.get(10)?;
        let updated_at: String = row.get(11)?;

        Ok(Download {
            id: row.get(0)?,
            job_id: row.get(1)?,
            operation_id: row.get(2)?,
            take_index: row.get(3)?,
            source_url: row.get(4)?,
            target_filename: row.get(5)?,
            state: state_str
                .parse()
                .map_err(|e| Self::conversion_error(6, e))?,
            attempts: row.get(7)?,
            local_path: row.get(8)?,
            last_error: row.get(9)?,
            created_at: Self::parse_time(&created_at),
            updated_at: Self::parse_time(&updated_at),
        })
    }

    fn query_job(conn: &Connection, id: &str) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], Self::row_to_job)
            .optional()?)
    }

    fn query_download(conn: &Connection, id: &str) -> Result<Option<Download>, StoreError> {
        let sql = format!("SELECT {} FROM downloads d WHERE d.id = ?", DOWNLOAD_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], Self::row_to_download)
            .optional()?)
    }

    /// Run a conditional job update. `Ok(false)` when the job exists but the
    /// condition did not hold.
    fn transition(
        &self,
        job_id: &str,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(sql, params)?;
        if changed == 0 {
            if Self::query_job(&conn, job_id)?.is_none() {
                return Err(StoreError::NotFound(job_id.to_string()));
            }
            return Ok(false);
        }
        drop(conn);
        self.notify();
        Ok(true)
    }

    fn list_jobs_where(&self, clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Job>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM jobs {} ORDER BY job_index ASC", JOB_COLUMNS, clause);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, Self::row_to_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }
}

impl JobStore for SqliteJobStore {
    fn create_jobs(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        if existing > 0 {
            return Err(StoreError::Duplicate(1));
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(jobs.len());
        for (position, new_job) in jobs.into_iter().enumerate() {
            let index = position as u32 + 1;
            let id = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO jobs (id, job_index, text, tail_key, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    id,
                    index,
                    new_job.text,
                    new_job.tail_key,
                    JobStatus::Queued.as_str(),
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;
            created.push(Job {
                id,
                index,
                text: new_job.text,
                tail_key: new_job.tail_key,
                status: JobStatus::Queued,
                submitted_at: None,
                error: None,
                created_at: now,
                updated_at: now,
            });
        }

        tx.commit()?;
        drop(conn);
        self.notify();
        Ok(created)
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.lock()?;
        Self::query_job(&conn, id)
    }

    fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.list_jobs_where("", &[])
    }

    fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        self.list_jobs_where("WHERE status = ?", &[&status.as_str()])
    }

    fn next_queued(&self) -> Result<Option<Job>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM jobs WHERE status = ? ORDER BY job_index ASC LIMIT 1",
            JOB_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![JobStatus::Queued.as_str()], Self::row_to_job)
            .optional()?)
    }

    fn current_submitting(&self) -> Result<Option<Job>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM jobs WHERE status = ? ORDER BY updated_at DESC LIMIT 1",
            JOB_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![JobStatus::Submitting.as_str()], Self::row_to_job)
            .optional()?)
    }

    fn mark_submitting(&self, job_id: &str) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.transition(
            job_id,
            "UPDATE jobs SET status = 'submitting', error = NULL, updated_at = ? WHERE id = ? AND status = 'queued'",
            &[&now, &job_id],
        )
    }

    fn mark_submitted(&self, job_id: &str) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.transition(
            job_id,
            "UPDATE jobs SET submitted_at = ?, updated_at = ? WHERE id = ? AND status = 'submitting' AND submitted_at IS NULL",
            &[&now, &now, &job_id],
        )
    }

    fn mark_in_progress(&self, job_id: &str, op_names: &[String]) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let changed = tx.execute(
            "UPDATE jobs SET status = 'in_progress', submitted_at = COALESCE(submitted_at, ?), updated_at = ? WHERE id = ? AND status = 'submitting'",
            params![now, now, job_id],
        )?;

        if changed == 0 {
            let exists = Self::query_job(&tx, job_id)?.is_some();
            return if exists {
                Ok(false)
            } else {
                Err(StoreError::NotFound(job_id.to_string()))
            };
        }

        for op_name in op_names {
            tx.execute(
                "INSERT OR IGNORE INTO operations (id, job_id, op_name, state, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    job_id,
                    op_name,
                    OperationState::Pending.as_str(),
                    now,
                    now,
                ],
            )?;
        }

        tx.commit()?;
        drop(conn);
        self.notify();
        Ok(true)
    }

    fn mark_done(&self, job_id: &str) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.transition(
            job_id,
            "UPDATE jobs SET status = 'done', updated_at = ? WHERE id = ? AND status = 'in_progress'",
            &[&now, &job_id],
        )
    }

    fn mark_failed(&self, job_id: &str, reason: &str) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.transition(
            job_id,
            "UPDATE jobs SET status = 'failed', error = ?, updated_at = ? WHERE id = ? AND status IN ('queued', 'submitting', 'in_progress')",
            &[&reason, &now, &job_id],
        )
    }

    fn requeue(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let changed = tx.execute(
            "UPDATE jobs SET status = 'queued', submitted_at = NULL, error = NULL, updated_at = ? WHERE id = ? AND status = 'failed'",
            params![now, job_id],
        )?;

        if changed == 0 {
            let exists = Self::query_job(&tx, job_id)?.is_some();
            return if exists {
                Ok(false)
            } else {
                Err(StoreError::NotFound(job_id.to_string()))
            };
        }

        tx.execute("DELETE FROM operations WHERE job_id = ?", params![job_id])?;
        tx.commit()?;
        drop(conn);
        self.notify();
        Ok(true)
    }

    fn resolve_operation(&self, op_name: &str) -> Result<Option<(Job, Operation)>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM operations WHERE op_name = ?", OPERATION_COLUMNS);
        let Some(operation) = conn
            .query_row(&sql, params![op_name], Self::row_to_operation)
            .optional()?
        else {
            return Ok(None);
        };

        let job = Self::query_job(&conn, &operation.job_id)?
            .ok_or_else(|| StoreError::NotFound(operation.job_id.clone()))?;
        Ok(Some((job, operation)))
    }

    fn update_operation(
        &self,
        op_name: &str,
        state: OperationState,
        artifact_url: Option<&str>,
    ) -> Result<Option<Operation>, StoreError> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        // Terminal states stick; a late non-terminal report must not regress them.
        let changed = conn.execute(
            "UPDATE operations SET state = ?, artifact_url = COALESCE(?, artifact_url), updated_at = ? WHERE op_name = ? AND (state NOT IN ('succeeded', 'failed') OR ? IN ('succeeded', 'failed'))",
            params![state.as_str(), artifact_url, now, op_name, state.as_str()],
        )?;

        let sql = format!("SELECT {} FROM operations WHERE op_name = ?", OPERATION_COLUMNS);
        let operation = conn
            .query_row(&sql, params![op_name], Self::row_to_operation)
            .optional()?;

        drop(conn);
        if changed > 0 {
            self.notify();
        }
        Ok(operation)
    }

    fn operations_for_job(&self, job_id: &str) -> Result<Vec<Operation>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM operations WHERE job_id = ? ORDER BY rowid ASC",
            OPERATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![job_id], Self::row_to_operation)?;
        let mut operations = Vec::new();
        for row in rows {
            operations.push(row?);
        }
        Ok(operations)
    }

    fn aggregate_status(&self, job_id: &str) -> Result<JobStatus, StoreError> {
        let job = self
            .get_job(job_id)?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        let operations = self.operations_for_job(job_id)?;

        if operations.is_empty() {
            return Ok(job.status);
        }

        let all_succeeded = operations
            .iter()
            .all(|op| op.state == OperationState::Succeeded);
        let any_failed = operations
            .iter()
            .any(|op| op.state == OperationState::Failed);
        let any_pending = operations.iter().any(|op| !op.state.is_terminal());

        if all_succeeded {
            Ok(JobStatus::Done)
        } else if any_failed && !any_pending {
            Ok(JobStatus::Failed)
        } else {
            Ok(job.status)
        }
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.lock()?;
        let mut stats = StoreStats::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        for row in rows {
            let (status, count) = row?;
            stats.total_jobs += count;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Queued) => stats.queued = count,
                Ok(JobStatus::Submitting) => stats.submitting = count,
                Ok(JobStatus::InProgress) => stats.in_progress = count,
                Ok(JobStatus::Done) => stats.done = count,
                Ok(JobStatus::Failed) => stats.failed = count,
                Err(e) => return Err(StoreError::Database(e)),
            }
        }

        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM downloads GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        for row in rows {
            let (state, count) = row?;
            match state.parse::<DownloadState>() {
                Ok(DownloadState::Queued) => stats.downloads_queued = count,
                Ok(DownloadState::Running) => stats.downloads_running = count,
                Ok(DownloadState::Done) => stats.downloads_done = count,
                Ok(DownloadState::Failed) => stats.downloads_failed = count,
                Err(e) => return Err(StoreError::Database(e)),
            }
        }

        Ok(stats)
    }

    fn insert_download(&self, download: NewDownload) -> Result<Option<Download>, StoreError> {
        let conn = self.lock()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO downloads (id, job_id, operation_id, take_index, source_url, target_filename, state, attempts, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
            params![
                id,
                download.job_id,
                download.operation_id,
                download.take_index,
                download.source_url,
                download.target_filename,
                DownloadState::Queued.as_str(),
                now,
                now,
            ],
        )?;

        if inserted == 0 {
            return Ok(None);
        }

        let created = Self::query_download(&conn, &id)?;
        drop(conn);
        self.notify();
        Ok(created)
    }

    fn downloads_for_job(&self, job_id: &str) -> Result<Vec<Download>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM downloads d WHERE d.job_id = ? ORDER BY d.take_index ASC",
            DOWNLOAD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![job_id], Self::row_to_download)?;
        let mut downloads = Vec::new();
        for row in rows {
            downloads.push(row?);
        }
        Ok(downloads)
    }

    fn claim_next_download(&self) -> Result<Option<Download>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let next: Option<String> = tx
            .query_row(
                "SELECT id FROM downloads WHERE state = 'queued' ORDER BY rowid ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE downloads SET state = 'running', updated_at = ? WHERE id = ?",
            params![Utc::now().to_rfc3339(), id],
        )?;
        let claimed = Self::query_download(&tx, &id)?;
        tx.commit()?;
        drop(conn);
        self.notify();
        Ok(claimed)
    }

    fn record_download_attempt(&self, download_id: &str) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE downloads SET attempts = attempts + 1, updated_at = ? WHERE id = ?",
            params![Utc::now().to_rfc3339(), download_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(download_id.to_string()));
        }
        let attempts: u32 = conn.query_row(
            "SELECT attempts FROM downloads WHERE id = ?",
            params![download_id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    fn complete_download(&self, download_id: &str, local_path: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE downloads SET state = 'done', local_path = ?, last_error = NULL, updated_at = ? WHERE id = ?",
            params![local_path, Utc::now().to_rfc3339(), download_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(download_id.to_string()));
        }
        drop(conn);
        self.notify();
        Ok(())
    }

    fn fail_download(&self, download_id: &str, error: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE downloads SET state = 'failed', last_error = ?, updated_at = ? WHERE id = ?",
            params![error, Utc::now().to_rfc3339(), download_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(download_id.to_string()));
        }
        drop(conn);
        self.notify();
        Ok(())
    }

    fn list_downloads(&self, state: Option<DownloadState>) -> Result<Vec<Download>, StoreError> {
        let conn = self.lock()?;
        let where_clause = if state.is_some() {
            "WHERE d.state = ?"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {} FROM downloads d JOIN jobs j ON j.id = d.job_id {} ORDER BY j.job_index ASC, d.take_index ASC",
            DOWNLOAD_COLUMNS, where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = match state {
            Some(state) => stmt.query_map(params![state.as_str()], Self::row_to_download)?,
            None => stmt.query_map([], Self::row_to_download)?,
        };
        let mut downloads = Vec::new();
        for row in rows {
            downloads.push(row?);
        }
        Ok(downloads)
    }

    fn reset_running_downloads(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE downloads SET state = 'queued', updated_at = ? WHERE state = 'running'",
            params![Utc::now().to_rfc3339()],
        )?;
        drop(conn);
        if changed > 0 {
            self.notify();
        }
        Ok(changed)
    }

    fn requeue_failed_downloads(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE downloads SET state = 'queued', attempts = 0, updated_at = ? WHERE state = 'failed'",
            params![Utc::now().to_rfc3339()],
        )?;
        drop(conn);
        if changed > 0 {
            self.notify();
        }
        Ok(changed)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
