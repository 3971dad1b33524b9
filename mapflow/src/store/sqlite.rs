//! `SQLite`-backed [`JobStore`].
//!
//! Uses a single `Mutex<Connection>` and runs every statement on the
//! blocking thread pool. Jobs and steps
//! are stored as JSON records next to the columns queries filter on;
//! checkpoints, logs, results and events are fully columnar.

#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    CheckpointId, ExecutionCheckpoint, ExecutionLog, ExecutionStep, Job, JobEvent, JobId, JobStore,
    Payload, ResultStorage, SequenceHeads, StepCommit, StoreError, StoreResult,
};
use crate::core::{CheckpointKind, JobEventKind, JobStatus, LogLevel};

/// Idempotent DDL for the job tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    strategy_name TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    record TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_steps (
    job_id TEXT NOT NULL REFERENCES jobs(id),
    step_index INTEGER NOT NULL,
    status TEXT NOT NULL,
    record TEXT NOT NULL,
    PRIMARY KEY (job_id, step_index)
);

CREATE TABLE IF NOT EXISTS execution_checkpoints (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    kind TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    storage TEXT NOT NULL,
    inline_bytes BLOB,
    location TEXT,
    stored_size INTEGER NOT NULL,
    compressed INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL,
    is_resumable INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_logs (
    job_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    detail TEXT,
    step_index INTEGER,
    category TEXT NOT NULL,
    component TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (job_id, sequence)
);

CREATE TABLE IF NOT EXISTS result_storage (
    job_id TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    result_key TEXT NOT NULL,
    storage TEXT NOT NULL,
    inline_bytes BLOB,
    location TEXT,
    stored_size INTEGER NOT NULL,
    compressed INTEGER NOT NULL DEFAULT 0,
    content_type TEXT NOT NULL,
    encoding TEXT NOT NULL,
    checksum TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TEXT,
    PRIMARY KEY (job_id, step_index, result_key)
);

CREATE TABLE IF NOT EXISTS job_events (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    UNIQUE (job_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_job ON execution_checkpoints (job_id, step_index);
CREATE INDEX IF NOT EXISTS idx_checkpoints_expiry ON execution_checkpoints (expires_at);
CREATE INDEX IF NOT EXISTS idx_events_pending ON job_events (delivered, created_at);
";

const CHECKPOINT_COLUMNS: &str = "id, job_id, step_index, kind, created_at, expires_at, storage, \
     inline_bytes, location, stored_size, compressed, size_bytes, is_resumable";

const RESULT_COLUMNS: &str = "job_id, step_index, result_key, storage, inline_bytes, location, \
     stored_size, compressed, content_type, encoding, checksum, size_bytes, created_at, \
     expires_at, access_count, last_accessed_at";

const EVENT_COLUMNS: &str =
    "id, job_id, sequence, kind, payload, created_at, delivered, attempts, last_error";

/// `SQLite`-backed job storage.
///
/// Create with [`SqliteJobStore::open`] for file-backed persistence or
/// [`SqliteJobStore::in_memory`] for tests.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore").finish_non_exhaustive()
    }
}

impl SqliteJobStore {
    /// Open or create a job database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory can't be created,
    /// or [`StoreError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the schema can't be created.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn corrupt(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(StoreError::Corrupt(message)),
    )
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("timestamp '{raw}': {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| corrupt(format!("json: {e}")))
}

fn parse_uuid(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| corrupt(format!("uuid '{raw}': {e}")))
}

/// Splits a payload into (storage, `inline_bytes`, location, `stored_size`, compressed).
fn payload_columns(payload: &Payload) -> (&'static str, Option<&[u8]>, Option<&str>, i64, bool) {
    match payload {
        Payload::Inline { bytes } => ("inline", Some(bytes.as_slice()), None, bytes.len() as i64, false),
        Payload::External {
            location,
            size_bytes,
            compressed,
        } => ("external", None, Some(location.as_str()), *size_bytes as i64, *compressed),
    }
}

fn payload_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<Payload> {
    let storage: String = row.get(first)?;
    match storage.as_str() {
        "inline" => Ok(Payload::Inline {
            bytes: row.get::<_, Option<Vec<u8>>>(first + 1)?.unwrap_or_default(),
        }),
        "external" => Ok(Payload::External {
            location: row
                .get::<_, Option<String>>(first + 2)?
                .ok_or_else(|| corrupt("external payload without location".into()))?,
            size_bytes: row.get::<_, i64>(first + 3)? as u64,
            compressed: row.get(first + 4)?,
        }),
        other => Err(corrupt(format!("payload storage '{other}'"))),
    }
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionCheckpoint> {
    let id: String = row.get(0)?;
    let job_id: String = row.get(1)?;
    let kind: String = row.get(3)?;
    Ok(ExecutionCheckpoint {
        id: id.parse().map_err(|e| corrupt(format!("checkpoint id: {e}")))?,
        job_id: job_id.parse().map_err(|e| corrupt(format!("job id: {e}")))?,
        step_index: row.get::<_, i64>(2)? as usize,
        kind: CheckpointKind::parse(&kind).ok_or_else(|| corrupt(format!("checkpoint kind '{kind}'")))?,
        created_at: parse_ts(&row.get::<_, String>(4)?)?,
        expires_at: parse_opt_ts(row.get(5)?)?,
        payload: payload_from_row(row, 6)?,
        size_bytes: row.get::<_, i64>(11)? as u64,
        is_resumable: row.get(12)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<ResultStorage> {
    let job_id: String = row.get(0)?;
    Ok(ResultStorage {
        job_id: job_id.parse().map_err(|e| corrupt(format!("job id: {e}")))?,
        step_index: row.get::<_, i64>(1)? as usize,
        result_key: row.get(2)?,
        payload: payload_from_row(row, 3)?,
        content_type: row.get(8)?,
        encoding: row.get(9)?,
        checksum: row.get(10)?,
        size_bytes: row.get::<_, i64>(11)? as u64,
        created_at: parse_ts(&row.get::<_, String>(12)?)?,
        expires_at: parse_opt_ts(row.get(13)?)?,
        access_count: row.get::<_, i64>(14)? as u64,
        last_accessed_at: parse_opt_ts(row.get(15)?)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<JobEvent> {
    let job_id: String = row.get(1)?;
    let kind: String = row.get(3)?;
    Ok(JobEvent {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        job_id: job_id.parse().map_err(|e| corrupt(format!("job id: {e}")))?,
        sequence: row.get::<_, i64>(2)? as u64,
        kind: JobEventKind::parse(&kind).ok_or_else(|| corrupt(format!("event kind '{kind}'")))?,
        payload: parse_json(&row.get::<_, String>(4)?)?,
        created_at: parse_ts(&row.get::<_, String>(5)?)?,
        delivered: row.get(6)?,
        attempts: row.get::<_, i64>(7)? as u32,
        last_error: row.get(8)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionLog> {
    let job_id: String = row.get(0)?;
    let level: String = row.get(2)?;
    let detail: Option<String> = row.get(4)?;
    Ok(ExecutionLog {
        job_id: job_id.parse().map_err(|e| corrupt(format!("job id: {e}")))?,
        sequence: row.get::<_, i64>(1)? as u64,
        level: LogLevel::parse(&level).ok_or_else(|| corrupt(format!("log level '{level}'")))?,
        message: row.get(3)?,
        detail: detail.as_deref().map(parse_json).transpose()?,
        step_index: row.get::<_, Option<i64>>(5)?.map(|i| i as usize),
        category: row.get(6)?,
        component: row.get(7)?,
        timestamp: parse_ts(&row.get::<_, String>(8)?)?,
    })
}

fn write_job(conn: &Connection, job: &Job, insert: bool) -> StoreResult<()> {
    let record = serde_json::to_string(job)?;
    if insert {
        conn.execute(
            "INSERT INTO jobs (id, strategy_name, status, created_at, updated_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id.to_string(),
                job.strategy_name,
                job.status.as_str(),
                ts(&job.created_at),
                ts(&job.updated_at),
                record
            ],
        )?;
        return Ok(());
    }
    let changed = conn.execute(
        "UPDATE jobs SET status = ?2, updated_at = ?3, record = ?4 WHERE id = ?1",
        params![job.id.to_string(), job.status.as_str(), ts(&job.updated_at), record],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("job {}", job.id)));
    }
    Ok(())
}

fn write_step(conn: &Connection, step: &ExecutionStep) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO execution_steps (job_id, step_index, status, record) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (job_id, step_index) DO UPDATE SET status = excluded.status, record = excluded.record",
        params![
            step.job_id.to_string(),
            step.step_index as i64,
            step.status.as_str(),
            serde_json::to_string(step)?
        ],
    )?;
    Ok(())
}

fn write_logs(conn: &Connection, logs: &[ExecutionLog]) -> StoreResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO execution_logs
         (job_id, sequence, level, message, detail, step_index, category, component, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for log in logs {
        let detail = log.detail.as_ref().map(serde_json::to_string).transpose()?;
        stmt.execute(params![
            log.job_id.to_string(),
            log.sequence as i64,
            log.level.as_str(),
            log.message,
            detail,
            log.step_index.map(|i| i as i64),
            log.category,
            log.component,
            ts(&log.timestamp)
        ])?;
    }
    Ok(())
}

fn write_checkpoint(conn: &Connection, cp: &ExecutionCheckpoint) -> StoreResult<()> {
    let (storage, inline, location, stored_size, compressed) = payload_columns(&cp.payload);
    conn.execute(
        &format!("INSERT INTO execution_checkpoints ({CHECKPOINT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
        params![
            cp.id.to_string(),
            cp.job_id.to_string(),
            cp.step_index as i64,
            cp.kind.as_str(),
            ts(&cp.created_at),
            cp.expires_at.as_ref().map(ts),
            storage,
            inline,
            location,
            stored_size,
            compressed,
            cp.size_bytes as i64,
            cp.is_resumable
        ],
    )?;
    Ok(())
}

fn write_result(conn: &Connection, result: &ResultStorage) -> StoreResult<()> {
    let (storage, inline, location, stored_size, compressed) = payload_columns(&result.payload);
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO result_storage ({RESULT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            result.job_id.to_string(),
            result.step_index as i64,
            result.result_key,
            storage,
            inline,
            location,
            stored_size,
            compressed,
            result.content_type,
            result.encoding,
            result.checksum,
            result.size_bytes as i64,
            ts(&result.created_at),
            result.expires_at.as_ref().map(ts),
            result.access_count as i64,
            result.last_accessed_at.as_ref().map(ts)
        ],
    )?;
    Ok(())
}

fn write_events(conn: &Connection, events: &[JobEvent]) -> StoreResult<()> {
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO job_events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
    ))?;
    for event in events {
        stmt.execute(params![
            event.id.to_string(),
            event.job_id.to_string(),
            event.sequence as i64,
            event.kind.as_str(),
            serde_json::to_string(&event.payload)?,
            ts(&event.created_at),
            event.delivered,
            i64::from(event.attempts),
            event.last_error
        ])?;
    }
    Ok(())
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> StoreResult<Vec<T>> {
    rows.map(|row| row.map_err(StoreError::from)).collect()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        let job = job.clone();
        self.with_conn(move |conn| write_job(conn, &job, true)).await
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        let job = job.clone();
        self.with_conn(move |conn| write_job(conn, &job, false)).await
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<Job>> {
        self.with_conn(move |conn| {
            let record: Option<String> = conn
                .query_row(
                    "SELECT record FROM jobs WHERE id = ?1",
                    [job_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(record.as_deref().map(serde_json::from_str).transpose()?)
        })
        .await
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> StoreResult<Vec<Job>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM jobs WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at",
            )?;
            let records = collect(
                stmt.query_map([status.map(|s| s.as_str())], |row| row.get::<_, String>(0))?,
            )?;
            records
                .iter()
                .map(|r| serde_json::from_str(r).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    async fn upsert_step(&self, step: &ExecutionStep) -> StoreResult<()> {
        let step = step.clone();
        self.with_conn(move |conn| write_step(conn, &step)).await
    }

    async fn get_step(&self, job_id: JobId, step_index: usize) -> StoreResult<Option<ExecutionStep>> {
        self.with_conn(move |conn| {
            let record: Option<String> = conn
                .query_row(
                    "SELECT record FROM execution_steps WHERE job_id = ?1 AND step_index = ?2",
                    params![job_id.to_string(), step_index as i64],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(record.as_deref().map(serde_json::from_str).transpose()?)
        })
        .await
    }

    async fn list_steps(&self, job_id: JobId) -> StoreResult<Vec<ExecutionStep>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM execution_steps WHERE job_id = ?1 ORDER BY step_index",
            )?;
            let records =
                collect(stmt.query_map([job_id.to_string()], |row| row.get::<_, String>(0))?)?;
            records
                .iter()
                .map(|r| serde_json::from_str(r).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    async fn append_logs(&self, logs: &[ExecutionLog]) -> StoreResult<()> {
        let logs = logs.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            write_logs(&tx, &logs)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_logs(&self, job_id: JobId) -> StoreResult<Vec<ExecutionLog>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, sequence, level, message, detail, step_index, category, component, timestamp
                 FROM execution_logs WHERE job_id = ?1 ORDER BY sequence",
            )?;
            let logs = collect(stmt.query_map([job_id.to_string()], log_from_row)?);
            logs
        })
        .await
    }

    async fn save_checkpoint(&self, checkpoint: &ExecutionCheckpoint) -> StoreResult<()> {
        let checkpoint = checkpoint.clone();
        self.with_conn(move |conn| write_checkpoint(conn, &checkpoint)).await
    }

    async fn list_checkpoints(&self, job_id: JobId) -> StoreResult<Vec<ExecutionCheckpoint>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM execution_checkpoints WHERE job_id = ?1
                 ORDER BY created_at, step_index"
            ))?;
            let checkpoints = collect(stmt.query_map([job_id.to_string()], checkpoint_from_row)?);
            checkpoints
        })
        .await
    }

    async fn list_expired_checkpoints(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ExecutionCheckpoint>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM execution_checkpoints
                 WHERE expires_at IS NOT NULL AND expires_at <= ?1 ORDER BY created_at"
            ))?;
            let checkpoints = collect(stmt.query_map([ts(&now)], checkpoint_from_row)?);
            checkpoints
        })
        .await
    }

    async fn delete_checkpoint(&self, checkpoint_id: CheckpointId) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM execution_checkpoints WHERE id = ?1",
                [checkpoint_id.to_string()],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn save_result(&self, result: &ResultStorage) -> StoreResult<()> {
        let result = result.clone();
        self.with_conn(move |conn| write_result(conn, &result)).await
    }

    async fn read_result(
        &self,
        job_id: JobId,
        step_index: usize,
        result_key: &str,
    ) -> StoreResult<Option<ResultStorage>> {
        let result_key = result_key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE result_storage SET access_count = access_count + 1, last_accessed_at = ?4
                 WHERE job_id = ?1 AND step_index = ?2 AND result_key = ?3",
                params![job_id.to_string(), step_index as i64, result_key, ts(&Utc::now())],
            )?;
            let result = tx
                .query_row(
                    &format!(
                        "SELECT {RESULT_COLUMNS} FROM result_storage
                         WHERE job_id = ?1 AND step_index = ?2 AND result_key = ?3"
                    ),
                    params![job_id.to_string(), step_index as i64, result_key],
                    result_from_row,
                )
                .optional()?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn list_results(&self, job_id: JobId) -> StoreResult<Vec<ResultStorage>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RESULT_COLUMNS} FROM result_storage WHERE job_id = ?1
                 ORDER BY step_index, result_key"
            ))?;
            let results = collect(stmt.query_map([job_id.to_string()], result_from_row)?);
            results
        })
        .await
    }

    async fn append_events(&self, events: &[JobEvent]) -> StoreResult<()> {
        let events = events.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            write_events(&tx, &events)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_events(&self, job_id: JobId, from_sequence: u64) -> StoreResult<Vec<JobEvent>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM job_events WHERE job_id = ?1 AND sequence >= ?2
                 ORDER BY sequence"
            ))?;
            let events = collect(stmt.query_map(
                params![job_id.to_string(), from_sequence as i64],
                event_from_row,
            )?);
            events
        })
        .await
    }

    async fn pending_events(&self, limit: usize) -> StoreResult<Vec<JobEvent>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM job_events WHERE delivered = 0
                 ORDER BY created_at, sequence LIMIT ?1"
            ))?;
            let events = collect(stmt.query_map([limit as i64], event_from_row)?);
            events
        })
        .await
    }

    async fn mark_event_delivered(&self, event_id: Uuid) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE job_events SET delivered = 1, attempts = attempts + 1, last_error = NULL
                 WHERE id = ?1",
                [event_id.to_string()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn record_delivery_failure(&self, event_id: Uuid, error: &str) -> StoreResult<bool> {
        let error = error.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE job_events SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
                params![event_id.to_string(), error],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn commit_step(&self, commit: &StepCommit) -> StoreResult<()> {
        let commit = commit.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            write_job(&tx, &commit.job, false)?;
            write_step(&tx, &commit.step)?;
            write_logs(&tx, &commit.logs)?;
            write_events(&tx, &commit.events)?;
            if let Some(checkpoint) = &commit.checkpoint {
                write_checkpoint(&tx, checkpoint)?;
            }
            for result in &commit.results {
                write_result(&tx, result)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn sequence_heads(&self, job_id: JobId) -> StoreResult<SequenceHeads> {
        self.with_conn(move |conn| {
            let id = job_id.to_string();
            let next_log: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence) + 1, 0) FROM execution_logs WHERE job_id = ?1",
                [&id],
                |row| row.get(0),
            )?;
            let next_event: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence) + 1, 0) FROM job_events WHERE job_id = ?1",
                [&id],
                |row| row.get(0),
            )?;
            Ok(SequenceHeads {
                next_log: next_log as u64,
                next_event: next_event as u64,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StepStatus;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn job() -> Job {
        Job::new("protein_mapping", "1.0", 2, BTreeMap::new())
    }

    fn checkpoint(job_id: JobId, step_index: usize, payload: Payload) -> ExecutionCheckpoint {
        ExecutionCheckpoint {
            id: CheckpointId::new(),
            job_id,
            step_index,
            kind: CheckpointKind::PostStep,
            created_at: Utc::now(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(5)),
            size_bytes: payload.stored_size(),
            payload,
            is_resumable: true,
        }
    }

    #[tokio::test]
    async fn test_job_round_trip() {
        let store = SqliteJobStore::in_memory().unwrap();
        let mut job = job().with_description("demo");
        store.create_job(&job).await.unwrap();

        job.transition_to(JobStatus::Running).unwrap();
        job.set_progress(1);
        store.update_job(&job).await.unwrap();

        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert_eq!(store.list_jobs(Some(JobStatus::Running)).await.unwrap().len(), 1);
        assert_eq!(store.list_jobs(None).await.unwrap().len(), 1);
        assert!(store.get_job(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_share_connection() {
        let store = std::sync::Arc::new(SqliteJobStore::in_memory().unwrap());
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create_job(&job()).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        assert_eq!(store.list_jobs(None).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_update_missing_job_is_not_found() {
        let store = SqliteJobStore::in_memory().unwrap();
        let err = store.update_job(&job()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_step_upsert_is_unique_per_index() {
        let store = SqliteJobStore::in_memory().unwrap();
        let job = job();
        store.create_job(&job).await.unwrap();

        let mut step = ExecutionStep::new(job.id, 0, "load", "load_identifiers");
        store.upsert_step(&step).await.unwrap();
        step.transition_to(StepStatus::Running).unwrap();
        step.retry_count = 2;
        store.upsert_step(&step).await.unwrap();

        let steps = store.list_steps(job.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].retry_count, 2);
        assert_eq!(store.get_step(job.id, 0).await.unwrap(), Some(step));
    }

    #[tokio::test]
    async fn test_checkpoints_and_expiry() {
        let store = SqliteJobStore::in_memory().unwrap();
        let id = JobId::new();
        let inline = checkpoint(id, 1, Payload::Inline { bytes: vec![1, 2, 3] });
        let external = checkpoint(
            id,
            2,
            Payload::External {
                location: "abc".into(),
                size_bytes: 99,
                compressed: true,
            },
        );
        store.save_checkpoint(&inline).await.unwrap();
        store.save_checkpoint(&external).await.unwrap();

        let listed = store.list_checkpoints(id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&inline));
        assert!(listed.contains(&external));

        let expired = store.list_expired_checkpoints(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 2);

        assert!(store.delete_checkpoint(inline.id).await.unwrap());
        assert!(!store.delete_checkpoint(inline.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_step_is_atomic() {
        let store = SqliteJobStore::in_memory().unwrap();
        let job = job();
        // The job row is missing, so the update fails and nothing is written.
        let commit = StepCommit {
            job: job.clone(),
            step: ExecutionStep::new(job.id, 0, "load", "x"),
            logs: vec![ExecutionLog {
                job_id: job.id,
                sequence: 0,
                level: LogLevel::Info,
                message: "m".into(),
                detail: Some(serde_json::json!({"a": 1})),
                step_index: Some(0),
                category: "step".into(),
                component: "test".into(),
                timestamp: Utc::now(),
            }],
            events: Vec::new(),
            checkpoint: None,
            results: Vec::new(),
        };
        assert!(store.commit_step(&commit).await.is_err());
        assert!(store.list_steps(job.id).await.unwrap().is_empty());
        assert!(store.list_logs(job.id).await.unwrap().is_empty());

        store.create_job(&job).await.unwrap();
        store.commit_step(&commit).await.unwrap();
        let logs = store.list_logs(job.id).await.unwrap();
        assert_eq!(logs, commit.logs);
        assert_eq!(
            store.sequence_heads(job.id).await.unwrap(),
            SequenceHeads { next_log: 1, next_event: 0 }
        );
    }

    #[tokio::test]
    async fn test_results_access_counting() {
        let store = SqliteJobStore::in_memory().unwrap();
        let id = JobId::new();
        let result = ResultStorage::inline_json(id, 1, "reconciled", "application/json", b"{}".to_vec());
        store.save_result(&result).await.unwrap();

        let first = store.read_result(id, 1, "reconciled").await.unwrap().unwrap();
        assert_eq!(first.access_count, 1);
        assert!(first.verify(b"{}"));
        let second = store.read_result(id, 1, "reconciled").await.unwrap().unwrap();
        assert_eq!(second.access_count, 2);
        assert_eq!(store.list_results(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_event_delivery() {
        let store = SqliteJobStore::in_memory().unwrap();
        let id = JobId::new();
        let events = vec![
            JobEvent::new(id, 0, JobEventKind::StatusChange, serde_json::json!({"to": "running"})),
            JobEvent::new(id, 1, JobEventKind::Complete, serde_json::json!({})),
        ];
        store.append_events(&events).await.unwrap();

        assert!(store.mark_event_delivered(events[0].id).await.unwrap());
        assert!(store.record_delivery_failure(events[1].id, "refused").await.unwrap());

        let pending = store.pending_events(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("refused"));

        let tail = store.list_events(id, 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].kind, JobEventKind::Complete);
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.db");
        let job = job();
        {
            let store = SqliteJobStore::open(&path).unwrap();
            store.create_job(&job).await.unwrap();
        }
        let store = SqliteJobStore::open(&path).unwrap();
        assert_eq!(store.get_job(job.id).await.unwrap(), Some(job));
    }
}
