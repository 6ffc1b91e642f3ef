//! Durable job and configuration storage on SQLite.
//!
//! The store is the single source of truth and the only place where
//! concurrent coordination happens. Claims run inside `BEGIN IMMEDIATE`
//! transactions so that no two workers can receive the same row; every
//! state-changing operation commits before returning.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use uuid::Uuid;

use crate::config;
use crate::error::{QueueError, Result};
use crate::job::{Job, JobSpec, JobState};

/// Captured output is capped before persisting so a chatty job cannot
/// bloat the database.
const MAX_OUTPUT_CHARS: usize = 10_000;
const MAX_ERROR_CHARS: usize = 2_000;

const BUSY_TIMEOUT_MS: u64 = 10_000;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS config (
        key   TEXT NOT NULL PRIMARY KEY,
        value TEXT NOT NULL
    ) STRICT;

    CREATE TABLE IF NOT EXISTS jobs (
        id          TEXT    NOT NULL PRIMARY KEY,
        command     TEXT    NOT NULL,
        state       TEXT    NOT NULL
                    CHECK (state IN ('pending','processing','completed','failed','dead')),
        attempts    INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        priority    INTEGER NOT NULL DEFAULT 0,
        run_at      TEXT    NOT NULL,
        next_run_at TEXT    NOT NULL,
        created_at  TEXT    NOT NULL,
        updated_at  TEXT    NOT NULL,
        exit_code   INTEGER,
        error       TEXT,
        stdout      TEXT,
        stderr      TEXT,
        claimed_by  TEXT,
        claimed_at  TEXT
    ) STRICT;

    -- Matches the claim query: eligible pending rows in dispatch order.
    CREATE INDEX IF NOT EXISTS idx_jobs_claim
        ON jobs (state, priority DESC, next_run_at ASC, created_at ASC);
    CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state);
    ";

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, priority, \
     run_at, next_run_at, created_at, updated_at, exit_code, error, stdout, stderr, \
     claimed_by, claimed_at";

/// Job counts per state, zero-filled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database at `path`. The parent
    /// directory is created when absent. Schema creation is a separate,
    /// idempotent step, see [`Store::init`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        Self::configure(&conn)?;
        Ok(Self { conn, path })
    }

    /// Open an existing database without write access. Used by the
    /// dashboard, which must not be able to mutate the store.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(Self { conn, path })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        // WAL lets readers proceed while one writer holds the lock.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the schema if absent. Safe to call repeatedly.
    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %self.path.display(), "database initialized");
        Ok(())
    }

    /// Insert a new pending job. Fails with `DuplicateId` when the id is
    /// taken and `InvalidInput` when the command is empty.
    pub fn enqueue(&self, spec: &JobSpec, now: DateTime<Utc>) -> Result<Job> {
        if spec.command.trim().is_empty() {
            return Err(QueueError::InvalidInput("command must not be empty".into()));
        }
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let max_retries = match spec.max_retries {
            Some(0) => {
                return Err(QueueError::InvalidInput("max_retries must be at least 1".into()))
            }
            Some(n) => n,
            None => config::get_u64(self, "max_retries")?.max(1) as u32,
        };
        let priority = spec.priority.unwrap_or(0);
        let run_at = spec.run_at.unwrap_or(now);
        let now_s = fmt_ts(now);
        let run_at_s = fmt_ts(run_at);

        let inserted = self.conn.execute(
            "INSERT INTO jobs
                 (id, command, state, attempts, max_retries, priority,
                  run_at, next_run_at, created_at, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5, ?5, ?6, ?6)",
            params![id, spec.command, max_retries, priority, run_at_s, now_s],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(QueueError::DuplicateId(id));
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(job_id = %id, "job enqueued");
        Ok(Job {
            id,
            command: spec.command.clone(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            priority,
            run_at,
            next_run_at: run_at,
            created_at: now,
            updated_at: now,
            exit_code: None,
            error: None,
            stdout: None,
            stderr: None,
            claimed_by: None,
            claimed_at: None,
        })
    }

    /// Atomically claim the most urgent eligible job for `worker_id`.
    ///
    /// Eligibility is `state = pending AND next_run_at <= now`; dispatch
    /// order is priority, then earliest `next_run_at`, then submission
    /// order, then id. The whole select-then-update runs in one immediate
    /// transaction, so concurrent claimers serialize on the write lock and
    /// never receive the same row.
    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let now_s = fmt_ts(now);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE state = 'pending' AND next_run_at <= ?1
                 ORDER BY priority DESC, next_run_at ASC, created_at ASC, id ASC
                 LIMIT 1",
                [&now_s],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = candidate else {
            return Ok(None);
        };

        let updated = tx.execute(
            "UPDATE jobs
             SET state = 'processing', claimed_by = ?1, claimed_at = ?2, updated_at = ?2
             WHERE id = ?3 AND state = 'pending'",
            params![worker_id, now_s, id],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [&id],
            row_to_job,
        )?;
        tx.commit()?;
        tracing::info!(job_id = %job.id, worker = %worker_id, "job claimed");
        Ok(Some(job))
    }

    /// Finalize a successful attempt: `processing -> completed`.
    pub fn complete(
        &mut self,
        id: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now_s = fmt_ts(now);
        let updated = self.conn.execute(
            "UPDATE jobs
             SET state = 'completed', attempts = attempts + 1, exit_code = ?1,
                 error = NULL, stdout = ?2, stderr = ?3,
                 claimed_by = NULL, claimed_at = NULL, updated_at = ?4
             WHERE id = ?5 AND state = 'processing'",
            params![
                exit_code,
                opt_text(stdout, MAX_OUTPUT_CHARS),
                opt_text(stderr, MAX_OUTPUT_CHARS),
                now_s,
                id
            ],
        )?;
        if updated == 0 {
            return Err(QueueError::NotFound(format!("no processing job with id {id}")));
        }
        tracing::info!(job_id = %id, "job completed");
        Ok(())
    }

    /// Finalize a failed attempt: retry with exponential backoff, or go
    /// dead once `attempts` reaches `max_retries`.
    ///
    /// The retry delay is `backoff_base ^ attempts` seconds (post-increment
    /// attempts), capped at the configured `backoff_max_delay`.
    /// `max_retries_override`, when given, replaces the job's own limit for
    /// this decision and is persisted.
    #[allow(clippy::too_many_arguments)]
    pub fn fail(
        &mut self,
        id: &str,
        exit_code: i32,
        error: &str,
        stdout: &str,
        stderr: &str,
        now: DateTime<Utc>,
        backoff_base: u32,
        max_retries_override: Option<u32>,
    ) -> Result<()> {
        if max_retries_override == Some(0) {
            return Err(QueueError::InvalidInput("max_retries must be at least 1".into()));
        }
        let max_delay = config::get_u64(self, "backoff_max_delay")?.max(1);
        let now_s = fmt_ts(now);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(u32, u32)> = tx
            .query_row(
                "SELECT attempts, max_retries FROM jobs WHERE id = ?1 AND state = 'processing'",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((prev_attempts, max_retries)) = row else {
            return Err(QueueError::NotFound(format!("no processing job with id {id}")));
        };
        let max_retries = max_retries_override.unwrap_or(max_retries);
        let attempts = prev_attempts + 1;
        let error = opt_text(error, MAX_ERROR_CHARS);
        let stdout = opt_text(stdout, MAX_OUTPUT_CHARS);
        let stderr = opt_text(stderr, MAX_OUTPUT_CHARS);

        if attempts >= max_retries {
            tx.execute(
                "UPDATE jobs
                 SET state = 'dead', attempts = ?1, max_retries = ?2, exit_code = ?3,
                     error = ?4, stdout = ?5, stderr = ?6,
                     claimed_by = NULL, claimed_at = NULL, updated_at = ?7
                 WHERE id = ?8",
                params![attempts, max_retries, exit_code, error, stdout, stderr, now_s, id],
            )?;
            tx.commit()?;
            tracing::warn!(job_id = %id, attempts, "job moved to dead-letter queue");
        } else {
            let delay_secs = backoff_delay(backoff_base, attempts, max_delay);
            let next_run_at = fmt_ts(now + Duration::seconds(delay_secs as i64));
            tx.execute(
                "UPDATE jobs
                 SET state = 'pending', attempts = ?1, max_retries = ?2, exit_code = ?3,
                     error = ?4, stdout = ?5, stderr = ?6, next_run_at = ?7,
                     claimed_by = NULL, claimed_at = NULL, updated_at = ?8
                 WHERE id = ?9",
                params![attempts, max_retries, exit_code, error, stdout, stderr, next_run_at, now_s, id],
            )?;
            tx.commit()?;
            tracing::info!(job_id = %id, attempts, delay_secs, "job retry scheduled");
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let job = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// List jobs, newest first, with optional state filter and pagination.
    pub fn list(&self, state: Option<JobState>, limit: u32, offset: u32) -> Result<Vec<Job>> {
        let jobs = match state {
            Some(state) => {
                let mut stmt = self.conn.prepare_cached(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt.query_map(params![state.to_string(), limit, offset], row_to_job)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = self.conn.prepare_cached(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt.query_map(params![limit, offset], row_to_job)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(jobs)
    }

    pub fn counts_by_state(&self) -> Result<StateCounts> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows: HashMap<String, u64> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        let count = |s: &str| rows.get(s).copied().unwrap_or(0);
        Ok(StateCounts {
            pending: count("pending"),
            processing: count("processing"),
            completed: count("completed"),
            failed: count("failed"),
            dead: count("dead"),
        })
    }

    pub fn dlq_list(&self, limit: u32, offset: u32) -> Result<Vec<Job>> {
        self.list(Some(JobState::Dead), limit, offset)
    }

    /// Move a dead job back to pending with a clean slate: attempts reset,
    /// captured output and failure details cleared, eligible immediately.
    pub fn dlq_retry(
        &mut self,
        id: &str,
        new_max_retries: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if new_max_retries == Some(0) {
            return Err(QueueError::InvalidInput("max_retries must be at least 1".into()));
        }
        let now_s = fmt_ts(now);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let state: Option<String> = tx
            .query_row("SELECT state FROM jobs WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        match state.as_deref() {
            None => return Err(QueueError::NotFound(format!("job {id} not found"))),
            Some("dead") => {}
            Some(other) => {
                return Err(QueueError::NotFound(format!(
                    "job {id} is not in the dead-letter queue (state: {other})"
                )))
            }
        }

        tx.execute(
            "UPDATE jobs
             SET state = 'pending', attempts = 0,
                 max_retries = COALESCE(?1, max_retries),
                 next_run_at = ?2, exit_code = NULL, error = NULL,
                 stdout = NULL, stderr = NULL,
                 claimed_by = NULL, claimed_at = NULL, updated_at = ?2
             WHERE id = ?3",
            params![new_max_retries, now_s, id],
        )?;
        tx.commit()?;
        tracing::info!(job_id = %id, "job requeued from dead-letter queue");
        Ok(())
    }

    /// Recover jobs orphaned in `processing` by a crashed worker.
    ///
    /// Every processing row claimed more than `older_than_secs` ago is
    /// finalized as a failed attempt with `error = "lease_expired"` and no
    /// exit code, then requeued (or moved to dead when retries are spent).
    /// Returns the number of leases released.
    pub fn release_expired_leases(
        &mut self,
        now: DateTime<Utc>,
        older_than_secs: u64,
    ) -> Result<usize> {
        let cutoff = fmt_ts(now - Duration::seconds(older_than_secs as i64));
        let now_s = fmt_ts(now);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let expired: Vec<(String, u32, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, attempts, max_retries FROM jobs
                 WHERE state = 'processing' AND claimed_at IS NOT NULL AND claimed_at < ?1",
            )?;
            let rows = stmt.query_map([&cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for (id, prev_attempts, max_retries) in &expired {
            let attempts = prev_attempts + 1;
            let next_state = if attempts >= *max_retries { "dead" } else { "pending" };
            tx.execute(
                "UPDATE jobs
                 SET state = ?1, attempts = ?2, exit_code = NULL,
                     error = 'lease_expired', next_run_at = ?3,
                     claimed_by = NULL, claimed_at = NULL, updated_at = ?3
                 WHERE id = ?4",
                params![next_state, attempts, now_s, id],
            )?;
            tracing::warn!(job_id = %id, next_state, "expired lease released");
        }
        tx.commit()?;
        Ok(expired.len())
    }

    /// Set a configuration key. Hyphenated keys are normalized to
    /// underscores; unknown keys are rejected.
    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let key = config::normalize_key(key);
        if !config::is_known(&key) {
            return Err(QueueError::InvalidInput(format!(
                "unknown config key '{key}' (valid keys: {})",
                config::known_keys().join(", ")
            )));
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Read a configuration key (hyphen or underscore form). Returns only
    /// what was stored; defaults live in [`crate::config`].
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = config::normalize_key(key);
        let value = self
            .conn
            .query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }
}

fn backoff_delay(base: u32, attempts: u32, cap_secs: u64) -> u64 {
    (base as u64)
        .checked_pow(attempts)
        .map(|d| d.min(cap_secs))
        .unwrap_or(cap_secs)
}

/// Fixed-width RFC 3339 UTC. The constant precision makes lexicographic
/// comparison in SQL equal chronological comparison.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn opt_ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let state: String = row.get(2)?;
    let state = state.parse::<JobState>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Job {
        id: row.get(0)?,
        command: row.get(1)?,
        state,
        attempts: row.get(3)?,
        max_retries: row.get(4)?,
        priority: row.get(5)?,
        run_at: ts_col(row, 6)?,
        next_run_at: ts_col(row, 7)?,
        created_at: ts_col(row, 8)?,
        updated_at: ts_col(row, 9)?,
        exit_code: row.get(10)?,
        error: row.get(11)?,
        stdout: row.get(12)?,
        stderr: row.get(13)?,
        claimed_by: row.get(14)?,
        claimed_at: opt_ts_col(row, 15)?,
    })
}

fn opt_text(s: &str, max_chars: usize) -> Option<&str> {
    if s.is_empty() {
        return None;
    }
    Some(truncate_chars(s, max_chars))
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
