//! SQLite backend.
//!
//! Leasing is optimistic: select the best due row, then flip it with an
//! `UPDATE ... RETURNING` that re-checks the due predicate. No row back means
//! another leaser won; retry a bounded number of times.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};

use super::{Storage, ensure_dead};
use crate::domain::{Job, JobId, JobRecord, JobState, timestamp};
use crate::error::{Result, SpindleError};

const MAX_LEASE_ATTEMPTS: usize = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 4;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        id              TEXT NOT NULL UNIQUE,
        command         TEXT NOT NULL,
        state           TEXT NOT NULL
                        CHECK (state IN ('pending', 'processing', 'completed', 'failed', 'dead')),
        attempts        INTEGER NOT NULL DEFAULT 0,
        max_retries     INTEGER NOT NULL,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL,
        run_at          TEXT NULL,
        next_attempt_at TEXT NULL,
        backoff_base    INTEGER NOT NULL,
        last_error      TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_next_attempt_at ON jobs (next_attempt_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_run_at ON jobs (run_at)",
    r#"
    CREATE TABLE IF NOT EXISTS dlq (
        seq      INTEGER PRIMARY KEY AUTOINCREMENT,
        id       TEXT NOT NULL UNIQUE,
        snapshot TEXT NOT NULL,
        moved_at TEXT NOT NULL
    )
    "#,
];

/// Same rule as `Job::is_due`, with `?1` bound to the lease instant.
const DUE_PREDICATE: &str = r#"
    (state = 'pending' AND (run_at IS NULL OR run_at <= ?1))
    OR (state = 'failed' AND attempts <= max_retries
        AND (next_attempt_at IS NULL OR next_attempt_at <= ?1))
"#;

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, \
                           run_at, next_attempt_at, backoff_base, last_error";

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database. One pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    async fn select_due(&self, at: &str) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE {DUE_PREDICATE}
             ORDER BY CASE WHEN state = 'pending' THEN COALESCE(run_at, created_at)
                           ELSE COALESCE(next_attempt_at, ?1) END,
                      seq
             LIMIT 1"
        );
        let row = sqlx::query(&sql).bind(at).fetch_optional(&self.pool).await?;
        row.map(|row| job_from_row(&row)).transpose()
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let state: String = row.try_get("state")?;
    let record = JobRecord {
        id: JobId::new(row.try_get::<String, _>("id")?),
        command: row.try_get("command")?,
        state: state.parse()?,
        attempts: to_u32(row.try_get("attempts")?, "attempts")?,
        max_retries: to_u32(row.try_get("max_retries")?, "max_retries")?,
        created_at: timestamp::parse(&row.try_get::<String, _>("created_at")?)?,
        updated_at: timestamp::parse(&row.try_get::<String, _>("updated_at")?)?,
        run_at: parse_opt(row.try_get("run_at")?)?,
        next_attempt_at: parse_opt(row.try_get("next_attempt_at")?)?,
        backoff_base: to_u32(row.try_get("backoff_base")?, "backoff_base")?,
        last_error: row.try_get("last_error")?,
    };
    Job::try_from(record)
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| SpindleError::Storage(format!("{column} out of range: {value}")))
}

fn parse_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp::parse).transpose()
}

fn format_opt(value: Option<DateTime<Utc>>) -> Option<String> {
    value.as_ref().map(timestamp::format)
}

#[async_trait]
impl Storage for SqliteStorage {
    #[instrument(skip_all, err)]
    async fn init(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job.id()))]
    async fn enqueue(&self, job: Job) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ))
        .bind(job.id().as_str())
        .bind(job.command())
        .bind(job.state().as_str())
        .bind(i64::from(job.attempts()))
        .bind(i64::from(job.max_retries()))
        .bind(timestamp::format(&job.created_at()))
        .bind(timestamp::format(&job.updated_at()))
        .bind(format_opt(job.run_at()))
        .bind(format_opt(job.next_attempt_at()))
        .bind(i64::from(job.backoff_base()))
        .bind(job.last_error())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(SpindleError::DuplicateJob(job.id().clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip_all, err, fields(job_id = %job.id()))]
    async fn update(&self, job: &Job) -> Result<()> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
               SET command = ?2, state = ?3, attempts = ?4, max_retries = ?5,
                   created_at = ?6, updated_at = ?7, run_at = ?8, next_attempt_at = ?9,
                   backoff_base = ?10, last_error = ?11
             WHERE id = ?1
            "#,
        )
        .bind(job.id().as_str())
        .bind(job.command())
        .bind(job.state().as_str())
        .bind(i64::from(job.attempts()))
        .bind(i64::from(job.max_retries()))
        .bind(timestamp::format(&job.created_at()))
        .bind(timestamp::format(&job.updated_at()))
        .bind(format_opt(job.run_at()))
        .bind(format_opt(job.next_attempt_at()))
        .bind(i64::from(job.backoff_base()))
        .bind(job.last_error())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(SpindleError::not_found(job.id()));
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job.id()))]
    async fn move_to_dlq(&self, job: &Job) -> Result<()> {
        ensure_dead(job)?;
        let snapshot = job.to_json()?;

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(job.id().as_str())
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(SpindleError::not_found(job.id()));
        }
        sqlx::query("INSERT OR REPLACE INTO dlq (id, snapshot, moved_at) VALUES (?1, ?2, ?3)")
            .bind(job.id().as_str())
            .bind(snapshot)
            .bind(timestamp::format(&job.updated_at()))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    #[instrument(skip_all, err)]
    async fn lease_next(&self, at: DateTime<Utc>) -> Result<Option<Job>> {
        let at_text = timestamp::format(&at);
        // Returns the row as claimed, not the snapshot it was selected from.
        let claim = format!(
            "UPDATE jobs SET state = 'processing', updated_at = ?1, next_attempt_at = NULL
              WHERE id = ?2 AND ({DUE_PREDICATE})
              RETURNING {JOB_COLUMNS}"
        );

        for attempt in 1..=MAX_LEASE_ATTEMPTS {
            let Some(candidate) = self.select_due(&at_text).await? else {
                return Ok(None);
            };

            let claimed = sqlx::query(&claim)
                .bind(&at_text)
                .bind(candidate.id().as_str())
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = claimed {
                return job_from_row(&row).map(Some);
            }
            debug!(job_id = %candidate.id(), attempt, "lost lease race, retrying");
        }

        warn!(attempts = MAX_LEASE_ATTEMPTS, "giving up on lease after repeated contention");
        Ok(None)
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows = match state {
            Some(state) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 ORDER BY seq"
                ))
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY seq"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    async fn list_dlq(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT snapshot FROM dlq ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Job::from_json(&row.try_get::<String, _>("snapshot")?))
            .collect()
    }

    async fn get_dlq(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT snapshot FROM dlq WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Job::from_json(&row.try_get::<String, _>("snapshot")?))
            .transpose()
    }

    #[instrument(skip_all, err, fields(job_id = %id))]
    async fn retry_from_dlq(&self, id: &JobId, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query("DELETE FROM dlq WHERE id = ?1 RETURNING snapshot")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        let mut job = Job::from_json(&row.try_get::<String, _>("snapshot")?)?;
        job.reset_for_retry(false, now)?;

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO jobs ({JOB_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ))
        .bind(job.id().as_str())
        .bind(job.command())
        .bind(job.state().as_str())
        .bind(i64::from(job.attempts()))
        .bind(i64::from(job.max_retries()))
        .bind(timestamp::format(&job.created_at()))
        .bind(timestamp::format(&job.updated_at()))
        .bind(format_opt(job.run_at()))
        .bind(format_opt(job.next_attempt_at()))
        .bind(i64::from(job.backoff_base()))
        .bind(job.last_error())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
