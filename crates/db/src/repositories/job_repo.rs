//! Repository for the `jobs` table.
//!
//! Uses `JobStatus` from `models::status` for every status literal.

use chrono::Utc;
use crackq_core::types::DbId;
use sqlx::PgPool;

use crate::models::job::{Job, NewAttackJob};
use crate::models::status::{JobStatus, StatusId};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, owner_id, target_id, wordlist_path, hash_mode, status_id, \
    progress_percent, progress_meta, depends_on, scheduled_at, \
    result, error_message, created_at, started_at, completed_at, updated_at";

/// Terminal statuses: completed, failed, cancelled.
const TERMINAL_STATUSES: [StatusId; 3] = [
    JobStatus::Completed as StatusId,
    JobStatus::Failed as StatusId,
    JobStatus::Cancelled as StatusId,
];

/// Provides reads and per-field updates for attack jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new job. Jobs with a future start are stored as scheduled.
    pub async fn create(pool: &PgPool, input: &NewAttackJob) -> Result<Job, sqlx::Error> {
        let status = match input.scheduled_at {
            Some(at) if at > Utc::now() => JobStatus::Scheduled,
            _ => JobStatus::Pending,
        };
        let query = format!(
            "INSERT INTO jobs \
                (owner_id, target_id, wordlist_path, hash_mode, status_id, depends_on, scheduled_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(input.owner_id)
            .bind(input.target_id)
            .bind(&input.wordlist_path)
            .bind(input.hash_mode)
            .bind(status.id())
            .bind(&input.depends_on)
            .bind(input.scheduled_at)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Current status only. Polled by the supervisor for cancellation.
    pub async fn status_of(pool: &PgPool, id: DbId) -> Result<Option<StatusId>, sqlx::Error> {
        sqlx::query_scalar("SELECT status_id FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Statuses for a set of jobs, used for dependency checks. Missing ids
    /// are simply absent from the result.
    pub async fn statuses_of(
        pool: &PgPool,
        ids: &[DbId],
    ) -> Result<Vec<(DbId, StatusId)>, sqlx::Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, (DbId, StatusId)>(
            "SELECT id, status_id FROM jobs WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(pool)
        .await
    }

    /// Transition a pending, scheduled or redelivered running job to running
    /// and reset its progress for a fresh attempt.
    ///
    /// Returns `false` if the job was concurrently cancelled or finished.
    pub async fn start(
        pool: &PgPool,
        id: DbId,
        meta: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $2, progress_percent = 0, progress_meta = $3, \
                 started_at = NOW(), completed_at = NULL, \
                 result = NULL, error_message = NULL \
             WHERE id = $1 AND status_id IN ($4, $5, $2)",
        )
        .bind(id)
        .bind(JobStatus::Running.id())
        .bind(meta)
        .bind(JobStatus::Pending.id())
        .bind(JobStatus::Scheduled.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write the progress columns only.
    pub async fn update_progress(
        pool: &PgPool,
        id: DbId,
        percent: f64,
        meta: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET progress_percent = $2, progress_meta = $3 WHERE id = $1")
            .bind(id)
            .bind(percent.clamp(0.0, 100.0))
            .bind(meta)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Mark a running job completed with its result payload.
    ///
    /// Returns `false` if the job is no longer running (e.g. cancelled while
    /// the ingestor was parsing).
    pub async fn complete(
        pool: &PgPool,
        id: DbId,
        result: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE jobs \
             SET status_id = $2, result = $3, completed_at = NOW(), progress_percent = 100 \
             WHERE id = $1 AND status_id = $4",
        )
        .bind(id)
        .bind(JobStatus::Completed.id())
        .bind(result)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Mark a non-terminal job failed with an error message.
    pub async fn fail(
        pool: &PgPool,
        id: DbId,
        error: &str,
        result: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE jobs \
             SET status_id = $2, error_message = $3, result = $4, completed_at = NOW() \
             WHERE id = $1 AND status_id NOT IN ($5, $6, $7)",
        )
        .bind(id)
        .bind(JobStatus::Failed.id())
        .bind(error)
        .bind(result)
        .bind(TERMINAL_STATUSES[0])
        .bind(TERMINAL_STATUSES[1])
        .bind(TERMINAL_STATUSES[2])
        .execute(pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Cancel a job if it is not already in a terminal state.
    ///
    /// Returns the status the job had just before cancellation, read under
    /// the same row lock, or `None` if it was already terminal or missing.
    /// Only the status flag and completion time are written; progress and
    /// result stay with their own writers.
    pub async fn cancel(pool: &PgPool, id: DbId) -> Result<Option<StatusId>, sqlx::Error> {
        sqlx::query_scalar(
            "UPDATE jobs AS j \
             SET status_id = $2, completed_at = NOW() \
             FROM (SELECT id, status_id FROM jobs WHERE id = $1 FOR UPDATE) AS prev \
             WHERE j.id = prev.id AND prev.status_id NOT IN ($3, $4, $5) \
             RETURNING prev.status_id",
        )
        .bind(id)
        .bind(JobStatus::Cancelled.id())
        .bind(TERMINAL_STATUSES[0])
        .bind(TERMINAL_STATUSES[1])
        .bind(TERMINAL_STATUSES[2])
        .fetch_optional(pool)
        .await
    }

    /// Write the result column only, leaving status untouched.
    pub async fn set_result(
        pool: &PgPool,
        id: DbId,
        result: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET result = $2 WHERE id = $1")
            .bind(id)
            .bind(result)
            .execute(pool)
            .await?;
        Ok(())
    }
}
