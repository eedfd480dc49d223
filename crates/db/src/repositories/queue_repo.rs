//! Repository for the `job_queue` table.
//!
//! Delivery is at-least-once: an item stays in the table from enqueue until
//! it is acked. A claim is a lease held by one lane router; it lapses unless
//! renewed, and only a lapsed claim can be taken over by another router.

use crackq_core::types::DbId;
use sqlx::PgPool;

use crate::models::queue::{LaneKind, NewQueueItem, QueueItem};

const COLUMNS: &str = "\
    id, kind, subject_id, owner_id, attempts, available_at, claimed_at, \
    claimed_by, lease_expires_at, created_at";

pub struct QueueRepo;

impl QueueRepo {
    pub async fn enqueue(pool: &PgPool, item: &NewQueueItem) -> Result<QueueItem, sqlx::Error> {
        let query = format!(
            "INSERT INTO job_queue (kind, subject_id, owner_id) \
             VALUES ($1, $2, $3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueItem>(&query)
            .bind(item.kind.as_str())
            .bind(item.subject_id)
            .bind(item.owner_id)
            .fetch_one(pool)
            .await
    }

    /// Claim the oldest available item of `kind` for `holder`, unless
    /// `max_in_flight` items of that kind are already under a live lease.
    ///
    /// The in-flight count and the claim happen under a transaction-scoped
    /// advisory lock keyed on the lane, so two dispatchers can never both
    /// see a free slot. `FOR UPDATE SKIP LOCKED` keeps claims of different
    /// items from blocking each other. Items whose lease lapsed count as
    /// free and are claimable again.
    pub async fn claim_next(
        pool: &PgPool,
        kind: LaneKind,
        max_in_flight: i64,
        holder: &str,
        lease_secs: f64,
    ) -> Result<Option<QueueItem>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;

        let in_flight: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_queue \
             WHERE kind = $1 AND claimed_at IS NOT NULL AND lease_expires_at > NOW()",
        )
        .bind(kind.as_str())
        .fetch_one(&mut *tx)
        .await?;

        if in_flight >= max_in_flight {
            tx.commit().await?;
            return Ok(None);
        }

        let query = format!(
            "UPDATE job_queue \
             SET claimed_at = NOW(), claimed_by = $2, \
                 lease_expires_at = NOW() + make_interval(secs => $3), \
                 attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM job_queue \
                 WHERE kind = $1 AND available_at <= NOW() \
                   AND (claimed_at IS NULL OR lease_expires_at <= NOW()) \
                 ORDER BY available_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        let item = sqlx::query_as::<_, QueueItem>(&query)
            .bind(kind.as_str())
            .bind(holder)
            .bind(lease_secs.max(0.0))
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(item)
    }

    /// Push the lease of a claimed item forward. Returns `false` when
    /// `holder` no longer holds the claim.
    pub async fn renew(
        pool: &PgPool,
        id: DbId,
        holder: &str,
        lease_secs: f64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE job_queue \
             SET lease_expires_at = NOW() + make_interval(secs => $3) \
             WHERE id = $1 AND claimed_by = $2 AND claimed_at IS NOT NULL",
        )
        .bind(id)
        .bind(holder)
        .bind(lease_secs.max(0.0))
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a finished item still claimed by `holder`.
    pub async fn ack(pool: &PgPool, id: DbId, holder: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = $1 AND claimed_by = $2")
            .bind(id)
            .bind(holder)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release an item claimed by `holder` so it becomes available again
    /// after `delay_secs`.
    pub async fn requeue(
        pool: &PgPool,
        id: DbId,
        holder: &str,
        delay_secs: f64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE job_queue \
             SET claimed_at = NULL, claimed_by = NULL, lease_expires_at = NULL, \
                 available_at = NOW() + make_interval(secs => $3) \
             WHERE id = $1 AND claimed_by = $2",
        )
        .bind(id)
        .bind(holder)
        .bind(delay_secs.max(0.0))
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
