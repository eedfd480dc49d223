//! Durable queue trait and its PostgreSQL implementation.

use std::time::Duration;

use async_trait::async_trait;
use crackq_core::types::DbId;

use crate::models::queue::{LaneKind, Lease, NewQueueItem, QueueItem};
use crate::repositories::queue_repo::QueueRepo;
use crate::store::StoreResult;
use crate::DbPool;

/// At-least-once queue with a per-lane in-flight ceiling.
///
/// Claims are [`Lease`]s: the holder renews them while it works, and only
/// a claim whose lease lapsed (its holder died or stalled) is handed to
/// someone else.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, item: NewQueueItem) -> StoreResult<QueueItem>;

    /// Claim the next available item of `kind`, or `None` if the lane is
    /// empty or already has `max_in_flight` items under a live lease.
    async fn dequeue(
        &self,
        kind: LaneKind,
        max_in_flight: usize,
        lease: &Lease,
    ) -> StoreResult<Option<QueueItem>>;

    /// Extend a claim. `false` means the holder lost it.
    async fn renew(&self, id: DbId, lease: &Lease) -> StoreResult<bool>;

    /// Remove a claimed item for good. `false` if `holder` lost the claim.
    async fn ack(&self, id: DbId, holder: &str) -> StoreResult<bool>;

    /// Release a claimed item, available again after `delay`. `false` if
    /// `holder` lost the claim.
    async fn requeue(&self, id: DbId, holder: &str, delay: Duration) -> StoreResult<bool>;
}

#[derive(Clone)]
pub struct PgJobQueue {
    pool: DbPool,
}

impl PgJobQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, item: NewQueueItem) -> StoreResult<QueueItem> {
        Ok(QueueRepo::enqueue(&self.pool, &item).await?)
    }

    async fn dequeue(
        &self,
        kind: LaneKind,
        max_in_flight: usize,
        lease: &Lease,
    ) -> StoreResult<Option<QueueItem>> {
        let max = i64::try_from(max_in_flight).unwrap_or(i64::MAX);
        Ok(QueueRepo::claim_next(
            &self.pool,
            kind,
            max,
            &lease.holder,
            lease.duration.as_secs_f64(),
        )
        .await?)
    }

    async fn renew(&self, id: DbId, lease: &Lease) -> StoreResult<bool> {
        Ok(QueueRepo::renew(&self.pool, id, &lease.holder, lease.duration.as_secs_f64()).await?)
    }

    async fn ack(&self, id: DbId, holder: &str) -> StoreResult<bool> {
        Ok(QueueRepo::ack(&self.pool, id, holder).await?)
    }

    async fn requeue(&self, id: DbId, holder: &str, delay: Duration) -> StoreResult<bool> {
        Ok(QueueRepo::requeue(&self.pool, id, holder, delay.as_secs_f64()).await?)
    }
}
