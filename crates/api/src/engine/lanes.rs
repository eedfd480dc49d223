//! Per-kind worker pools over the durable queue.
//!
//! Each lane runs a fixed number of workers that poll the queue for items
//! of its kind every `poll_interval`, hand them to the lane's handler, and
//! then ack or requeue them. The attack lane always runs with exactly one
//! worker and one in-flight item.
//!
//! Claims are leases owned by this router's holder id. A worker renews its
//! lease while the handler runs; an item whose lease lapses (its holder
//! died or stalled) becomes claimable by any router on the same queue. A
//! worker that finds its lease gone stops the handler the same way a
//! shutdown would.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crackq_db::models::queue::{LaneKind, Lease, QueueItem};
use crackq_db::queue::JobQueue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// What the router should do with an item after its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Remove the item from the queue.
    Done,
    /// Put the item back, claimable again after the delay.
    Retry(Duration),
}

/// Processes one claimed queue item.
#[async_trait]
pub trait LaneHandler: Send + Sync {
    async fn handle(&self, item: &QueueItem, shutdown: &CancellationToken) -> HandlerOutcome;
}

struct Lane {
    kind: LaneKind,
    concurrency: usize,
    handler: Arc<dyn LaneHandler>,
}

pub struct LaneRouter {
    queue: Arc<dyn JobQueue>,
    poll_interval: Duration,
    lease: Lease,
    lanes: Vec<Lane>,
}

impl LaneRouter {
    /// Create a router with a fresh holder id. `lease` is how long a claim
    /// stays valid without renewal.
    pub fn new(queue: Arc<dyn JobQueue>, poll_interval: Duration, lease: Duration) -> Self {
        Self {
            queue,
            poll_interval,
            lease: Lease::new(uuid::Uuid::new_v4().to_string(), lease),
            lanes: Vec::new(),
        }
    }

    /// Holder id written on every claim this router makes.
    pub fn holder(&self) -> &str {
        &self.lease.holder
    }

    /// Register a lane. Concurrency is clamped to at least 1, and the attack
    /// lane is always pinned to exactly 1.
    pub fn with_lane(
        mut self,
        kind: LaneKind,
        concurrency: usize,
        handler: Arc<dyn LaneHandler>,
    ) -> Self {
        let concurrency = match kind {
            LaneKind::Attack if concurrency != 1 => {
                tracing::warn!(requested = concurrency, "Attack lane concurrency pinned to 1");
                1
            }
            _ => concurrency.max(1),
        };
        self.lanes.push(Lane {
            kind,
            concurrency,
            handler,
        });
        self
    }

    /// Registered lanes with their effective concurrency.
    pub fn lanes(&self) -> Vec<(LaneKind, usize)> {
        self.lanes.iter().map(|l| (l.kind, l.concurrency)).collect()
    }

    /// Run every lane until the token is cancelled and all in-progress
    /// items have been handed back.
    pub async fn run(self, cancel: CancellationToken) {
        let mut workers = JoinSet::new();

        for lane in self.lanes {
            tracing::info!(
                lane = %lane.kind,
                concurrency = lane.concurrency,
                holder = %self.lease.holder,
                poll_interval_ms = self.poll_interval.as_millis() as u64,
                lease_ms = self.lease.duration.as_millis() as u64,
                "Lane started",
            );

            for worker in 0..lane.concurrency {
                workers.spawn(run_worker(
                    Worker {
                        queue: Arc::clone(&self.queue),
                        kind: lane.kind,
                        max_in_flight: lane.concurrency,
                        handler: Arc::clone(&lane.handler),
                        lease: self.lease.clone(),
                        worker,
                    },
                    self.poll_interval,
                    cancel.clone(),
                ));
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Lane worker panicked");
            }
        }
        tracing::info!("All lanes stopped");
    }
}

struct Worker {
    queue: Arc<dyn JobQueue>,
    kind: LaneKind,
    max_in_flight: usize,
    handler: Arc<dyn LaneHandler>,
    lease: Lease,
    worker: usize,
}

async fn run_worker(w: Worker, poll_interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(lane = %w.kind, worker = w.worker, "Lane worker shutting down");
                break;
            }
            _ = ticker.tick() => {}
        }

        // Drain everything claimable before waiting for the next tick.
        while !cancel.is_cancelled() {
            let item = match w.queue.dequeue(w.kind, w.max_in_flight, &w.lease).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(lane = %w.kind, error = %e, "Dequeue failed");
                    break;
                }
            };

            tracing::debug!(
                lane = %w.kind,
                worker = w.worker,
                item_id = item.id,
                subject_id = item.subject_id,
                attempts = item.attempts,
                "Item claimed",
            );

            let outcome = handle_leased(&w, &item, &cancel).await;
            let settled = match outcome {
                HandlerOutcome::Done => w.queue.ack(item.id, &w.lease.holder).await,
                HandlerOutcome::Retry(delay) => {
                    w.queue.requeue(item.id, &w.lease.holder, delay).await
                }
            };
            match settled {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(lane = %w.kind, item_id = item.id, "Queue item no longer held, not settled");
                }
                Err(e) => {
                    tracing::error!(lane = %w.kind, item_id = item.id, error = %e, "Failed to settle queue item");
                }
            }
        }
    }
}

/// Run the handler while renewing the item's lease every third of its
/// duration. Losing the lease cancels the handler's token.
async fn handle_leased(w: &Worker, item: &QueueItem, cancel: &CancellationToken) -> HandlerOutcome {
    let run = cancel.child_token();
    let handled = w.handler.handle(item, &run);
    tokio::pin!(handled);

    let period = (w.lease.duration / 3).max(Duration::from_millis(10));
    let mut renewals = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut held = true;

    loop {
        tokio::select! {
            outcome = &mut handled => return outcome,
            _ = renewals.tick(), if held => {
                match w.queue.renew(item.id, &w.lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::error!(
                            lane = %w.kind,
                            item_id = item.id,
                            holder = %w.lease.holder,
                            "Lease lost, stopping handler",
                        );
                        held = false;
                        run.cancel();
                    }
                    Err(e) => {
                        tracing::warn!(lane = %w.kind, item_id = item.id, error = %e, "Lease renewal failed");
                    }
                }
            }
        }
    }
}
