//! Dual-rate progress propagation.
//!
//! Every sample for a running job passes through [`Propagator::update`],
//! which decides independently whether to persist it (slow rate) and
//! whether to broadcast it to WebSocket subscribers (fast rate). Per-job
//! throttle state lives in an explicit map and is evicted by
//! [`Propagator::finish`] when the job reaches a terminal state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crackq_core::engine_output::StatusSample;
use crackq_core::scheduling::state_machine;
use crackq_core::types::{DbId, Timestamp};
use crackq_db::models::job::{Job, ProgressMetadata};
use crackq_db::models::status::StatusId;
use crackq_db::store::Store;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::ThrottleConfig;
use crate::engine::supervisor::ProgressSink;
use crate::ws::{JobUpdate, WsManager};

/// The identity a propagated update needs for persistence and fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedJob {
    pub id: DbId,
    pub owner_id: DbId,
    pub started_at: Option<Timestamp>,
}

impl From<&Job> for TrackedJob {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            owner_id: job.owner_id,
            started_at: job.started_at,
        }
    }
}

/// What happened to one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Propagated {
    pub persisted: bool,
    /// Number of WebSocket deliveries, `None` when throttled.
    pub delivered: Option<usize>,
}

struct ThrottleState {
    last_persist: Option<Instant>,
    last_broadcast: Option<Instant>,
    persisted_percentage: Option<f64>,
    percentage: f64,
}

pub struct Propagator {
    store: Arc<dyn Store>,
    ws_manager: Arc<WsManager>,
    config: ThrottleConfig,
    jobs: Mutex<HashMap<DbId, ThrottleState>>,
}

impl Propagator {
    pub fn new(store: Arc<dyn Store>, ws_manager: Arc<WsManager>, config: ThrottleConfig) -> Self {
        Self {
            store,
            ws_manager,
            config,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Offer a progress update.
    ///
    /// Persists when `force` is set, when the percentage first reaches 0 or
    /// 100, or when the persist interval has elapsed since the last write.
    /// Broadcasts when `force` is set or the broadcast interval has elapsed.
    /// Unforced updates never lower the percentage; a forced 0 starts a
    /// fresh attempt.
    pub async fn update(
        &self,
        job: &TrackedJob,
        status: StatusId,
        percentage: f64,
        metadata: ProgressMetadata,
        force: bool,
    ) -> Propagated {
        let now = Instant::now();
        let (persist, broadcast, percentage) = {
            let mut jobs = self.jobs.lock().await;
            let state = jobs.entry(job.id).or_insert(ThrottleState {
                last_persist: None,
                last_broadcast: None,
                persisted_percentage: None,
                percentage: 0.0,
            });

            let mut percentage = percentage.clamp(0.0, 100.0);
            if !force {
                percentage = percentage.max(state.percentage);
            }
            state.percentage = percentage;

            let boundary = (percentage == 0.0 || percentage == 100.0)
                && state.persisted_percentage != Some(percentage);
            let persist = force
                || boundary
                || state
                    .last_persist
                    .is_none_or(|t| now.duration_since(t) >= self.config.persist_interval);
            let broadcast = force
                || state
                    .last_broadcast
                    .is_none_or(|t| now.duration_since(t) >= self.config.broadcast_interval);

            if persist {
                state.last_persist = Some(now);
                state.persisted_percentage = Some(percentage);
            }
            if broadcast {
                state.last_broadcast = Some(now);
            }
            (persist, broadcast, percentage)
        };

        let mut outcome = Propagated::default();

        if persist {
            match self.store.update_progress(job.id, percentage, &metadata).await {
                Ok(()) => outcome.persisted = true,
                Err(e) => {
                    tracing::warn!(job_id = job.id, error = %e, "Failed to persist job progress");
                }
            }
        }

        if broadcast {
            let completed_at = state_machine::is_terminal(status).then(Utc::now);
            let update = JobUpdate {
                id: job.id,
                owner_id: Some(job.owner_id),
                status: state_machine::status_name(status).to_string(),
                percentage,
                metadata,
                started_at: job.started_at,
                completed_at,
                timestamp: Utc::now(),
            };
            outcome.delivered = Some(self.ws_manager.broadcast_job_update(&update).await);
        }

        outcome
    }

    /// Force out the terminal update and drop the job's throttle state.
    pub async fn finish(
        &self,
        job: &TrackedJob,
        status: StatusId,
        percentage: f64,
        metadata: ProgressMetadata,
    ) -> Propagated {
        let outcome = self.update(job, status, percentage, metadata, true).await;
        self.jobs.lock().await.remove(&job.id);
        outcome
    }

    /// Last percentage seen for a job still being tracked.
    pub async fn current_percentage(&self, job_id: DbId) -> Option<f64> {
        self.jobs.lock().await.get(&job_id).map(|s| s.percentage)
    }

    /// Number of jobs with live throttle state.
    pub async fn tracked_jobs(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

/// Feeds a supervisor's parsed samples for one job into the propagator.
pub struct RunProgress {
    propagator: Arc<Propagator>,
    job: TrackedJob,
}

impl RunProgress {
    pub fn new(propagator: Arc<Propagator>, job: TrackedJob) -> Self {
        Self { propagator, job }
    }
}

/// Progress metadata for a parsed engine status block.
pub fn sample_metadata(sample: &StatusSample) -> ProgressMetadata {
    ProgressMetadata {
        stage: "running".into(),
        message: sample.describe(),
        eta_secs: sample.eta_secs,
        speed_hps: sample.throughput.as_ref().map(|t| t.hashes_per_sec),
        speed_display: sample.throughput.as_ref().map(|t| t.display()),
        recovered: sample.recovered,
        recovered_total: sample.recovered_total,
    }
}

#[async_trait]
impl ProgressSink for RunProgress {
    async fn sample(&self, sample: StatusSample) {
        // Blocks without a progress line keep the last known percentage.
        let percentage = sample.percentage.unwrap_or(0.0);
        self.propagator
            .update(
                &self.job,
                state_machine::RUNNING,
                percentage,
                sample_metadata(&sample),
                false,
            )
            .await;
    }
}
