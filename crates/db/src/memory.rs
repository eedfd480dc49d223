//! In-process [`Store`](crate::store::Store) and [`JobQueue`] implementations.
//!
//! Used as test doubles for the external collaborators and for running the
//! engine without a database. State is lost on restart.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crackq_core::types::{DbId, Timestamp};
use tokio::sync::Mutex;

use crate::models::credential::{CrackedCredential, NewCredential};
use crate::models::job::{Job, JobResult, NewAttackJob, ProgressMetadata};
use crate::models::queue::{LaneKind, Lease, NewQueueItem, QueueItem};
use crate::models::status::{JobStatus, StatusId, TargetStatus};
use crate::models::target::{NewTarget, Target};
use crate::queue::JobQueue;
use crate::store::{CredentialStore, JobStore, StoreError, StoreResult, TargetStore};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    next_id: DbId,
    jobs: HashMap<DbId, Job>,
    targets: HashMap<DbId, Target>,
    credentials: Vec<CrackedCredential>,
    progress_writes: HashMap<DbId, usize>,
}

impl MemoryState {
    fn next_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }

    fn job_mut(&mut self, id: DbId) -> StoreResult<&mut Job> {
        self.jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "job", id })
    }

    fn target_mut(&mut self, id: DbId) -> StoreResult<&mut Target> {
        self.targets
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "target", id })
    }
}

fn is_terminal(status: StatusId) -> bool {
    JobStatus::from_id(status).is_some_and(JobStatus::is_terminal)
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_target(&self, input: NewTarget) -> Target {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let target = Target {
            id: state.next_id(),
            owner_id: input.owner_id,
            name: input.name,
            status_id: TargetStatus::Ready.id(),
            capture_path: input.capture_path,
            artifact_path: input.artifact_path,
            discovered_secret: None,
            created_at: now,
            updated_at: now,
        };
        state.targets.insert(target.id, target.clone());
        target
    }

    /// Insert a job; a future `scheduled_at` stores it as scheduled.
    pub async fn create_job(&self, input: NewAttackJob) -> Job {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let status = match input.scheduled_at {
            Some(at) if at > now => JobStatus::Scheduled,
            _ => JobStatus::Pending,
        };
        let job = Job {
            id: state.next_id(),
            owner_id: input.owner_id,
            target_id: input.target_id,
            wordlist_path: input.wordlist_path,
            hash_mode: input.hash_mode,
            status_id: status.id(),
            progress_percent: 0.0,
            progress_meta: serde_json::json!({}),
            depends_on: input.depends_on,
            scheduled_at: input.scheduled_at,
            result: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        state.jobs.insert(job.id, job.clone());
        job
    }

    /// Overwrite a job's status unconditionally.
    pub async fn force_job_status(&self, id: DbId, status: JobStatus) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        job.status_id = status.id();
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Number of `update_progress` calls seen for a job.
    pub async fn progress_writes(&self, id: DbId) -> usize {
        let state = self.state.lock().await;
        state.progress_writes.get(&id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn find_job(&self, id: DbId) -> StoreResult<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn job_status(&self, id: DbId) -> StoreResult<Option<StatusId>> {
        Ok(self.state.lock().await.jobs.get(&id).map(|j| j.status_id))
    }

    async fn job_statuses(&self, ids: &[DbId]) -> StoreResult<Vec<(DbId, StatusId)>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.jobs.get(id).map(|j| (*id, j.status_id)))
            .collect())
    }

    async fn start_job(&self, id: DbId, meta: &ProgressMetadata) -> StoreResult<bool> {
        let meta = serde_json::to_value(meta)?;
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        let startable = [
            JobStatus::Pending.id(),
            JobStatus::Scheduled.id(),
            JobStatus::Running.id(),
        ];
        if !startable.contains(&job.status_id) {
            return Ok(false);
        }
        let now = Utc::now();
        job.status_id = JobStatus::Running.id();
        job.progress_percent = 0.0;
        job.progress_meta = meta;
        job.started_at = Some(now);
        job.completed_at = None;
        job.result = None;
        job.error_message = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn update_progress(
        &self,
        id: DbId,
        percent: f64,
        meta: &ProgressMetadata,
    ) -> StoreResult<()> {
        let meta = serde_json::to_value(meta)?;
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        job.progress_percent = percent.clamp(0.0, 100.0);
        job.progress_meta = meta;
        job.updated_at = Utc::now();
        *state.progress_writes.entry(id).or_default() += 1;
        Ok(())
    }

    async fn complete_job(&self, id: DbId, result: &JobResult) -> StoreResult<bool> {
        let result = serde_json::to_value(result)?;
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        if job.status_id != JobStatus::Running.id() {
            return Ok(false);
        }
        let now = Utc::now();
        job.status_id = JobStatus::Completed.id();
        job.result = Some(result);
        job.progress_percent = 100.0;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn fail_job(&self, id: DbId, error: &str, result: &JobResult) -> StoreResult<bool> {
        let result = serde_json::to_value(result)?;
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        if is_terminal(job.status_id) {
            return Ok(false);
        }
        let now = Utc::now();
        job.status_id = JobStatus::Failed.id();
        job.error_message = Some(error.to_string());
        job.result = Some(result);
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn cancel_job(&self, id: DbId) -> StoreResult<Option<StatusId>> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        if is_terminal(job.status_id) {
            return Ok(None);
        }
        let previous = job.status_id;
        let now = Utc::now();
        job.status_id = JobStatus::Cancelled.id();
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(Some(previous))
    }

    async fn set_job_result(&self, id: DbId, result: &JobResult) -> StoreResult<()> {
        let result = serde_json::to_value(result)?;
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        job.result = Some(result);
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn find_target(&self, id: DbId) -> StoreResult<Option<Target>> {
        Ok(self.state.lock().await.targets.get(&id).cloned())
    }

    async fn set_target_status(&self, id: DbId, status: TargetStatus) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let target = state.target_mut(id)?;
        target.status_id = status.id();
        target.updated_at = Utc::now();
        Ok(())
    }

    async fn set_discovered_secret(&self, id: DbId, secret: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let target = state.target_mut(id)?;
        target.discovered_secret = Some(secret.to_string());
        target.updated_at = Utc::now();
        Ok(())
    }

    async fn set_artifact(&self, id: DbId, artifact_path: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let target = state.target_mut(id)?;
        target.artifact_path = Some(artifact_path.to_string());
        target.status_id = TargetStatus::Ready.id();
        target.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn insert_credentials(
        &self,
        job_id: DbId,
        target_id: DbId,
        entries: &[NewCredential],
        duration_secs: Option<i64>,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for entry in entries {
            let duplicate = state
                .credentials
                .iter()
                .any(|c| c.job_id == job_id && c.identifier == entry.identifier);
            if duplicate {
                continue;
            }
            let id = state.next_id();
            state.credentials.push(CrackedCredential {
                id,
                job_id,
                target_id,
                identifier: entry.identifier.clone(),
                secret: entry.secret.clone(),
                duration_secs,
                cracked_at: Utc::now(),
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn credentials_for_job(&self, job_id: DbId) -> StoreResult<Vec<CrackedCredential>> {
        let state = self.state.lock().await;
        Ok(state
            .credentials
            .iter()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    next_id: DbId,
    items: Vec<QueueItem>,
}

#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items of `kind` not yet acked, claimed or not.
    pub async fn pending(&self, kind: LaneKind) -> Vec<QueueItem> {
        let state = self.state.lock().await;
        state
            .items
            .iter()
            .filter(|i| i.kind == kind.as_str())
            .cloned()
            .collect()
    }
}

fn lease_live(item: &QueueItem, now: Timestamp) -> bool {
    item.claimed_at.is_some() && item.lease_expires_at.is_some_and(|t| t > now)
}

fn lease_end(now: Timestamp, duration: Duration) -> Timestamp {
    now + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, item: NewQueueItem) -> StoreResult<QueueItem> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let now = Utc::now();
        let item = QueueItem {
            id: state.next_id,
            kind: item.kind.as_str().to_string(),
            subject_id: item.subject_id,
            owner_id: item.owner_id,
            attempts: 0,
            available_at: now,
            claimed_at: None,
            claimed_by: None,
            lease_expires_at: None,
            created_at: now,
        };
        state.items.push(item.clone());
        Ok(item)
    }

    async fn dequeue(
        &self,
        kind: LaneKind,
        max_in_flight: usize,
        lease: &Lease,
    ) -> StoreResult<Option<QueueItem>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let in_flight = state
            .items
            .iter()
            .filter(|i| i.kind == kind.as_str() && lease_live(i, now))
            .count();
        if in_flight >= max_in_flight {
            return Ok(None);
        }
        let next = state
            .items
            .iter_mut()
            .filter(|i| i.kind == kind.as_str() && !lease_live(i, now) && i.available_at <= now)
            .min_by_key(|i| (i.available_at, i.id));
        Ok(next.map(|item| {
            item.claimed_at = Some(now);
            item.claimed_by = Some(lease.holder.clone());
            item.lease_expires_at = Some(lease_end(now, lease.duration));
            item.attempts += 1;
            item.clone()
        }))
    }

    async fn renew(&self, id: DbId, lease: &Lease) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let held = state.items.iter_mut().find(|i| {
            i.id == id && i.claimed_at.is_some() && i.claimed_by.as_deref() == Some(&lease.holder)
        });
        Ok(match held {
            Some(item) => {
                item.lease_expires_at = Some(lease_end(Utc::now(), lease.duration));
                true
            }
            None => false,
        })
    }

    async fn ack(&self, id: DbId, holder: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state
            .items
            .retain(|i| !(i.id == id && i.claimed_by.as_deref() == Some(holder)));
        Ok(state.items.len() < before)
    }

    async fn requeue(&self, id: DbId, holder: &str, delay: Duration) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let held = state
            .items
            .iter_mut()
            .find(|i| i.id == id && i.claimed_by.as_deref() == Some(holder));
        Ok(match held {
            Some(item) => {
                item.claimed_at = None;
                item.claimed_by = None;
                item.lease_expires_at = None;
                item.available_at = lease_end(Utc::now(), delay);
                true
            }
            None => false,
        })
    }
}
