//! Backing-store traits consumed by the execution engine.
//!
//! The engine never talks to a pool directly; it holds an
//! `Arc<dyn Store>` so tests can substitute [`MemoryStore`](crate::memory::MemoryStore).

use async_trait::async_trait;
use crackq_core::types::DbId;

use crate::models::credential::{CrackedCredential, NewCredential};
use crate::models::job::{Job, JobResult, ProgressMetadata};
use crate::models::status::{StatusId, TargetStatus};
use crate::models::target::Target;
use crate::repositories::credential_repo::CredentialRepo;
use crate::repositories::job_repo::JobRepo;
use crate::repositories::target_repo::TargetRepo;
use crate::DbPool;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: DbId },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Job record access. Every update writes only its own columns.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_job(&self, id: DbId) -> StoreResult<Option<Job>>;

    async fn job_status(&self, id: DbId) -> StoreResult<Option<StatusId>>;

    /// Statuses for the given ids; missing jobs are omitted.
    async fn job_statuses(&self, ids: &[DbId]) -> StoreResult<Vec<(DbId, StatusId)>>;

    /// Move a startable job to running with progress reset to zero.
    /// Returns `false` when the job is no longer startable.
    async fn start_job(&self, id: DbId, meta: &ProgressMetadata) -> StoreResult<bool>;

    async fn update_progress(
        &self,
        id: DbId,
        percent: f64,
        meta: &ProgressMetadata,
    ) -> StoreResult<()>;

    /// Running -> completed. Returns `false` when the job is not running.
    async fn complete_job(&self, id: DbId, result: &JobResult) -> StoreResult<bool>;

    /// Non-terminal -> failed.
    async fn fail_job(&self, id: DbId, error: &str, result: &JobResult) -> StoreResult<bool>;

    /// Non-terminal -> cancelled (status flag only). Returns the status
    /// that was replaced, or `None` when the job was already terminal.
    async fn cancel_job(&self, id: DbId) -> StoreResult<Option<StatusId>>;

    /// Write the result payload without touching status.
    async fn set_job_result(&self, id: DbId, result: &JobResult) -> StoreResult<()>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn find_target(&self, id: DbId) -> StoreResult<Option<Target>>;

    async fn set_target_status(&self, id: DbId, status: TargetStatus) -> StoreResult<()>;

    async fn set_discovered_secret(&self, id: DbId, secret: &str) -> StoreResult<()>;

    /// Record a converted capture and mark the target ready.
    async fn set_artifact(&self, id: DbId, artifact_path: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Persist recovered credentials; returns how many rows were new.
    async fn insert_credentials(
        &self,
        job_id: DbId,
        target_id: DbId,
        entries: &[NewCredential],
        duration_secs: Option<i64>,
    ) -> StoreResult<u64>;

    async fn credentials_for_job(&self, job_id: DbId) -> StoreResult<Vec<CrackedCredential>>;
}

/// Everything the execution engine needs from the backing store.
pub trait Store: JobStore + TargetStore + CredentialStore {}

impl<T: JobStore + TargetStore + CredentialStore> Store for T {}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

/// [`Store`] backed by the repositories.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn find_job(&self, id: DbId) -> StoreResult<Option<Job>> {
        Ok(JobRepo::find_by_id(&self.pool, id).await?)
    }

    async fn job_status(&self, id: DbId) -> StoreResult<Option<StatusId>> {
        Ok(JobRepo::status_of(&self.pool, id).await?)
    }

    async fn job_statuses(&self, ids: &[DbId]) -> StoreResult<Vec<(DbId, StatusId)>> {
        Ok(JobRepo::statuses_of(&self.pool, ids).await?)
    }

    async fn start_job(&self, id: DbId, meta: &ProgressMetadata) -> StoreResult<bool> {
        let meta = serde_json::to_value(meta)?;
        Ok(JobRepo::start(&self.pool, id, &meta).await?)
    }

    async fn update_progress(
        &self,
        id: DbId,
        percent: f64,
        meta: &ProgressMetadata,
    ) -> StoreResult<()> {
        let meta = serde_json::to_value(meta)?;
        Ok(JobRepo::update_progress(&self.pool, id, percent, &meta).await?)
    }

    async fn complete_job(&self, id: DbId, result: &JobResult) -> StoreResult<bool> {
        let result = serde_json::to_value(result)?;
        Ok(JobRepo::complete(&self.pool, id, &result).await?)
    }

    async fn fail_job(&self, id: DbId, error: &str, result: &JobResult) -> StoreResult<bool> {
        let result = serde_json::to_value(result)?;
        Ok(JobRepo::fail(&self.pool, id, error, &result).await?)
    }

    async fn cancel_job(&self, id: DbId) -> StoreResult<Option<StatusId>> {
        Ok(JobRepo::cancel(&self.pool, id).await?)
    }

    async fn set_job_result(&self, id: DbId, result: &JobResult) -> StoreResult<()> {
        let result = serde_json::to_value(result)?;
        Ok(JobRepo::set_result(&self.pool, id, &result).await?)
    }
}

#[async_trait]
impl TargetStore for PgStore {
    async fn find_target(&self, id: DbId) -> StoreResult<Option<Target>> {
        Ok(TargetRepo::find_by_id(&self.pool, id).await?)
    }

    async fn set_target_status(&self, id: DbId, status: TargetStatus) -> StoreResult<()> {
        Ok(TargetRepo::set_status(&self.pool, id, status.id()).await?)
    }

    async fn set_discovered_secret(&self, id: DbId, secret: &str) -> StoreResult<()> {
        Ok(TargetRepo::set_discovered_secret(&self.pool, id, secret).await?)
    }

    async fn set_artifact(&self, id: DbId, artifact_path: &str) -> StoreResult<()> {
        Ok(TargetRepo::set_artifact(&self.pool, id, artifact_path).await?)
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn insert_credentials(
        &self,
        job_id: DbId,
        target_id: DbId,
        entries: &[NewCredential],
        duration_secs: Option<i64>,
    ) -> StoreResult<u64> {
        Ok(CredentialRepo::insert_many(&self.pool, job_id, target_id, entries, duration_secs).await?)
    }

    async fn credentials_for_job(&self, job_id: DbId) -> StoreResult<Vec<CrackedCredential>> {
        Ok(CredentialRepo::list_for_job(&self.pool, job_id).await?)
    }
}
