//! The attack lane: gate, validate, run, ingest.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crackq_core::engine_args::{AttackInvocation, HashMode};
use crackq_core::path_safety::{validate, PathError, PathPolicy};
use crackq_core::types::DbId;
use crackq_db::models::job::Job;
use crackq_db::models::queue::QueueItem;
use crackq_db::models::status::TargetStatus;
use crackq_db::store::Store;
use crackq_events::EventBus;
use tokio_util::sync::CancellationToken;

use super::gate::{Admission, Gate, GateOutcome};
use super::ingest::Ingestor;
use super::lanes::{HandlerOutcome, LaneHandler};
use super::progress::{Propagator, RunProgress};
use super::supervisor::Supervisor;
use crate::config::{EngineConfig, LaneConfig};

/// Engine input extensions accepted for converted captures.
pub const HASH_EXTENSIONS: &[&str] = &["hc22000", "22000"];

/// Accepted wordlist extensions.
pub const WORDLIST_EXTENSIONS: &[&str] = &["txt", "dict", "lst", "pmk"];

/// Validated paths for one engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttackPaths {
    pub hash_file: PathBuf,
    pub wordlist: PathBuf,
    pub output_file: PathBuf,
    pub state_file: PathBuf,
}

/// Resolve and check every path an attack run will hand to the engine.
pub fn attack_paths(
    engine: &EngineConfig,
    job_id: DbId,
    hash_input: &str,
    wordlist: &str,
) -> Result<AttackPaths, PathError> {
    let output = PathPolicy::output(&engine.work_dir);
    Ok(AttackPaths {
        hash_file: validate(
            Path::new(hash_input),
            &PathPolicy::input(&engine.capture_dir, HASH_EXTENSIONS),
        )?,
        wordlist: validate(
            Path::new(wordlist),
            &PathPolicy::input(&engine.dictionary_dir, WORDLIST_EXTENSIONS),
        )?,
        output_file: validate(Path::new(&format!("job-{job_id}.out")), &output)?,
        state_file: validate(Path::new(&format!("job-{job_id}.pot")), &output)?,
    })
}

pub struct AttackLane {
    store: Arc<dyn Store>,
    engine: EngineConfig,
    dependency_retry: Duration,
    gate: Gate,
    supervisor: Supervisor,
    ingestor: Ingestor,
    propagator: Arc<Propagator>,
}

impl AttackLane {
    pub fn new(
        store: Arc<dyn Store>,
        propagator: Arc<Propagator>,
        event_bus: Arc<EventBus>,
        engine: &EngineConfig,
        lanes: &LaneConfig,
    ) -> Self {
        Self {
            gate: Gate::new(Arc::clone(&store), Arc::clone(&propagator)),
            supervisor: Supervisor::new(Arc::clone(&store), engine),
            ingestor: Ingestor::new(Arc::clone(&store), Arc::clone(&propagator), event_bus),
            store,
            engine: engine.clone(),
            dependency_retry: lanes.dependency_retry,
            propagator,
        }
    }

    async fn execute(&self, job: Job, shutdown: &CancellationToken) -> HandlerOutcome {
        let target = match self.store.find_target(job.target_id).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                tracing::error!(job_id = job.id, target_id = job.target_id, "Target not found");
                return HandlerOutcome::Done;
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to load target");
                return HandlerOutcome::Retry(self.dependency_retry);
            }
        };

        let Some(hash_input) = target.artifact_path.as_deref() else {
            if target.status_id == TargetStatus::Failed.id() {
                tracing::warn!(
                    job_id = job.id,
                    target_id = target.id,
                    "Capture processing failed, dropping attack",
                );
                return HandlerOutcome::Done;
            }
            tracing::info!(job_id = job.id, target_id = target.id, "Capture not processed yet");
            return HandlerOutcome::Retry(self.dependency_retry);
        };

        let hash_mode = match HashMode::from_selector(job.hash_mode) {
            Ok(mode) => mode,
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "Rejected attack job");
                return HandlerOutcome::Done;
            }
        };

        let paths = match attack_paths(&self.engine, job.id, hash_input, &job.wordlist_path) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "Rejected attack job path");
                return HandlerOutcome::Done;
            }
        };

        // A leftover output file from an earlier attempt would be ingested as ours.
        if let Err(e) = tokio::fs::remove_file(&paths.output_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(job_id = job.id, error = %e, "Failed to remove stale output file");
            }
        }

        let tracked = match self.gate.admit(&job).await {
            Ok(Admission::Started(tracked)) => tracked,
            Ok(Admission::Cancelled) => {
                tracing::info!(job_id = job.id, "Job cancelled before start");
                return HandlerOutcome::Done;
            }
            Ok(Admission::Finished(status)) => {
                tracing::info!(job_id = job.id, status, "Job already finished");
                return HandlerOutcome::Done;
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to start job");
                return HandlerOutcome::Retry(self.dependency_retry);
            }
        };

        let invocation = AttackInvocation {
            job_id: job.id,
            hash_mode,
            max_runtime_secs: self.engine.max_runtime_secs,
            status_timer_secs: self.engine.status_timer_secs,
            output_file: paths.output_file.clone(),
            state_file: paths.state_file,
            hash_file: paths.hash_file,
            wordlist: paths.wordlist,
        };

        let sink = RunProgress::new(Arc::clone(&self.propagator), tracked);
        let run = self
            .supervisor
            .run(job.id, invocation.to_args(), &sink, shutdown)
            .await;

        if let Err(e) = self
            .ingestor
            .finalize(&job, &tracked, run, &paths.output_file)
            .await
        {
            tracing::error!(job_id = job.id, error = %e, "Failed to finalize job");
        }
        HandlerOutcome::Done
    }
}

#[async_trait]
impl LaneHandler for AttackLane {
    async fn handle(&self, item: &QueueItem, shutdown: &CancellationToken) -> HandlerOutcome {
        let job_id = item.subject_id;
        let outcome = match self.gate.check(job_id, Some(item.owner_id)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Gate check failed");
                return HandlerOutcome::Retry(self.dependency_retry);
            }
        };

        match outcome {
            GateOutcome::Proceed(job) => self.execute(job, shutdown).await,
            GateOutcome::NotFound => {
                tracing::warn!(job_id, owner_id = item.owner_id, "Queued job not found");
                HandlerOutcome::Done
            }
            GateOutcome::Cancelled => {
                tracing::info!(job_id, "Job cancelled before start");
                HandlerOutcome::Done
            }
            GateOutcome::AlreadyFinished(status) => {
                tracing::info!(job_id, status, "Duplicate delivery of a finished job");
                HandlerOutcome::Done
            }
            GateOutcome::DependenciesUnmet { waiting, failed } => {
                if !failed.is_empty() {
                    tracing::warn!(job_id, ?failed, "Job depends on jobs that did not complete");
                }
                tracing::debug!(job_id, ?waiting, "Dependencies unmet, requeueing");
                HandlerOutcome::Retry(self.dependency_retry)
            }
            GateOutcome::NotYetScheduled { at } => {
                let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tracing::debug!(job_id, scheduled_at = %at, "Job not yet scheduled, requeueing");
                HandlerOutcome::Retry(delay)
            }
        }
    }
}
