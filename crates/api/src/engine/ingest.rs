//! Result ingestion and terminal job state.
//!
//! After the supervisor returns, [`Ingestor::finalize`] is the single
//! place that decides the job's final status. Recovered credentials are
//! what make a run successful; the exit code only decides whether an empty
//! result is a clean exhaustion or a failure.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use crackq_core::credentials::{parse_output, CrackedEntry};
use crackq_core::engine_args::HashMode;
use crackq_core::engine_output::{classify_exit, ExitKind};
use crackq_core::scheduling::state_machine;
use crackq_db::models::credential::NewCredential;
use crackq_db::models::job::{Job, JobResult, ProgressMetadata};
use crackq_db::models::status::{StatusId, TargetStatus};
use crackq_db::store::{Store, StoreResult};
use crackq_events::{EventBus, NotificationKind, NotificationRequest};
use serde_json::json;

use super::progress::{Propagator, TrackedJob};
use super::supervisor::{RunOutcome, SupervisorError};

/// Failure message recorded when a run is interrupted by server shutdown.
pub const SHUTDOWN_MESSAGE: &str = "server shutting down";

/// Parsed contents of an engine output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub results: Vec<CrackedEntry>,
    /// `false` only when the file exists but could not be read.
    pub success: bool,
}

/// Identifier width of a job's output lines. Unknown modes fall back to a
/// single field.
pub fn identifier_fields(job: &Job) -> usize {
    HashMode::from_selector(job.hash_mode)
        .map(HashMode::identifier_fields)
        .unwrap_or(1)
}

/// Read and parse an output file. A missing file is an empty result.
pub async fn parse(output_file: &Path, identifier_fields: usize) -> IngestReport {
    match tokio::fs::read(output_file).await {
        Ok(bytes) => IngestReport {
            results: parse_output(&String::from_utf8_lossy(&bytes), identifier_fields),
            success: true,
        },
        Err(e) if e.kind() == ErrorKind::NotFound => IngestReport {
            results: Vec::new(),
            success: true,
        },
        Err(e) => {
            tracing::warn!(path = %output_file.display(), error = %e, "Failed to read engine output");
            IngestReport {
                results: Vec::new(),
                success: false,
            }
        }
    }
}

pub struct Ingestor {
    store: Arc<dyn Store>,
    propagator: Arc<Propagator>,
    event_bus: Arc<EventBus>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, propagator: Arc<Propagator>, event_bus: Arc<EventBus>) -> Self {
        Self {
            store,
            propagator,
            event_bus,
        }
    }

    /// Settle a finished run and return the job's final status.
    pub async fn finalize(
        &self,
        job: &Job,
        tracked: &TrackedJob,
        run: Result<RunOutcome, SupervisorError>,
        output_file: &Path,
    ) -> StoreResult<StatusId> {
        let status = match run {
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Engine run failed");
                self.fail(job, tracked, &e.to_string(), true).await?
            }
            Ok(RunOutcome::Shutdown) => self.fail(job, tracked, SHUTDOWN_MESSAGE, false).await?,
            Ok(RunOutcome::Cancelled) => self.settle_cancelled(job, tracked, output_file).await?,
            Ok(RunOutcome::Exited { code, stderr_tail }) => {
                let report = parse(output_file, identifier_fields(job)).await;
                if !report.results.is_empty() {
                    self.settle_cracked(job, tracked, &report.results).await?
                } else if classify_exit(code) == ExitKind::Error {
                    let message = if stderr_tail.is_empty() {
                        match code {
                            Some(code) => format!("Engine exited with code {code}"),
                            None => "Engine terminated by signal".to_string(),
                        }
                    } else {
                        stderr_tail
                    };
                    self.fail(job, tracked, &message, true).await?
                } else {
                    self.settle_exhausted(job, tracked).await?
                }
            }
        };

        tracing::info!(
            job_id = job.id,
            status = state_machine::status_name(status),
            "Job finalized",
        );
        Ok(status)
    }

    async fn settle_cracked(
        &self,
        job: &Job,
        tracked: &TrackedJob,
        results: &[CrackedEntry],
    ) -> StoreResult<StatusId> {
        let inserted = self.record_credentials(job, tracked, results).await?;
        if let Some(first) = results.first() {
            self.store
                .set_discovered_secret(job.target_id, &first.secret)
                .await?;
        }
        self.store
            .set_target_status(job.target_id, TargetStatus::Ready)
            .await?;

        let result = JobResult {
            success: true,
            credential_count: results.len() as i64,
            error: None,
        };
        let status = if self.store.complete_job(job.id, &result).await? {
            state_machine::COMPLETED
        } else {
            // Cancelled while the engine was exiting; keep the credentials.
            self.store.set_job_result(job.id, &result).await?;
            self.current_status(job).await?
        };

        self.event_bus.notify(
            NotificationRequest::new(NotificationKind::AttackCracked, job.owner_id, job.id)
                .with_payload(json!({
                    "target_id": job.target_id,
                    "credential_count": results.len(),
                })),
        );

        let message = format!("Recovered {} credential(s)", results.len());
        tracing::info!(job_id = job.id, inserted, "Credentials recovered");
        self.finish(tracked, status, ProgressMetadata::stage("completed", message))
            .await;
        Ok(status)
    }

    async fn settle_exhausted(&self, job: &Job, tracked: &TrackedJob) -> StoreResult<StatusId> {
        self.store
            .set_target_status(job.target_id, TargetStatus::Ready)
            .await?;
        let result = JobResult {
            success: false,
            credential_count: 0,
            error: None,
        };
        let status = if self.store.complete_job(job.id, &result).await? {
            state_machine::COMPLETED
        } else {
            self.current_status(job).await?
        };
        self.finish(
            tracked,
            status,
            ProgressMetadata::stage("completed", "Keyspace exhausted without results"),
        )
        .await;
        Ok(status)
    }

    async fn settle_cancelled(
        &self,
        job: &Job,
        tracked: &TrackedJob,
        output_file: &Path,
    ) -> StoreResult<StatusId> {
        let report = parse(output_file, identifier_fields(job)).await;
        if !report.results.is_empty() {
            self.record_credentials(job, tracked, &report.results).await?;
            self.store
                .set_job_result(
                    job.id,
                    &JobResult {
                        success: true,
                        credential_count: report.results.len() as i64,
                        error: None,
                    },
                )
                .await?;
        }
        self.store
            .set_target_status(job.target_id, TargetStatus::Ready)
            .await?;

        let status = self.current_status(job).await?;
        self.finish(
            tracked,
            status,
            ProgressMetadata::stage("cancelled", "Cancelled by user"),
        )
        .await;
        Ok(status)
    }

    async fn fail(
        &self,
        job: &Job,
        tracked: &TrackedJob,
        message: &str,
        notify: bool,
    ) -> StoreResult<StatusId> {
        let result = JobResult {
            success: false,
            credential_count: 0,
            error: Some(message.to_string()),
        };
        let failed = self.store.fail_job(job.id, message, &result).await?;
        self.store
            .set_target_status(job.target_id, TargetStatus::Ready)
            .await?;

        let status = if failed {
            state_machine::FAILED
        } else {
            self.current_status(job).await?
        };

        if failed && notify {
            self.event_bus.notify(
                NotificationRequest::new(NotificationKind::AttackFailed, job.owner_id, job.id)
                    .with_payload(json!({
                        "target_id": job.target_id,
                        "error": message,
                    })),
            );
        }

        tracing::warn!(job_id = job.id, error = message, "Job failed");
        self.finish(tracked, status, ProgressMetadata::stage("failed", message))
            .await;
        Ok(status)
    }

    async fn record_credentials(
        &self,
        job: &Job,
        tracked: &TrackedJob,
        results: &[CrackedEntry],
    ) -> StoreResult<u64> {
        let credentials: Vec<NewCredential> = results
            .iter()
            .map(|entry| NewCredential {
                identifier: entry.identifier.clone(),
                secret: entry.secret.clone(),
            })
            .collect();
        let duration_secs = tracked
            .started_at
            .map(|started| (Utc::now() - started).num_seconds().max(0));
        self.store
            .insert_credentials(job.id, job.target_id, &credentials, duration_secs)
            .await
    }

    async fn current_status(&self, job: &Job) -> StoreResult<StatusId> {
        Ok(self
            .store
            .job_status(job.id)
            .await?
            .unwrap_or(state_machine::CANCELLED))
    }

    async fn finish(&self, tracked: &TrackedJob, status: StatusId, metadata: ProgressMetadata) {
        let percentage = if status == state_machine::COMPLETED {
            100.0
        } else {
            self.propagator
                .current_percentage(tracked.id)
                .await
                .unwrap_or(0.0)
        };
        self.propagator
            .finish(tracked, status, percentage, metadata)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_an_empty_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = parse(&dir.path().join("job-1.out"), 4).await;
        assert!(report.results.is_empty());
        assert!(report.success);
    }

    #[tokio::test]
    async fn skips_malformed_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("job-2.out");
        tokio::fs::write(
            &path,
            "garbage\nabc:short\nm1:ap:sta:lobby:secret1\n\nm2:ap:sta:lobby:secret2\n",
        )
        .await
        .expect("write");
        let report = parse(&path, 4).await;
        assert!(report.success);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].identifier, "m1:ap:sta:lobby");
        assert_eq!(report.results[0].secret, "secret1");
    }
}
