//! Pre-execution gate for attack jobs.
//!
//! [`Gate::check`] is read-only apart from releasing the target of a job
//! cancelled before it started. [`Gate::admit`] performs the conditional
//! transition into running; if another actor got there first (typically a
//! cancel request) the job is never started.

use std::sync::Arc;

use chrono::Utc;
use crackq_core::scheduling::{evaluate_gate, state_machine, GateDecision};
use crackq_core::types::{DbId, Timestamp};
use crackq_db::models::job::{Job, ProgressMetadata};
use crackq_db::models::status::{StatusId, TargetStatus};
use crackq_db::store::{Store, StoreResult};

use super::progress::{Propagator, TrackedJob};

/// Result of [`Gate::check`].
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// All checks passed.
    Proceed(Job),
    /// No such job, or it belongs to someone other than the caller.
    NotFound,
    Cancelled,
    AlreadyFinished(StatusId),
    DependenciesUnmet {
        waiting: Vec<DbId>,
        failed: Vec<DbId>,
    },
    NotYetScheduled {
        at: Timestamp,
    },
}

/// Result of [`Gate::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The job is now running.
    Started(TrackedJob),
    /// Cancelled between the check and the transition.
    Cancelled,
    /// Some other actor already moved it to a terminal state.
    Finished(StatusId),
}

pub struct Gate {
    store: Arc<dyn Store>,
    propagator: Arc<Propagator>,
}

impl Gate {
    pub fn new(store: Arc<dyn Store>, propagator: Arc<Propagator>) -> Self {
        Self { store, propagator }
    }

    /// Decide whether `job_id` may start now on behalf of `caller`.
    pub async fn check(&self, job_id: DbId, caller: Option<DbId>) -> StoreResult<GateOutcome> {
        let Some(job) = self.store.find_job(job_id).await? else {
            return Ok(GateOutcome::NotFound);
        };
        if let Some(caller) = caller {
            if caller != job.owner_id {
                tracing::warn!(job_id, caller, "Job requested by a non-owner");
                return Ok(GateOutcome::NotFound);
            }
        }

        let known = self.store.job_statuses(&job.depends_on).await?;
        let dependencies: Vec<(DbId, Option<StatusId>)> = job
            .depends_on
            .iter()
            .map(|dep| {
                let status = known.iter().find(|(id, _)| id == dep).map(|(_, s)| *s);
                (*dep, status)
            })
            .collect();

        let decision = evaluate_gate(job.status_id, &dependencies, job.scheduled_at, Utc::now());
        Ok(match decision {
            GateDecision::Proceed => GateOutcome::Proceed(job),
            GateDecision::Cancelled => {
                self.release_target(&job).await;
                GateOutcome::Cancelled
            }
            GateDecision::AlreadyFinished(status) => GateOutcome::AlreadyFinished(status),
            GateDecision::DependenciesUnmet { waiting, failed } => {
                GateOutcome::DependenciesUnmet { waiting, failed }
            }
            GateDecision::NotYetScheduled { at } => GateOutcome::NotYetScheduled { at },
        })
    }

    /// Move a checked job into running and announce it.
    pub async fn admit(&self, job: &Job) -> StoreResult<Admission> {
        let meta = ProgressMetadata::stage("starting", "Starting attack");
        if !self.store.start_job(job.id, &meta).await? {
            return Ok(match self.store.job_status(job.id).await? {
                Some(state_machine::CANCELLED) | None => {
                    self.release_target(job).await;
                    Admission::Cancelled
                }
                Some(status) => Admission::Finished(status),
            });
        }

        self.store
            .set_target_status(job.target_id, TargetStatus::Processing)
            .await?;

        let started_at = self
            .store
            .find_job(job.id)
            .await?
            .and_then(|j| j.started_at)
            .unwrap_or_else(Utc::now);
        let tracked = TrackedJob {
            id: job.id,
            owner_id: job.owner_id,
            started_at: Some(started_at),
        };
        self.propagator
            .update(&tracked, state_machine::RUNNING, 0.0, meta, true)
            .await;

        tracing::info!(job_id = job.id, target_id = job.target_id, "Job started");
        Ok(Admission::Started(tracked))
    }

    async fn release_target(&self, job: &Job) {
        if let Err(e) = self
            .store
            .set_target_status(job.target_id, TargetStatus::Ready)
            .await
        {
            tracing::warn!(job_id = job.id, error = %e, "Failed to release target");
        }
    }
}
