//! Handlers for the `/jobs` resource.
//!
//! The caller comes from the `x-user-id` header. Jobs owned by someone
//! else are reported as not found.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use crackq_core::error::CoreError;
use crackq_core::scheduling::state_machine;
use crackq_core::types::DbId;
use crackq_db::models::job::{Job, ProgressMetadata};
use crackq_db::models::queue::{LaneKind, NewQueueItem};

use crate::engine::progress::TrackedJob;
use crate::error::{AppError, AppResult};
use crate::middleware::caller::Caller;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fetch a job by ID, treating another user's job as missing.
async fn find_owned(state: &AppState, job_id: DbId, caller: &Caller) -> AppResult<Job> {
    state
        .store
        .find_job(job_id)
        .await?
        .filter(|job| job.owner_id == caller.user_id)
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Job",
            id: job_id,
        }))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    caller: Caller,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = find_owned(&state, job_id, &caller).await?;
    Ok(Json(DataResponse { data: job }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel
///
/// Flips the status to cancelled. A running engine notices within one
/// poll interval; a job that never started gets its terminal update
/// broadcast here since no supervisor will.
pub async fn cancel_job(
    caller: Caller,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = find_owned(&state, job_id, &caller).await?;

    let Some(previous) = state.store.cancel_job(job_id).await? else {
        return Err(AppError::Core(CoreError::Conflict(
            "Job is already in a terminal state and cannot be cancelled".into(),
        )));
    };

    // A running job's supervisor owns its terminal broadcast. Decide from
    // the status the cancel actually replaced, not the earlier read.
    if previous != state_machine::RUNNING {
        state
            .propagator
            .finish(
                &TrackedJob::from(&job),
                state_machine::CANCELLED,
                job.progress_percent,
                ProgressMetadata::stage("cancelled", "Cancelled before start"),
            )
            .await;
    }

    tracing::info!(job_id, user_id = caller.user_id, "Job cancelled");

    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/queue
///
/// Put an existing job on the attack lane. Returns 202 with the queue item.
pub async fn queue_job(
    caller: Caller,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = find_owned(&state, job_id, &caller).await?;

    if state_machine::is_terminal(job.status_id) {
        return Err(AppError::Core(CoreError::Conflict(format!(
            "Job is already {}",
            state_machine::status_name(job.status_id)
        ))));
    }

    let item = state
        .queue
        .enqueue(NewQueueItem {
            kind: LaneKind::Attack,
            subject_id: job.id,
            owner_id: job.owner_id,
        })
        .await?;

    tracing::info!(job_id, queue_item_id = item.id, "Job queued");

    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: item })))
}
