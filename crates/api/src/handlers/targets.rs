//! Handlers for the `/targets` resource.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use crackq_core::error::CoreError;
use crackq_core::types::DbId;
use crackq_db::models::queue::{LaneKind, NewQueueItem};
use crackq_db::models::status::TargetStatus;

use crate::error::{AppError, AppResult};
use crate::middleware::caller::Caller;
use crate::response::DataResponse;
use crate::state::AppState;

/// POST /api/v1/targets/{id}/process
///
/// Queue conversion of the target's raw capture. Returns 202 with the
/// queue item, or 409 while a conversion is already underway.
pub async fn process_capture(
    caller: Caller,
    State(state): State<AppState>,
    Path(target_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let target = state
        .store
        .find_target(target_id)
        .await?
        .filter(|t| t.owner_id == caller.user_id)
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Target",
            id: target_id,
        }))?;

    if target.capture_path.is_none() {
        return Err(AppError::BadRequest("Target has no raw capture".into()));
    }
    if target.status_id == TargetStatus::Processing.id() {
        return Err(AppError::Core(CoreError::Conflict(
            "Target is already being processed".into(),
        )));
    }

    let item = state
        .queue
        .enqueue(NewQueueItem {
            kind: LaneKind::CaptureProcessing,
            subject_id: target.id,
            owner_id: target.owner_id,
        })
        .await?;

    tracing::info!(target_id, queue_item_id = item.id, "Capture processing queued");

    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: item })))
}
