pub mod health;
pub mod jobs;
pub mod targets;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws                       WebSocket broadcast server
/// /jobs/{id}                job record, cancel, queue
/// /targets/{id}/process     queue capture processing
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .nest("/jobs", jobs::router())
        .nest("/targets", targets::router())
}
