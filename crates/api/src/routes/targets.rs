use axum::routing::post;
use axum::Router;

use crate::handlers::targets;
use crate::state::AppState;

/// Routes mounted at `/targets`.
///
/// ```text
/// POST   /{id}/process    -> process_capture
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route("/{id}/process", post(targets::process_capture))
}
