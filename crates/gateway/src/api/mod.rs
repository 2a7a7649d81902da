pub mod health;
pub mod runs;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/runs", post(runs::start_run).get(runs::list_runs))
        .route("/runs/:id/events", get(runs::run_events_sse))
        .route("/runs/:id/state", get(runs::run_state))
        .route("/runs/:id/workflow", get(runs::run_workflow))
        .route("/runs/:id/approval", post(runs::record_approval))
        .route("/runs/:id/cancel", post(runs::cancel_run))
}
