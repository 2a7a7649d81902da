use std::collections::HashMap;

use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// `GET /health` — liveness plus run counts by outcome.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    if let Ok(states) = state.services.projector.list() {
        for run in states {
            let key = match run.outcome {
                Some(rl_domain::run::Outcome::Success) => "success",
                Some(rl_domain::run::Outcome::Failed) => "failed",
                Some(rl_domain::run::Outcome::Refusal) => "refusal",
                None => "active",
            };
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    Json(serde_json::json!({
        "status": "ok",
        "runs": counts,
    }))
}
