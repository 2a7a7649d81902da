//! Run API endpoints.
//!
//! - `POST /runs`               — admit a run (optional `X-Run-Id` header)
//! - `GET  /runs`               — list run snapshots with filters
//! - `GET  /runs/:id/events`    — SSE: history then live, closes on terminal
//! - `GET  /runs/:id/state`     — current RunState snapshot
//! - `GET  /runs/:id/workflow`  — current WorkflowState
//! - `POST /runs/:id/approval`  — record a human decision
//! - `POST /runs/:id/cancel`    — cancel a running run

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use rl_domain::run::Outcome;
use rl_domain::workflow::ApprovalDecision;
use rl_engine::{AdmissionError, ControlError, StartRun};
use rl_eventlog::{EventLog, SubscriptionItem};

use crate::state::AppState;

/// Standardized JSON error response: `{ "error": "<message>" }`.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct StartRunBody {
    pub message: String,
    #[serde(default)]
    pub context: Option<String>,
    pub mode: String,
    pub identity: IdentityBody,
}

#[derive(Debug, Deserialize)]
pub struct IdentityBody {
    pub tenant_id: String,
    pub user_id: String,
}

pub async fn start_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StartRunBody>,
) -> Response {
    let run_id = match headers.get("x-run-id") {
        Some(raw) => match raw.to_str().ok().and_then(|s| s.parse::<Uuid>().ok()) {
            Some(id) => Some(id),
            None => {
                return api_error(StatusCode::BAD_REQUEST, "X-Run-Id must be a UUID");
            }
        },
        None => None,
    };

    let request = StartRun {
        run_id,
        message: body.message,
        context: body.context,
        mode: body.mode,
        identity: rl_domain::run::Identity {
            tenant_id: body.identity.tenant_id,
            user_id: body.identity.user_id,
        },
    };

    match state.coordinator.start_run(request).await {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "run_id": run_id })),
        )
            .into_response(),
        Err(AdmissionError::EmptyMessage) => {
            api_error(StatusCode::BAD_REQUEST, "message must not be empty")
        }
        Err(AdmissionError::AlreadyExists) => {
            api_error(StatusCode::CONFLICT, "run already exists")
        }
        Err(err @ AdmissionError::RateLimited { .. }) => {
            api_error(StatusCode::TOO_MANY_REQUESTS, err.to_string())
        }
        Err(AdmissionError::Internal(e)) => {
            tracing::error!(error = %e, "admission failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "admission failed")
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Response {
    let outcome = query.outcome.as_deref().and_then(parse_outcome);
    let states = match state.services.projector.list() {
        Ok(states) => states,
        Err(e) => {
            tracing::error!(error = %e, "listing runs failed");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "listing runs failed");
        }
    };

    let filter = |run: &&rl_domain::run::RunState| -> bool {
        if let Some(wanted) = outcome {
            if run.outcome != Some(wanted) {
                return false;
            }
        }
        if let Some(tenant) = query.tenant_id.as_deref() {
            if run.identity.tenant_id != tenant {
                return false;
            }
        }
        true
    };

    let total = states.iter().filter(filter).count();
    let limit = query.limit.min(200);
    let page: Vec<serde_json::Value> = states
        .iter()
        .filter(filter)
        .skip(query.offset)
        .take(limit)
        .map(|run| {
            // Lightweight list view.
            serde_json::json!({
                "run_id": run.run_id,
                "tenant_id": run.identity.tenant_id,
                "mode": run.mode,
                "phase": run.phase,
                "outcome": run.outcome,
                "degraded": run.degraded,
                "cost_spent": run.cost_spent,
                "updated_at": run.updated_at,
            })
        })
        .collect();

    Json(serde_json::json!({
        "runs": page,
        "total": total,
        "limit": limit,
        "offset": query.offset,
    }))
    .into_response()
}

fn parse_outcome(raw: &str) -> Option<Outcome> {
    match raw {
        "success" => Some(Outcome::Success),
        "failed" => Some(Outcome::Failed),
        "refusal" => Some(Outcome::Refusal),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /runs/:id/events (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_events_sse(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Response {
    let mut stream = match state.services.log.subscribe(run_id).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(%run_id, error = %e, "subscription failed");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "subscription failed");
        }
    };

    let sse = async_stream::stream! {
        while let Some(item) = futures_util::StreamExt::next(&mut stream).await {
            match item {
                SubscriptionItem::Event(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok::<_, std::convert::Infallible>(
                        SseEvent::default().event(event.kind.as_str()).data(data),
                    );
                    // The substrate closes after the terminal event; the
                    // loop simply drains to the end.
                }
                SubscriptionItem::Overflowed { skipped } => {
                    let warning = format!("{{\"warning\":\"missed {skipped} events\"}}");
                    yield Ok(SseEvent::default().event("warning").data(warning));
                    break;
                }
            }
        }
    };

    Sse::new(sse).keep_alive(KeepAlive::default()).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /runs/:id/state & /runs/:id/workflow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_state(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Response {
    match state.services.projector.get(run_id) {
        Some(run) => Json(serde_json::json!(run)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "run not found"),
    }
}

pub async fn run_workflow(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Response {
    match state.services.store.load(run_id) {
        Ok(Some(wf)) => Json(serde_json::json!(wf)).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "run not found"),
        Err(e) => {
            tracing::error!(%run_id, error = %e, "loading workflow failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "loading workflow failed")
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /runs/:id/approval & /runs/:id/cancel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ApprovalBody {
    pub decision: String,
}

pub async fn record_approval(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Json(body): Json<ApprovalBody>,
) -> Response {
    let decision = match body.decision.as_str() {
        "approved" => ApprovalDecision::Approved,
        "rejected" => ApprovalDecision::Rejected,
        other => {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("decision must be approved|rejected, got {other}"),
            );
        }
    };

    match state.coordinator.record_approval(run_id, decision).await {
        Ok(()) => Json(serde_json::json!({ "recorded": true })).into_response(),
        Err(e) => control_error(run_id, e),
    }
}

pub async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Response {
    match state.coordinator.cancel(run_id).await {
        Ok(()) => Json(serde_json::json!({ "cancelled": true })).into_response(),
        Err(e) => control_error(run_id, e),
    }
}

fn control_error(run_id: Uuid, err: ControlError) -> Response {
    match err {
        ControlError::NotFound => api_error(StatusCode::NOT_FOUND, "run not found"),
        ControlError::AlreadyTerminated => {
            api_error(StatusCode::CONFLICT, "run already terminated")
        }
        ControlError::Internal(e) => {
            tracing::error!(%run_id, error = %e, "control operation failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "operation failed")
        }
    }
}
