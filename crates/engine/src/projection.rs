//! Run-state projector: folds each persisted event into the run's snapshot
//! and writes the snapshot through to disk.
//!
//! The fold is deterministic and idempotent — `updated_at` comes from the
//! event timestamp, and events at or below `last_applied_seq` are skipped —
//! so replaying a log prefix into a fresh projector reproduces the stored
//! snapshot exactly.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use rl_domain::error::Result;
use rl_domain::event::{Event, EventType};
use rl_domain::run::{GuardrailVerdict, Outcome, RetrievedChunk, RunState};
use rl_domain::tool::{ToolRequest, ToolResult, ToolStatus};

use crate::store::atomic_write_json;

pub struct Projector {
    dir: PathBuf,
    states: RwLock<HashMap<Uuid, RunState>>,
}

impl Projector {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            states: RwLock::new(HashMap::new()),
        })
    }

    fn path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    /// Current snapshot, from cache or disk.
    pub fn get(&self, run_id: Uuid) -> Option<RunState> {
        if let Some(state) = self.states.read().get(&run_id) {
            return Some(state.clone());
        }
        let loaded = self.load(run_id)?;
        self.states.write().insert(run_id, loaded.clone());
        Some(loaded)
    }

    fn load(&self, run_id: Uuid) -> Option<RunState> {
        let content = std::fs::read_to_string(self.path(run_id)).ok()?;
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(%run_id, error = %e, "stale snapshot is unreadable; will rebuild");
                None
            }
        }
    }

    /// Make sure a (possibly empty) snapshot exists for the run.
    pub fn ensure(&self, run_id: Uuid) -> RunState {
        if let Some(state) = self.get(run_id) {
            return state;
        }
        let state = RunState::new(run_id);
        self.states.write().insert(run_id, state.clone());
        state
    }

    /// Fold one event into the snapshot and persist the result.
    /// Already-applied events (by seq) are a no-op.
    pub fn apply(&self, event: &Event) -> Result<RunState> {
        let mut states = self.states.write();
        let state = states
            .entry(event.run_id)
            .or_insert_with(|| self.load(event.run_id).unwrap_or_else(|| RunState::new(event.run_id)));

        if event.seq <= state.last_applied_seq {
            return Ok(state.clone());
        }
        fold(state, event);
        state.last_applied_seq = event.seq;
        state.updated_at = event.timestamp;

        atomic_write_json(&self.path(event.run_id), state)?;
        Ok(state.clone())
    }

    /// Every persisted snapshot (for the run listing API). Unreadable
    /// documents are skipped.
    pub fn list(&self) -> Result<Vec<RunState>> {
        let mut states = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(state) = serde_json::from_str::<RunState>(&content) {
                states.push(state);
            }
        }
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }

    /// Rebuild the snapshot from scratch out of a replayed history.
    pub fn rebuild(&self, run_id: Uuid, history: &[Event]) -> Result<RunState> {
        let mut state = RunState::new(run_id);
        for event in history {
            if event.seq <= state.last_applied_seq {
                continue;
            }
            fold(&mut state, event);
            state.last_applied_seq = event.seq;
            state.updated_at = event.timestamp;
        }
        atomic_write_json(&self.path(run_id), &state)?;
        self.states.write().insert(run_id, state.clone());
        Ok(state)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The fold table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn fold(state: &mut RunState, event: &Event) {
    let data = &event.data;
    let get_str = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_owned);

    match event.kind {
        EventType::RunStarted => {
            state.message = get_str("message").unwrap_or_default();
            state.context = get_str("context");
            state.mode = get_str("mode").unwrap_or_default();
            state.identity.tenant_id = get_str("tenant_id").unwrap_or_default();
            state.identity.user_id = get_str("user_id").unwrap_or_default();
            state.cost_limit = data
                .get("cost_limit")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
        }
        EventType::NodeStarted => {
            if let Some(name) = get_str("name") {
                state.phase = name;
            }
        }
        EventType::NodeCompleted => {
            if let Some(cost) = data.get("cost").and_then(Value::as_f64) {
                state.cost_spent += cost;
            }
            if let Some(reason) = get_str("verification_reason") {
                state.verification_reason = Some(reason);
            }
        }
        EventType::DecisionMade => {
            if data
                .get("needs_approval")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                state.requires_approval = true;
            }
            state.decisions.push(data.clone());
        }
        EventType::RetrievalCompleted => {
            if let Some(chunks) = data.get("chunks") {
                match serde_json::from_value::<Vec<RetrievedChunk>>(chunks.clone()) {
                    Ok(chunks) => state.retrieved_chunks = chunks,
                    Err(e) => tracing::warn!(error = %e, "unreadable retrieval payload"),
                }
            }
        }
        EventType::ContextSanitized => {
            if let Some(ids) = data.get("chunk_ids").and_then(Value::as_array) {
                state.sanitized_chunk_ids = ids
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect();
            }
        }
        EventType::ToolRequested => {
            state.requested_tool = get_str("tool_name");
            state.last_tool_status = Some(ToolStatus::Requested);
            match serde_json::from_value::<ToolRequest>(Value::Object(data.clone())) {
                Ok(request) => state.tool_requests.push(request),
                Err(e) => tracing::warn!(error = %e, "unreadable tool request payload"),
            }
        }
        EventType::ToolCompleted => {
            state.last_tool_status = Some(ToolStatus::Completed);
            state.tool_results.push(ToolResult {
                request_id: get_str("request_id").unwrap_or_default(),
                status: ToolStatus::Completed,
                output: data.get("output").cloned(),
                error: None,
                duration_ms: data
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            });
        }
        EventType::ToolFailed => {
            state.last_tool_status = Some(ToolStatus::Failed);
            state.tool_results.push(ToolResult {
                request_id: get_str("request_id").unwrap_or_default(),
                status: ToolStatus::Failed,
                output: None,
                // The result row carries the classified kind; the full
                // message stays in the event data.
                error: get_str("error_kind").or_else(|| get_str("error")),
                duration_ms: data
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            });
        }
        EventType::ToolDenied => {
            state.last_tool_status = Some(ToolStatus::Denied);
            state.tool_denied_reason = get_str("reason");
            state.tool_results.push(ToolResult {
                request_id: get_str("request_id").unwrap_or_default(),
                status: ToolStatus::Denied,
                output: None,
                error: get_str("reason"),
                duration_ms: 0,
            });
        }
        EventType::ToolServerError => {
            state.last_tool_status = Some(ToolStatus::ServerError);
        }
        EventType::GuardrailTriggered => {
            state.guardrail = Some(GuardrailVerdict {
                status: Some("triggered".into()),
                reason: get_str("reason"),
                layer: get_str("layer"),
                threat_type: get_str("threat_type"),
            });
            if data
                .get("blocking")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                state.outcome = Some(Outcome::Refusal);
            }
        }
        EventType::OutputChunk => {
            if let Some(text) = data.get("text").and_then(Value::as_str) {
                state.output_text.push_str(text);
            }
        }
        EventType::DegradedModeEntered => {
            state.degraded = true;
        }
        EventType::RunCompleted => {
            state.outcome = Some(parse_outcome(get_str("outcome")).unwrap_or(Outcome::Success));
            if let Some(reason) = get_str("verification_reason") {
                state.verification_reason = Some(reason);
            }
        }
        EventType::RunFailed => {
            // A blocking guardrail refusal keeps its outcome.
            let fallback = if state.outcome == Some(Outcome::Refusal) {
                Outcome::Refusal
            } else {
                Outcome::Failed
            };
            state.outcome = Some(parse_outcome(get_str("outcome")).unwrap_or(fallback));
            if let Some(reason) = get_str("verification_reason").or_else(|| get_str("reason")) {
                state.verification_reason = Some(reason);
            }
        }
        // Workflow bookkeeping and informational events leave the
        // snapshot untouched.
        EventType::RetrievalStarted
        | EventType::StatusChanged
        | EventType::ToolDiscovered
        | EventType::InjectionDetected
        | EventType::RateLimitExceeded
        | EventType::ErrorRaised
        | EventType::WorkflowStarted
        | EventType::WorkflowStepStarted
        | EventType::WorkflowStepCompleted
        | EventType::WorkflowRetrying
        | EventType::WorkflowWaitingForEvent
        | EventType::WorkflowWaitingForApproval
        | EventType::WorkflowApprovalRecorded
        | EventType::WorkflowCompleted
        | EventType::WorkflowFailed => {}
    }
}

fn parse_outcome(raw: Option<String>) -> Option<Outcome> {
    match raw.as_deref() {
        Some("success") => Some(Outcome::Success),
        Some("failed") => Some(Outcome::Failed),
        Some("refusal") => Some(Outcome::Refusal),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
