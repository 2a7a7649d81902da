//! The run-state projection model.
//!
//! `RunState` is the materialized "current view" of a run, folded from its
//! event log by the projector. The persisted JSON document is a cache — the
//! log owns historical truth and a snapshot can always be rebuilt from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::EventData;
use crate::tool::{ToolRequest, ToolResult, ToolStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity & outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub tenant_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    Refusal,
}

/// Guardrail verdict recorded on the run when a detector fires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub status: Option<String>,
    pub reason: Option<String>,
    pub layer: Option<String>,
    pub threat_type: Option<String>,
}

/// One evidence chunk returned by the retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Value,
    pub text: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Materialized snapshot of a run, derived deterministically from the event
/// log prefix up to `last_applied_seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub mode: String,
    pub identity: Identity,

    /// Name of the pipeline node currently (or last) executing.
    pub phase: String,
    /// Payloads of every `decision.made` event, in order.
    pub decisions: Vec<EventData>,
    /// Set when the plan marks high-risk tool intent; gates finalization.
    #[serde(default)]
    pub requires_approval: bool,

    pub tool_requests: Vec<ToolRequest>,
    pub tool_results: Vec<ToolResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tool_status: Option<ToolStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_denied_reason: Option<String>,

    pub retrieved_chunks: Vec<RetrievedChunk>,
    pub sanitized_chunk_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<GuardrailVerdict>,

    pub output_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_reason: Option<String>,

    pub cost_spent: f64,
    pub cost_limit: f64,
    #[serde(default)]
    pub degraded: bool,

    /// Sequence number of the last event folded into this snapshot.
    /// Folding is idempotent: events at or below it are skipped.
    pub last_applied_seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            message: String::new(),
            context: None,
            mode: String::new(),
            identity: Identity::default(),
            phase: String::new(),
            decisions: Vec::new(),
            requires_approval: false,
            tool_requests: Vec::new(),
            tool_results: Vec::new(),
            requested_tool: None,
            last_tool_status: None,
            tool_denied_reason: None,
            retrieved_chunks: Vec::new(),
            sanitized_chunk_ids: Vec::new(),
            guardrail: None,
            output_text: String::new(),
            outcome: None,
            verification_reason: None,
            cost_spent: 0.0,
            cost_limit: 0.0,
            degraded: false,
            last_applied_seq: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether the retriever produced usable evidence. The respond adapter
    /// uses this to avoid fabricating citations.
    pub fn has_evidence(&self) -> bool {
        !self.retrieved_chunks.is_empty()
    }

    /// The most recent result for a given tool request, if any.
    pub fn tool_result(&self, request_id: &str) -> Option<&ToolResult> {
        self.tool_results
            .iter()
            .rev()
            .find(|r| r.request_id == request_id)
    }

    pub fn is_terminated(&self) -> bool {
        self.outcome.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_empty() {
        let state = RunState::new(Uuid::new_v4());
        assert!(!state.has_evidence());
        assert!(!state.is_terminated());
        assert_eq!(state.last_applied_seq, 0);
        assert!(state.output_text.is_empty());
    }

    #[test]
    fn tool_result_returns_latest_match() {
        let mut state = RunState::new(Uuid::new_v4());
        state.tool_results.push(ToolResult {
            request_id: "r1".into(),
            status: ToolStatus::Failed,
            output: None,
            error: Some("boom".into()),
            duration_ms: 3,
        });
        state.tool_results.push(ToolResult {
            request_id: "r1".into(),
            status: ToolStatus::Completed,
            output: Some(serde_json::json!({"result": 49})),
            error: None,
            duration_ms: 5,
        });
        let latest = state.tool_result("r1").unwrap();
        assert_eq!(latest.status, ToolStatus::Completed);
        assert!(state.tool_result("r2").is_none());
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut state = RunState::new(Uuid::new_v4());
        state.message = "what is strategy?".into();
        state.mode = "answer".into();
        state.identity = Identity {
            tenant_id: "acme".into(),
            user_id: "u1".into(),
        };
        state.outcome = Some(Outcome::Success);
        let json = serde_json::to_string(&state).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
