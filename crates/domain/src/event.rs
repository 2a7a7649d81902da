//! The event envelope and the closed event vocabulary.
//!
//! Events are the system's source of truth: immutable, sequenced per run,
//! persisted before they are broadcast. Everything else (run snapshots,
//! workflow records) is a cache derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque string-keyed payload. Schema is fixed per event type by
/// convention, not by the envelope.
pub type EventData = serde_json::Map<String, Value>;

/// Build an [`EventData`] map from a `serde_json::json!` object literal.
/// Non-object values yield an empty map.
pub fn payload(value: Value) -> EventData {
    match value {
        Value::Object(map) => map,
        _ => EventData::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An immutable, sequenced fact about a run.
///
/// `seq` starts at 1 and is gap-free per `run_id`. Field order is part of
/// the wire contract: `seq` serializes before `data` (the distributed
/// transport patches `seq` into the first occurrence in the serialized
/// envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub run_id: Uuid,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub data: EventData,
}

impl Event {
    /// Convenience accessor for a string field in `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event vocabulary (closed set)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "node.started")]
    NodeStarted,
    #[serde(rename = "node.completed")]
    NodeCompleted,
    #[serde(rename = "status.changed")]
    StatusChanged,
    #[serde(rename = "decision.made")]
    DecisionMade,
    #[serde(rename = "output.chunk")]
    OutputChunk,
    #[serde(rename = "retrieval.started")]
    RetrievalStarted,
    #[serde(rename = "retrieval.completed")]
    RetrievalCompleted,
    #[serde(rename = "tool.discovered")]
    ToolDiscovered,
    #[serde(rename = "tool.requested")]
    ToolRequested,
    #[serde(rename = "tool.completed")]
    ToolCompleted,
    #[serde(rename = "tool.failed")]
    ToolFailed,
    #[serde(rename = "tool.denied")]
    ToolDenied,
    #[serde(rename = "tool.server.error")]
    ToolServerError,
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.step.started")]
    WorkflowStepStarted,
    #[serde(rename = "workflow.step.completed")]
    WorkflowStepCompleted,
    #[serde(rename = "workflow.retrying")]
    WorkflowRetrying,
    #[serde(rename = "workflow.waiting_for_event")]
    WorkflowWaitingForEvent,
    #[serde(rename = "workflow.waiting_for_approval")]
    WorkflowWaitingForApproval,
    #[serde(rename = "workflow.approval.recorded")]
    WorkflowApprovalRecorded,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "guardrail.triggered")]
    GuardrailTriggered,
    #[serde(rename = "context.sanitized")]
    ContextSanitized,
    #[serde(rename = "injection.detected")]
    InjectionDetected,
    #[serde(rename = "rate.limit.exceeded")]
    RateLimitExceeded,
    #[serde(rename = "degraded.mode.entered")]
    DegradedModeEntered,
    #[serde(rename = "error.raised")]
    ErrorRaised,
}

impl EventType {
    /// The dotted wire name, identical to the serde rename.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::NodeStarted => "node.started",
            Self::NodeCompleted => "node.completed",
            Self::StatusChanged => "status.changed",
            Self::DecisionMade => "decision.made",
            Self::OutputChunk => "output.chunk",
            Self::RetrievalStarted => "retrieval.started",
            Self::RetrievalCompleted => "retrieval.completed",
            Self::ToolDiscovered => "tool.discovered",
            Self::ToolRequested => "tool.requested",
            Self::ToolCompleted => "tool.completed",
            Self::ToolFailed => "tool.failed",
            Self::ToolDenied => "tool.denied",
            Self::ToolServerError => "tool.server.error",
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowStepStarted => "workflow.step.started",
            Self::WorkflowStepCompleted => "workflow.step.completed",
            Self::WorkflowRetrying => "workflow.retrying",
            Self::WorkflowWaitingForEvent => "workflow.waiting_for_event",
            Self::WorkflowWaitingForApproval => "workflow.waiting_for_approval",
            Self::WorkflowApprovalRecorded => "workflow.approval.recorded",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::GuardrailTriggered => "guardrail.triggered",
            Self::ContextSanitized => "context.sanitized",
            Self::InjectionDetected => "injection.detected",
            Self::RateLimitExceeded => "rate.limit.exceeded",
            Self::DegradedModeEntered => "degraded.mode.entered",
            Self::ErrorRaised => "error.raised",
        }
    }

    /// Terminal events end a run; subscriptions close after observing one.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RunCompleted | Self::RunFailed)
    }

    /// The three events that resolve a tool request. For a given
    /// `request_id` exactly one of these is ever emitted.
    pub fn is_tool_terminator(self) -> bool {
        matches!(self, Self::ToolCompleted | Self::ToolFailed | Self::ToolDenied)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for kind in [
            EventType::RunStarted,
            EventType::ToolServerError,
            EventType::WorkflowWaitingForApproval,
            EventType::RateLimitExceeded,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: EventType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn terminal_predicate() {
        assert!(EventType::RunCompleted.is_terminal());
        assert!(EventType::RunFailed.is_terminal());
        assert!(!EventType::WorkflowCompleted.is_terminal());
        assert!(!EventType::OutputChunk.is_terminal());
    }

    #[test]
    fn tool_terminators() {
        assert!(EventType::ToolCompleted.is_tool_terminator());
        assert!(EventType::ToolFailed.is_tool_terminator());
        assert!(EventType::ToolDenied.is_tool_terminator());
        assert!(!EventType::ToolServerError.is_tool_terminator());
        assert!(!EventType::ToolRequested.is_tool_terminator());
    }

    #[test]
    fn envelope_serializes_seq_before_data() {
        let event = Event {
            event_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            seq: 7,
            timestamp: Utc::now(),
            kind: EventType::OutputChunk,
            data: EventData::new(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let seq_pos = json.find("\"seq\"").unwrap();
        let data_pos = json.find("\"data\"").unwrap();
        assert!(seq_pos < data_pos);
    }

    #[test]
    fn data_str_accessor() {
        let mut data = EventData::new();
        data.insert("step".into(), Value::String("plan".into()));
        let event = Event {
            event_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            seq: 1,
            timestamp: Utc::now(),
            kind: EventType::WorkflowStepStarted,
            data,
        };
        assert_eq!(event.data_str("step"), Some("plan"));
        assert_eq!(event.data_str("missing"), None);
    }
}
