//! Tool contracts: requests, results, and descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a tool request, mirroring the tool event family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Requested,
    Completed,
    Failed,
    Denied,
    ServerError,
}

/// A tool invocation submitted by the respond step.
///
/// `request_id` is derived deterministically from `(run_id, step, attempt)`
/// so a re-submission after a crash carries the same id and is dropped by
/// the executor's dedupe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub run_id: Uuid,
    pub request_id: String,
    pub tool_name: String,
    pub server_id: String,
    pub permission_scope: String,
    pub arguments: Value,
    pub submitted_at: DateTime<Utc>,
}

/// The single terminator recorded for a tool request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub request_id: String,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Registry entry describing one tool: where it lives, what it may do, and
/// the JSON schema its arguments must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub server_id: String,
    pub permission_scope: String,
    pub description: String,
    /// Read-only tools are eligible for the content-addressed result cache.
    #[serde(default)]
    pub read_only: bool,
    /// JSON-schema-shaped argument contract (`type`/`properties`/`required`).
    pub input_schema: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ToolStatus::ServerError).unwrap(),
            "\"server_error\""
        );
        assert_eq!(
            serde_json::to_string(&ToolStatus::Denied).unwrap(),
            "\"denied\""
        );
    }

    #[test]
    fn request_round_trip() {
        let req = ToolRequest {
            run_id: Uuid::new_v4(),
            request_id: "a1b2".into(),
            tool_name: "calculator".into(),
            server_id: "builtin".into(),
            permission_scope: "calc.execute".into(),
            arguments: serde_json::json!({"op": "add", "a": 17, "b": 32}),
            submitted_at: Utc::now(),
        };
        let json = serde_json::to_value(&req).unwrap();
        let back: ToolRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }
}
