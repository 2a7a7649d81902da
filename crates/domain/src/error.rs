use serde::{Deserialize, Serialize};

/// Shared error type used across all RunLoom crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The event store could not persist an append. Per the durability
    /// contract this is fatal to the caller — state must never diverge
    /// from the log.
    #[error("event store unavailable: {0}")]
    EventStoreUnavailable(String),

    #[error("run not found: {0}")]
    RunNotFound(uuid::Uuid),

    #[error("workflow state corrupt for {run_id}: {message}")]
    WorkflowStateCorrupt { run_id: uuid::Uuid, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("queue: {0}")]
    Queue(String),

    #[error("{0}")]
    Run(#[from] RunError),
}

pub type Result<T> = std::result::Result<T, Error>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run-level error taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Closed taxonomy of run-level failures. The wire name (`as_str`) is what
/// events carry in their `error_type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkFailure,
    Timeout,
    SchemaViolation,
    PermissionDenied,
    BadPlan,
    MissingCitations,
    InvalidCitation,
    ServerError,
    BudgetExhausted,
    RateLimited,
    Cancelled,
    Refusal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkFailure => "network_failure",
            Self::Timeout => "timeout",
            Self::SchemaViolation => "schema_violation",
            Self::PermissionDenied => "permission_denied",
            Self::BadPlan => "bad_plan",
            Self::MissingCitations => "missing_citations",
            Self::InvalidCitation => "invalid_citation",
            Self::ServerError => "server_error",
            Self::BudgetExhausted => "budget_exhausted",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
            Self::Refusal => "refusal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified run failure: the taxonomy kind plus a human-readable reason.
///
/// Only the kind and the reason string surface in events — internal stack
/// traces and source chains stay out of the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
