//! The collaborator contracts the engine depends on.
//!
//! Every trait is object-safe and failure-classified: collaborators return
//! [`RunError`]s whose kind the activity adapters translate into retry /
//! fatal / refusal decisions.

use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use rl_domain::error::RunError;
use rl_domain::run::{Identity, RetrievedChunk, RunState};
use rl_domain::tool::ToolDescriptor;

/// A boxed async stream, used for model output.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Planner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The planner's verdict on how to drive a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDecision {
    /// e.g. `direct_answer` or `tool_call`.
    pub plan_type: String,
    pub response_strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_tool: Option<String>,
    /// High-risk intent: the run must pass the human approval gate before
    /// finalizing.
    #[serde(default)]
    pub needs_approval: bool,
}

#[async_trait::async_trait]
pub trait Planner: Send + Sync {
    /// Decide how to answer. Fails with `ErrorKind::BadPlan` when the
    /// request cannot be planned coherently.
    async fn plan(&self, state: &RunState) -> Result<PlanDecision, RunError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retriever
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    /// Fetch evidence for a query, best first. An empty result is not an
    /// error — the pipeline proceeds in lacking-evidence mode.
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedChunk>, RunError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model streamer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One item of a model stream: text, then a single `Done` carrying cost.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    Text(String),
    Done { cost: f64 },
}

#[async_trait::async_trait]
pub trait ModelStreamer: Send + Sync {
    /// Stream a completion for the prompt. Transient failures use
    /// `ErrorKind::NetworkFailure`; exhausted budget uses
    /// `ErrorKind::BudgetExhausted`.
    async fn stream(
        &self,
        prompt: &str,
    ) -> Result<BoxStream<'static, Result<ModelChunk, RunError>>, RunError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Guardrail
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailLayer {
    Input,
    Output,
}

impl GuardrailLayer {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailOutcome {
    Pass,
    Refuse {
        reason: String,
        layer: String,
        threat_type: String,
    },
}

/// Result of sanitizing one retrieved chunk before it reaches the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedChunk {
    pub text: String,
    /// True when suspicious directives were found (and stripped).
    pub injection_detected: bool,
}

#[async_trait::async_trait]
pub trait Guardrail: Send + Sync {
    async fn screen(&self, layer: GuardrailLayer, text: &str) -> GuardrailOutcome;

    /// Strip prompt-injection payloads from retrieved context.
    fn sanitize(&self, chunk_text: &str) -> SanitizedChunk;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a tool invocation can fail, as seen by the executor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolServerFailure {
    /// The server ran and raised an application-level error
    /// (surfaces as `tool.server.error` then `tool.failed`).
    #[error("application error: {0}")]
    Application(String),
    /// The server could not be reached or the connection broke.
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait::async_trait]
pub trait ToolServer: Send + Sync {
    fn server_id(&self) -> &str;

    /// The tools this server hosts, with their argument schemas.
    fn descriptors(&self) -> Vec<ToolDescriptor>;

    async fn invoke(&self, tool_name: &str, arguments: &Value)
        -> Result<Value, ToolServerFailure>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum PermissionOutcome {
    Allow,
    Deny { reason: String },
}

pub trait PermissionGate: Send + Sync {
    /// Decide whether `scope` may be exercised for `identity`. The gate
    /// carries its view of the environment; denial reasons follow the
    /// `scope_not_allowed_<context>` convention.
    fn check(&self, scope: &str, identity: &Identity) -> PermissionOutcome;
}
