//! Collaborator seams consumed by the run engine, plus the deterministic
//! offline implementations that back tests and the default install.
//!
//! The engine only ever sees the traits in [`traits`]; swapping a built-in
//! for a real planner/retriever/model adapter is a bootstrap concern.

pub mod builtin;
pub mod registry;
pub mod traits;

pub use builtin::{
    EnvPermissionGate, HeuristicPlanner, PatternGuardrail, StaticRetriever, TemplateStreamer,
};
pub use registry::{BuiltinToolServer, ToolRegistry};
pub use traits::{
    BoxStream, Guardrail, GuardrailLayer, GuardrailOutcome, ModelChunk, ModelStreamer,
    PermissionGate, PermissionOutcome, PlanDecision, Planner, Retriever, SanitizedChunk,
    ToolServer, ToolServerFailure,
};
