//! Respond: produce the streamed answer, invoking a tool first when the
//! plan selected one.
//!
//! The tool flow is a suspension: submit `tool.requested`, wait for the
//! terminator events, then re-enter this adapter with the fresh projection
//! and draft the answer from the tool output.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use chrono::Utc;
use futures_util::StreamExt;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use rl_collab::ModelChunk;
use rl_domain::error::{ErrorKind, Result, RunError};
use rl_domain::event::EventType;
use rl_domain::run::RunState;
use rl_domain::tool::{ToolRequest, ToolResult, ToolStatus};
use rl_domain::workflow::Step;

use crate::context::ActivityCtx;

use super::{classify, ActivityResult};

/// Deterministic idempotency key for a tool submission: a re-submission of
/// the same `(run_id, step, attempt)` after a crash carries the same id and
/// is dropped by the executor.
pub fn derive_request_id(run_id: Uuid, step: Step, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(step.as_str().as_bytes());
    hasher.update(attempt.to_be_bytes());
    hex::encode(&hasher.finalize()[..12])
}

pub(crate) async fn run(ctx: &ActivityCtx) -> Result<ActivityResult> {
    ctx.emit(EventType::NodeStarted, json!({"name": "respond"}))
        .await?;
    ctx.emit(EventType::StatusChanged, json!({"status": "responding"}))
        .await?;

    let selected_tool = ctx
        .state
        .decisions
        .last()
        .and_then(|d| d.get("selected_tool"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    match selected_tool {
        Some(tool_name) => tool_flow(ctx, &tool_name).await,
        None => stream_answer(ctx, None).await,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool flow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn wait_for_tool() -> ActivityResult {
    ActivityResult::WaitForEvents {
        types: BTreeSet::from([
            EventType::ToolCompleted,
            EventType::ToolFailed,
            EventType::ToolDenied,
            EventType::ToolServerError,
        ]),
        reason: "tool request in flight".into(),
    }
}

async fn tool_flow(ctx: &ActivityCtx, tool_name: &str) -> Result<ActivityResult> {
    let current_id = derive_request_id(ctx.run_id, ctx.step, ctx.attempt);

    let Some(last_request) = ctx.state.tool_requests.last() else {
        return submit(ctx, tool_name, current_id).await;
    };

    let Some(result) = ctx.state.tool_result(&last_request.request_id) else {
        // Submitted but unanswered — re-arm the wait. The executor dedupes,
        // so a crash between submit and suspend loses nothing.
        return Ok(wait_for_tool());
    };
    let result = result.clone();

    match result.status {
        ToolStatus::Completed => stream_answer(ctx, result.output).await,
        ToolStatus::Denied => {
            let reason = ctx
                .state
                .tool_denied_reason
                .clone()
                .unwrap_or_else(|| "permission denied".into());
            ctx.emit(
                EventType::NodeCompleted,
                json!({"name": "respond", "error": "permission_denied"}),
            )
            .await?;
            Ok(ActivityResult::Fatal(RunError::new(
                ErrorKind::PermissionDenied,
                reason,
            )))
        }
        _ => {
            if last_request.request_id == current_id {
                interpret_failure(ctx, &result).await
            } else {
                // The engine retried the step; issue a fresh logical request.
                submit(ctx, tool_name, current_id).await
            }
        }
    }
}

async fn submit(
    ctx: &ActivityCtx,
    tool_name: &str,
    request_id: String,
) -> Result<ActivityResult> {
    let Some((descriptor, _)) = ctx.services.registry.find(tool_name) else {
        let err = RunError::new(
            ErrorKind::BadPlan,
            format!("planner selected unknown tool: {tool_name}"),
        );
        ctx.emit(
            EventType::ErrorRaised,
            json!({"error_type": err.kind.as_str(), "node": "respond", "message": err.message}),
        )
        .await?;
        ctx.emit(
            EventType::NodeCompleted,
            json!({"name": "respond", "error": err.kind.as_str()}),
        )
        .await?;
        return Ok(ActivityResult::Fatal(err));
    };

    ctx.emit(
        EventType::ToolDiscovered,
        json!({
            "tool_name": descriptor.name,
            "server_id": descriptor.server_id,
            "permission_scope": descriptor.permission_scope,
            "read_only": descriptor.read_only,
        }),
    )
    .await?;

    let request = ToolRequest {
        run_id: ctx.run_id,
        request_id,
        tool_name: descriptor.name.clone(),
        server_id: descriptor.server_id.clone(),
        permission_scope: descriptor.permission_scope.clone(),
        arguments: arguments_for(&descriptor.name, &ctx.state),
        submitted_at: Utc::now(),
    };
    ctx.emit(EventType::ToolRequested, serde_json::to_value(&request)?)
        .await?;

    // Distributed deployments also push the request onto the durable queue;
    // locally the executor consumes the event stream itself.
    if let Some(queue) = &ctx.services.tool_queue {
        queue.enqueue(&request).await?;
    }

    Ok(wait_for_tool())
}

async fn interpret_failure(ctx: &ActivityCtx, result: &ToolResult) -> Result<ActivityResult> {
    let kind_str = result.error.as_deref().unwrap_or("server_error");

    let (err, outcome) = match kind_str {
        "server_error" => {
            let occurrences = ctx
                .state
                .tool_results
                .iter()
                .filter(|r| {
                    r.status == ToolStatus::Failed
                        && r.error.as_deref() == Some("server_error")
                })
                .count();
            let err = RunError::new(ErrorKind::ServerError, "tool server raised an error");
            // Transient once; fatal on the second occurrence.
            if occurrences >= 2 {
                (err.clone(), ActivityResult::Fatal(err))
            } else {
                (err.clone(), ActivityResult::Transient(err))
            }
        }
        "timeout" => {
            let err = RunError::new(ErrorKind::Timeout, "tool invocation timed out");
            (err.clone(), classify(err))
        }
        "transport" => {
            let err = RunError::new(ErrorKind::NetworkFailure, "tool transport failed");
            (err.clone(), classify(err))
        }
        "schema_violation" => {
            let err = RunError::new(ErrorKind::SchemaViolation, "tool arguments were rejected");
            (err.clone(), classify(err))
        }
        other => {
            let err = RunError::new(ErrorKind::ServerError, format!("tool failed: {other}"));
            (err.clone(), ActivityResult::Fatal(err))
        }
    };

    ctx.emit(
        EventType::ErrorRaised,
        json!({"error_type": err.kind.as_str(), "node": "respond", "message": err.message}),
    )
    .await?;
    ctx.emit(
        EventType::NodeCompleted,
        json!({"name": "respond", "error": err.kind.as_str()}),
    )
    .await?;
    Ok(outcome)
}

/// Derive tool arguments from the run. A real deployment lets the model
/// produce these; the offline pipeline derives them from the message.
fn arguments_for(tool_name: &str, state: &RunState) -> Value {
    match tool_name {
        "calculator" => parse_arithmetic(&state.message).unwrap_or_else(|| json!({})),
        "github.list_issues" => {
            let repo = state
                .message
                .split_whitespace()
                .find(|w| w.contains('/') && !w.starts_with('/') && !w.ends_with('/'))
                .unwrap_or("acme/backlog");
            json!({ "repo": repo })
        }
        _ => json!({}),
    }
}

fn parse_arithmetic(message: &str) -> Option<Value> {
    static ARITHMETIC: OnceLock<Regex> = OnceLock::new();
    let re = ARITHMETIC.get_or_init(|| {
        Regex::new(r"(-?\d+(?:\.\d+)?)\s*([+\-*/])\s*(-?\d+(?:\.\d+)?)").unwrap()
    });
    let caps = re.captures(message)?;
    let a: f64 = caps[1].parse().ok()?;
    let b: f64 = caps[3].parse().ok()?;
    let op = match &caps[2] {
        "+" => "add",
        "-" => "sub",
        "*" => "mul",
        "/" => "div",
        _ => return None,
    };
    Some(json!({ "op": op, "a": num(a), "b": num(b) }))
}

fn num(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        json!(v as i64)
    } else {
        json!(v)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Answer streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn stream_answer(ctx: &ActivityCtx, tool_output: Option<Value>) -> Result<ActivityResult> {
    let state = &ctx.state;

    if state.cost_limit > 0.0 && state.cost_spent >= state.cost_limit {
        return budget_exhausted(ctx).await;
    }

    let prompt = build_prompt(state, tool_output.as_ref());
    let mut stream = match ctx.services.streamer.stream(&prompt).await {
        Ok(stream) => stream,
        Err(err) => return model_failure(ctx, err).await,
    };

    let mut cost = 0.0;
    while let Some(item) = stream.next().await {
        if ctx.cancel.is_cancelled() {
            ctx.emit(
                EventType::NodeCompleted,
                json!({"name": "respond", "error": "cancelled"}),
            )
            .await?;
            return Ok(ActivityResult::Fatal(RunError::new(
                ErrorKind::Cancelled,
                "cancelled",
            )));
        }
        match item {
            Ok(ModelChunk::Text(text)) => {
                ctx.emit(EventType::OutputChunk, json!({"text": text})).await?;
            }
            Ok(ModelChunk::Done { cost: c }) => cost = c,
            Err(err) => return model_failure(ctx, err).await,
        }
    }

    ctx.emit(
        EventType::NodeCompleted,
        json!({"name": "respond", "cost": cost}),
    )
    .await?;
    Ok(ActivityResult::Next(Step::Verify))
}

async fn budget_exhausted(ctx: &ActivityCtx) -> Result<ActivityResult> {
    ctx.emit(
        EventType::RateLimitExceeded,
        json!({"scope": "model_budget"}),
    )
    .await?;
    let err = RunError::new(ErrorKind::BudgetExhausted, "model budget exhausted");
    ctx.emit(
        EventType::NodeCompleted,
        json!({"name": "respond", "error": err.kind.as_str()}),
    )
    .await?;
    Ok(ActivityResult::Fatal(err))
}

async fn model_failure(ctx: &ActivityCtx, err: RunError) -> Result<ActivityResult> {
    if err.kind == ErrorKind::BudgetExhausted {
        ctx.emit(
            EventType::RateLimitExceeded,
            json!({"scope": "model_budget"}),
        )
        .await?;
    }
    ctx.emit(
        EventType::ErrorRaised,
        json!({"error_type": err.kind.as_str(), "node": "respond", "message": err.message}),
    )
    .await?;
    ctx.emit(
        EventType::NodeCompleted,
        json!({"name": "respond", "error": err.kind.as_str()}),
    )
    .await?;
    Ok(classify(err))
}

fn build_prompt(state: &RunState, tool_output: Option<&Value>) -> String {
    let mut prompt = format!("QUESTION: {}\n", state.message);
    if let Some(output) = tool_output {
        prompt.push_str("TOOL RESULT:\n");
        prompt.push_str(&output.to_string());
        prompt.push('\n');
    } else if state.has_evidence() {
        prompt.push_str("EVIDENCE:\n");
        for chunk in &state.retrieved_chunks {
            prompt.push_str(&format!("[{}] {}\n", chunk.chunk_id, chunk.text));
        }
    }
    prompt
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
