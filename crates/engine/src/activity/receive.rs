//! Receive: admit the message into the pipeline and screen it.

use serde_json::json;

use rl_collab::{GuardrailLayer, GuardrailOutcome};
use rl_domain::error::{ErrorKind, Result, RunError};
use rl_domain::event::EventType;
use rl_domain::workflow::Step;

use crate::context::ActivityCtx;

use super::ActivityResult;

pub(crate) async fn run(ctx: &ActivityCtx) -> Result<ActivityResult> {
    ctx.emit(EventType::NodeStarted, json!({"name": "receive"}))
        .await?;
    ctx.emit(EventType::StatusChanged, json!({"status": "received"}))
        .await?;

    let verdict = ctx
        .services
        .guardrail
        .screen(GuardrailLayer::Input, &ctx.state.message)
        .await;
    if let GuardrailOutcome::Refuse {
        reason,
        layer,
        threat_type,
    } = verdict
    {
        ctx.emit(
            EventType::GuardrailTriggered,
            json!({
                "layer": layer,
                "threat_type": threat_type,
                "reason": reason,
                "blocking": true,
            }),
        )
        .await?;
        ctx.emit(
            EventType::NodeCompleted,
            json!({"name": "receive", "error": "refusal"}),
        )
        .await?;
        return Ok(ActivityResult::Fatal(RunError::new(
            ErrorKind::Refusal,
            reason,
        )));
    }

    ctx.emit(EventType::NodeCompleted, json!({"name": "receive"}))
        .await?;
    Ok(ActivityResult::Next(Step::Plan))
}
