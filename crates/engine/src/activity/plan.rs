//! Plan: ask the planner how to drive the run.

use serde_json::json;

use rl_domain::error::Result;
use rl_domain::event::EventType;
use rl_domain::workflow::Step;

use crate::context::ActivityCtx;

use super::{classify, ActivityResult};

pub(crate) async fn run(ctx: &ActivityCtx) -> Result<ActivityResult> {
    ctx.emit(EventType::NodeStarted, json!({"name": "plan"}))
        .await?;
    ctx.emit(EventType::StatusChanged, json!({"status": "thinking"}))
        .await?;

    match ctx.services.planner.plan(&ctx.state).await {
        Ok(decision) => {
            ctx.emit(
                EventType::DecisionMade,
                serde_json::to_value(&decision)?,
            )
            .await?;
            ctx.emit(EventType::NodeCompleted, json!({"name": "plan"}))
                .await?;
            Ok(ActivityResult::Next(Step::Retrieve))
        }
        Err(err) => {
            ctx.emit(
                EventType::ErrorRaised,
                json!({"error_type": err.kind.as_str(), "node": "plan", "message": err.message}),
            )
            .await?;
            ctx.emit(
                EventType::NodeCompleted,
                json!({"name": "plan", "error": err.kind.as_str()}),
            )
            .await?;
            Ok(classify(err))
        }
    }
}
