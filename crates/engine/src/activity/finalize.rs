//! Finalize: close out the pipeline. The engine synthesizes the terminal
//! events once this returns `Done`.

use serde_json::json;

use rl_domain::error::Result;
use rl_domain::event::EventType;

use crate::context::ActivityCtx;

use super::ActivityResult;

pub(crate) async fn run(ctx: &ActivityCtx) -> Result<ActivityResult> {
    ctx.emit(EventType::NodeStarted, json!({"name": "finalize"}))
        .await?;
    ctx.emit(EventType::StatusChanged, json!({"status": "complete"}))
        .await?;
    ctx.emit(EventType::NodeCompleted, json!({"name": "finalize"}))
        .await?;
    Ok(ActivityResult::Done)
}
