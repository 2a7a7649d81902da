//! Conditional approval gate: runs only when the plan flagged high-risk
//! intent. Suspends until a human decision is recorded, then either
//! proceeds to finalize or fails the run.

use serde_json::json;

use rl_domain::error::{ErrorKind, Result, RunError};
use rl_domain::event::EventType;
use rl_domain::workflow::{ApprovalDecision, Step};

use crate::context::ActivityCtx;

use super::ActivityResult;

pub(crate) async fn run(ctx: &ActivityCtx) -> Result<ActivityResult> {
    ctx.emit(EventType::NodeStarted, json!({"name": "maybe_approve"}))
        .await?;

    match ctx.human_decision {
        None => Ok(ActivityResult::WaitForApproval {
            reason: "plan flagged high-risk tool intent".into(),
        }),
        Some(ApprovalDecision::Approved) => {
            ctx.emit(
                EventType::NodeCompleted,
                json!({"name": "maybe_approve", "decision": "approved"}),
            )
            .await?;
            Ok(ActivityResult::Next(Step::Finalize))
        }
        Some(ApprovalDecision::Rejected) => {
            ctx.emit(
                EventType::NodeCompleted,
                json!({"name": "maybe_approve", "decision": "rejected"}),
            )
            .await?;
            Ok(ActivityResult::Fatal(RunError::new(
                ErrorKind::Cancelled,
                "rejected_by_user",
            )))
        }
    }
}
