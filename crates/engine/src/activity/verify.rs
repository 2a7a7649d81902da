//! Verify: enforce grounding. When retrieval produced evidence, the answer
//! must cite it; an evidence-free run is exempt (the lacking-evidence
//! answer is legitimate). The output also passes the guardrail.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::json;

use rl_collab::{GuardrailLayer, GuardrailOutcome};
use rl_domain::error::{ErrorKind, Result, RunError};
use rl_domain::event::EventType;
use rl_domain::workflow::Step;

use crate::context::ActivityCtx;

use super::ActivityResult;

pub(crate) async fn run(ctx: &ActivityCtx) -> Result<ActivityResult> {
    ctx.emit(EventType::NodeStarted, json!({"name": "verify"}))
        .await?;

    if let GuardrailOutcome::Refuse {
        reason,
        layer,
        threat_type,
    } = ctx
        .services
        .guardrail
        .screen(GuardrailLayer::Output, &ctx.state.output_text)
        .await
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
            json!({"name": "verify", "error": "refusal"}),
        )
        .await?;
        return Ok(ActivityResult::Fatal(RunError::new(
            ErrorKind::Refusal,
            reason,
        )));
    }

    let reason = if ctx.state.has_evidence() {
        let citations = extract_citations(&ctx.state.output_text);
        if citations.is_empty() {
            return grounding_failure(
                ctx,
                ErrorKind::MissingCitations,
                "answer cites no evidence although retrieval produced chunks",
            )
            .await;
        }
        let known: HashSet<&str> = ctx
            .state
            .retrieved_chunks
            .iter()
            .map(|c| c.chunk_id.as_str())
            .collect();
        if let Some(bogus) = citations.iter().find(|c| !known.contains(c.as_str())) {
            return grounding_failure(
                ctx,
                ErrorKind::InvalidCitation,
                &format!("citation [{bogus}] does not match any retrieved chunk"),
            )
            .await;
        }
        format!("verified {} citation(s)", citations.len())
    } else {
        "no evidence retrieved; citation check not applicable".to_string()
    };

    ctx.emit(
        EventType::NodeCompleted,
        json!({"name": "verify", "verification_reason": reason}),
    )
    .await?;

    let next = if ctx.state.requires_approval {
        Step::MaybeApprove
    } else {
        Step::Finalize
    };
    Ok(ActivityResult::Next(next))
}

async fn grounding_failure(
    ctx: &ActivityCtx,
    kind: ErrorKind,
    message: &str,
) -> Result<ActivityResult> {
    ctx.emit(
        EventType::ErrorRaised,
        json!({"error_type": kind.as_str(), "node": "verify", "message": message}),
    )
    .await?;
    ctx.emit(
        EventType::NodeCompleted,
        json!({"name": "verify", "error": kind.as_str()}),
    )
    .await?;
    Ok(ActivityResult::Fatal(RunError::new(kind, message)))
}

/// Citation markers look like `[chunk-id]`.
fn extract_citations(text: &str) -> Vec<String> {
    static CITATION: OnceLock<Regex> = OnceLock::new();
    let re = CITATION
        .get_or_init(|| Regex::new(r"\[([A-Za-z0-9][A-Za-z0-9_:.\-]*)\]").unwrap());
    re.captures_iter(text).map(|c| c[1].to_string()).collect()
}
