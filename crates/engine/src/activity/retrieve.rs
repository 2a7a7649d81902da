//! Retrieve: gather evidence, sanitize it, and record what was found.
//!
//! Zero evidence is not a failure — the run proceeds in degraded
//! (lacking-evidence) mode and the respond adapter avoids fabricating
//! citations.

use serde_json::json;

use rl_domain::error::Result;
use rl_domain::event::EventType;
use rl_domain::run::RetrievedChunk;
use rl_domain::workflow::Step;

use crate::cache::content_key;
use crate::context::ActivityCtx;

use super::{classify, ActivityResult};

pub(crate) async fn run(ctx: &ActivityCtx) -> Result<ActivityResult> {
    ctx.emit(EventType::NodeStarted, json!({"name": "retrieve"}))
        .await?;
    let query = ctx.state.message.clone();
    ctx.emit(EventType::RetrievalStarted, json!({"query": query}))
        .await?;

    let mut chunks = match fetch(ctx, &query).await {
        Ok(chunks) => chunks,
        Err(err) => {
            ctx.emit(
                EventType::ErrorRaised,
                json!({
                    "error_type": err.kind.as_str(),
                    "node": "retrieve",
                    "message": err.message,
                }),
            )
            .await?;
            ctx.emit(
                EventType::NodeCompleted,
                json!({"name": "retrieve", "error": err.kind.as_str()}),
            )
            .await?;
            return Ok(classify(err));
        }
    };

    // Strip injection payloads from the evidence before it can reach a
    // prompt. Chunks that had to be rewritten are recorded.
    let mut sanitized_ids = Vec::new();
    for chunk in &mut chunks {
        let sanitized = ctx.services.guardrail.sanitize(&chunk.text);
        if sanitized.injection_detected {
            ctx.emit(
                EventType::InjectionDetected,
                json!({"chunk_id": chunk.chunk_id, "layer": "retrieval"}),
            )
            .await?;
            sanitized_ids.push(chunk.chunk_id.clone());
            chunk.text = sanitized.text;
        }
    }
    if !sanitized_ids.is_empty() {
        ctx.emit(
            EventType::ContextSanitized,
            json!({"chunk_ids": sanitized_ids}),
        )
        .await?;
    }

    ctx.emit(
        EventType::RetrievalCompleted,
        json!({"chunks": chunks, "count": chunks.len()}),
    )
    .await?;

    if chunks.is_empty() {
        ctx.emit(
            EventType::DegradedModeEntered,
            json!({"reason": "no_evidence"}),
        )
        .await?;
    }

    ctx.emit(EventType::NodeCompleted, json!({"name": "retrieve"}))
        .await?;
    Ok(ActivityResult::Next(Step::Respond))
}

/// Hit the retrieval cache when enabled, otherwise the retriever.
async fn fetch(
    ctx: &ActivityCtx,
    query: &str,
) -> std::result::Result<Vec<RetrievedChunk>, rl_domain::error::RunError> {
    let cache = ctx
        .services
        .retrieval_cache
        .as_ref()
        .filter(|_| ctx.services.config.cache.retrieval);
    let key = cache.map(|_| content_key("retrieval", &json!({ "query": query })));

    if let (Some(cache), Some(key)) = (cache, key.as_ref()) {
        if let Some(hit) = cache.get(key) {
            if let Ok(chunks) = serde_json::from_value(hit) {
                return Ok(chunks);
            }
        }
    }

    let chunks = ctx.services.retriever.retrieve(query).await?;

    if let (Some(cache), Some(key)) = (cache, key) {
        if let Ok(value) = serde_json::to_value(&chunks) {
            cache.insert(key, value);
        }
    }
    Ok(chunks)
}
