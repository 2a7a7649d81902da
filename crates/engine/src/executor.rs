//! Tool executor: consumes `tool.requested`, gates and validates, invokes
//! the server, and emits exactly one terminator per request id.
//!
//! Dedupe is durable: before doing anything the executor checks the event
//! log for an existing terminator with the same `request_id`, so redelivery
//! (crash replay, queue at-least-once) never re-runs a side effect.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use rl_collab::{PermissionOutcome, ToolServerFailure};
use rl_domain::error::Result;
use rl_domain::event::EventType;
use rl_domain::run::Identity;
use rl_domain::tool::ToolRequest;
use rl_eventlog::{EventLog, SubscriptionItem};

use crate::cache::{content_key, BoundedCache};
use crate::context::Services;

pub struct ToolExecutor {
    services: Arc<Services>,
    cache: Option<Arc<BoundedCache>>,
    /// Fast in-process dedupe; the event log remains the durable memory.
    seen: Mutex<HashSet<String>>,
    invoke_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(services: Arc<Services>) -> Arc<Self> {
        let config = &services.config;
        let cache = config
            .cache
            .tool_results
            .then(|| Arc::new(BoundedCache::new(config.cache.max_entries)));
        let invoke_timeout = Duration::from_secs_f64(config.retry.tool_timeout_secs.max(0.1));
        Arc::new(Self {
            services,
            cache,
            seen: Mutex::new(HashSet::new()),
            invoke_timeout,
        })
    }

    /// Subscribe to a run's stream and execute every `tool.requested` it
    /// carries (single-process wiring). The task ends with the run.
    pub fn attach(self: &Arc<Self>, run_id: Uuid) {
        let executor = self.clone();
        tokio::spawn(async move {
            loop {
                let mut stream = match executor.services.log.subscribe(run_id).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::error!(%run_id, error = %e, "executor subscription failed");
                        return;
                    }
                };
                let mut overflowed = false;
                while let Some(item) = futures_util::StreamExt::next(&mut stream).await {
                    match item {
                        SubscriptionItem::Event(event)
                            if event.kind == EventType::ToolRequested =>
                        {
                            let request: ToolRequest = match serde_json::from_value(
                                Value::Object(event.data.clone()),
                            ) {
                                Ok(request) => request,
                                Err(e) => {
                                    tracing::warn!(%run_id, error = %e, "undecodable tool request");
                                    continue;
                                }
                            };
                            if let Err(e) = executor.handle(&request).await {
                                tracing::error!(%run_id, error = %e, "tool execution errored");
                            }
                        }
                        SubscriptionItem::Event(_) => {}
                        SubscriptionItem::Overflowed { skipped } => {
                            tracing::warn!(%run_id, skipped, "executor lagged; re-subscribing");
                            overflowed = true;
                            break;
                        }
                    }
                }
                if !overflowed {
                    // Stream closed: terminal event or log dropped.
                    return;
                }
            }
        });
    }

    /// Execute one request to exactly one terminator.
    pub async fn handle(&self, request: &ToolRequest) -> Result<()> {
        // 1. Dedupe: in-process first, then the durable log.
        if !self.seen.lock().insert(request.request_id.clone()) {
            return Ok(());
        }
        if self.already_answered(request).await? {
            return Ok(());
        }

        // 2. Resolve the descriptor.
        let Some((descriptor, server)) = self
            .services
            .registry
            .resolve(&request.tool_name, &request.server_id)
        else {
            self.emit_failed(
                request,
                "schema_violation",
                &format!(
                    "tool {} is not registered on server {}",
                    request.tool_name, request.server_id
                ),
                0,
            )
            .await?;
            return Ok(());
        };

        // 3. Validate arguments against the declared schema.
        if let Err(violation) = validate_arguments(&descriptor.input_schema, &request.arguments)
        {
            self.emit_failed(request, "schema_violation", &violation, 0).await?;
            return Ok(());
        }

        // 4. Permission gate, before any server contact.
        let identity = self
            .services
            .projector
            .get(request.run_id)
            .map(|s| s.identity)
            .unwrap_or_else(Identity::default);
        if let PermissionOutcome::Deny { reason } = self
            .services
            .gate
            .check(&request.permission_scope, &identity)
        {
            self.services
                .emit(
                    request.run_id,
                    EventType::ToolDenied,
                    json!({"request_id": request.request_id, "reason": reason}),
                )
                .await?;
            return Ok(());
        }

        // 5. Read-only results may come from the content-addressed cache.
        let cache_key = descriptor
            .read_only
            .then(|| content_key(&request.tool_name, &request.arguments));
        if let (Some(cache), Some(key)) = (self.cache.as_ref(), cache_key.as_ref()) {
            if let Some(output) = cache.get(key) {
                self.services
                    .emit(
                        request.run_id,
                        EventType::ToolCompleted,
                        json!({
                            "request_id": request.request_id,
                            "output": output,
                            "duration_ms": 0,
                            "cached": true,
                        }),
                    )
                    .await?;
                return Ok(());
            }
        }

        // 6. Invoke with a bounded timeout and classify the outcome.
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            self.invoke_timeout,
            server.invoke(&request.tool_name, &request.arguments),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                if let (Some(cache), Some(key)) = (self.cache.as_ref(), cache_key) {
                    cache.insert(key, output.clone());
                }
                self.services
                    .emit(
                        request.run_id,
                        EventType::ToolCompleted,
                        json!({
                            "request_id": request.request_id,
                            "output": output,
                            "duration_ms": duration_ms,
                        }),
                    )
                    .await?;
            }
            Ok(Err(ToolServerFailure::Application(message))) => {
                self.services
                    .emit(
                        request.run_id,
                        EventType::ToolServerError,
                        json!({"request_id": request.request_id, "error": message}),
                    )
                    .await?;
                self.emit_failed(request, "server_error", &message, duration_ms)
                    .await?;
            }
            Ok(Err(ToolServerFailure::Transport(message))) => {
                self.emit_failed(request, "transport", &message, duration_ms)
                    .await?;
            }
            Err(_elapsed) => {
                self.emit_failed(
                    request,
                    "timeout",
                    &format!("no response within {:?}", self.invoke_timeout),
                    duration_ms,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn already_answered(&self, request: &ToolRequest) -> Result<bool> {
        let history = self.services.log.history(request.run_id).await?;
        Ok(history.iter().any(|event| {
            event.kind.is_tool_terminator()
                && event.data_str("request_id") == Some(request.request_id.as_str())
        }))
    }

    async fn emit_failed(
        &self,
        request: &ToolRequest,
        error_kind: &str,
        message: &str,
        duration_ms: u64,
    ) -> Result<()> {
        self.services
            .emit(
                request.run_id,
                EventType::ToolFailed,
                json!({
                    "request_id": request.request_id,
                    "error_kind": error_kind,
                    "error": message,
                    "duration_ms": duration_ms,
                }),
            )
            .await?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Argument validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Check `args` against the JSON-schema subset our descriptors use:
/// object shape, required fields, property types, and enums.
pub fn validate_arguments(schema: &Value, args: &Value) -> std::result::Result<(), String> {
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Ok(());
    }
    let Some(obj) = args.as_object() else {
        return Err("arguments must be a JSON object".into());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(field) {
                return Err(format!("missing required field: {field}"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, spec) in properties {
            let Some(value) = obj.get(name) else { continue };
            if let Some(expected) = spec.get("type").and_then(Value::as_str) {
                let ok = match expected {
                    "string" => value.is_string(),
                    "number" => value.is_number(),
                    "integer" => value.is_i64() || value.is_u64(),
                    "boolean" => value.is_boolean(),
                    "object" => value.is_object(),
                    "array" => value.is_array(),
                    _ => true,
                };
                if !ok {
                    return Err(format!("field {name} must be of type {expected}"));
                }
            }
            if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
                if !allowed.contains(value) {
                    return Err(format!("field {name} must be one of {allowed:?}"));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "op": { "type": "string", "enum": ["add", "sub", "mul", "div"] },
                "a": { "type": "number" },
                "b": { "type": "number" }
            },
            "required": ["op", "a", "b"]
        })
    }

    #[test]
    fn valid_arguments_pass() {
        let args = json!({"op": "add", "a": 17, "b": 32});
        assert!(validate_arguments(&calculator_schema(), &args).is_ok());
    }

    #[test]
    fn missing_required_field_fails() {
        let args = json!({"op": "add", "a": 17});
        let err = validate_arguments(&calculator_schema(), &args).unwrap_err();
        assert!(err.contains("b"));
    }

    #[test]
    fn wrong_type_fails() {
        let args = json!({"op": "add", "a": "seventeen", "b": 32});
        let err = validate_arguments(&calculator_schema(), &args).unwrap_err();
        assert!(err.contains("a"));
    }

    #[test]
    fn enum_violation_fails() {
        let args = json!({"op": "pow", "a": 2, "b": 8});
        let err = validate_arguments(&calculator_schema(), &args).unwrap_err();
        assert!(err.contains("op"));
    }

    #[test]
    fn non_object_arguments_fail() {
        let err = validate_arguments(&calculator_schema(), &json!([1, 2])).unwrap_err();
        assert!(err.contains("object"));
    }

    #[test]
    fn schema_without_object_type_accepts_anything() {
        assert!(validate_arguments(&json!({}), &json!("anything")).is_ok());
    }
}
