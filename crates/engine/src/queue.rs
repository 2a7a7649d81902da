//! Distributed tool queue: a redis stream with a consumer group.
//!
//! Producers push `{request_id, run_id, ...}` entries onto `queue:tools`
//! alongside the `tool.requested` event. Workers read via the
//! `tool-workers` group with at-least-once delivery, dedupe by
//! `request_id`, execute, and acknowledge. Entries stuck with a crashed
//! worker are reclaimed by idle time and retried by another.

use std::sync::Arc;
use std::time::Duration;

use redis::streams::{StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use rl_domain::error::{Error, Result};
use rl_domain::tool::ToolRequest;

use crate::cancel::CancelToken;
use crate::context::ToolQueueProducer;
use crate::executor::ToolExecutor;

pub const STREAM_KEY: &str = "queue:tools";
pub const GROUP: &str = "tool-workers";
/// Set of request ids already fully processed (worker-side dedupe state).
const SEEN_KEY: &str = "queue:tools:seen";
/// Pending entries idle longer than this are reassigned.
const RECLAIM_IDLE_MS: usize = 30_000;

pub struct RedisToolQueue {
    manager: redis::aio::ConnectionManager,
    consumer: String,
}

impl RedisToolQueue {
    pub async fn connect(url: &str, consumer: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(queue_err)?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(queue_err)?;
        let queue = Self {
            manager,
            consumer: consumer.into(),
        };
        queue.ensure_group().await?;
        Ok(queue)
    }

    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(STREAM_KEY)
            .arg(GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(queue_err(e)),
        }
    }

    /// Consume until `shutdown` fires. Each loop pass first reclaims
    /// entries stuck with dead consumers, then reads fresh deliveries.
    pub async fn run_worker(
        self: Arc<Self>,
        executor: Arc<ToolExecutor>,
        shutdown: CancelToken,
    ) {
        while !shutdown.is_cancelled() {
            if let Err(e) = self.drain_once(&executor).await {
                tracing::warn!(error = %e, "tool queue pass failed; backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    async fn drain_once(&self, executor: &ToolExecutor) -> Result<()> {
        let mut conn = self.manager.clone();

        // Reclaim entries whose worker went quiet.
        let claimed: StreamAutoClaimReply = conn
            .xautoclaim_options(
                STREAM_KEY,
                GROUP,
                &self.consumer,
                RECLAIM_IDLE_MS,
                "0-0",
                StreamAutoClaimOptions::default().count(16),
            )
            .await
            .map_err(queue_err)?;
        for entry in &claimed.claimed {
            self.process_entry(executor, entry).await?;
        }

        // Fresh deliveries (blocking read keeps the loop polite).
        let options = StreamReadOptions::default()
            .group(GROUP, &self.consumer)
            .count(16)
            .block(1000);
        let reply: StreamReadReply = conn
            .xread_options(&[STREAM_KEY], &[">"], &options)
            .await
            .map_err(queue_err)?;
        for key in &reply.keys {
            for entry in &key.ids {
                self.process_entry(executor, entry).await?;
            }
        }
        Ok(())
    }

    async fn process_entry(&self, executor: &ToolExecutor, entry: &StreamId) -> Result<()> {
        let mut conn = self.manager.clone();

        let request = entry
            .map
            .get("payload")
            .and_then(|v| redis::from_redis_value::<String>(v).ok())
            .and_then(|raw| decode_entry(&raw));

        if let Some(request) = request {
            let already: bool = conn
                .sismember(SEEN_KEY, &request.request_id)
                .await
                .map_err(queue_err)?;
            if !already {
                // The executor's own log-backed dedupe makes redelivery
                // after a crash-before-ack harmless.
                executor.handle(&request).await?;
                let _: i64 = conn
                    .sadd(SEEN_KEY, &request.request_id)
                    .await
                    .map_err(queue_err)?;
            }
        } else {
            tracing::warn!(id = %entry.id, "discarding malformed tool queue entry");
        }

        let _: i64 = conn
            .xack(STREAM_KEY, GROUP, &[&entry.id])
            .await
            .map_err(queue_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ToolQueueProducer for RedisToolQueue {
    async fn enqueue(&self, request: &ToolRequest) -> Result<()> {
        let mut conn = self.manager.clone();
        let payload = encode_entry(request)?;
        let _: String = conn
            .xadd(STREAM_KEY, "*", &[("payload", payload.as_str())])
            .await
            .map_err(queue_err)?;
        Ok(())
    }
}

fn encode_entry(request: &ToolRequest) -> Result<String> {
    Ok(serde_json::to_string(request)?)
}

fn decode_entry(raw: &str) -> Option<ToolRequest> {
    match serde_json::from_str(raw) {
        Ok(request) => Some(request),
        Err(e) => {
            tracing::warn!(error = %e, "undecodable tool queue payload");
            None
        }
    }
}

fn queue_err(e: redis::RedisError) -> Error {
    Error::Queue(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn entry_round_trip() {
        let request = ToolRequest {
            run_id: Uuid::new_v4(),
            request_id: "abc123".into(),
            tool_name: "calculator".into(),
            server_id: "builtin".into(),
            permission_scope: "calc.execute".into(),
            arguments: json!({"op": "add", "a": 1, "b": 2}),
            submitted_at: Utc::now(),
        };
        let encoded = encode_entry(&request).unwrap();
        let decoded = decode_entry(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn malformed_entry_is_discarded() {
        assert!(decode_entry("{not json").is_none());
        assert!(decode_entry("{}").is_none());
    }

    #[test]
    fn queue_constants() {
        assert_eq!(STREAM_KEY, "queue:tools");
        assert_eq!(GROUP, "tool-workers");
    }
}
