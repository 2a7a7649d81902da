//! Distributed transport: per-run redis list + notify channel.
//!
//! Layout:
//! - `ai:run:{id}:events` — ordered list, one JSON envelope per element.
//! - `ai:run:{id}:notify` — pub/sub channel carrying the same envelopes.
//!
//! A Lua script assigns `seq` from the list length, pushes, and publishes in
//! one atomic unit, so writers in different processes still produce a
//! gap-free sequence. Subscribers attach to the channel *before* reading
//! history; the brief overlap window is deduplicated by `seq`.

use chrono::Utc;
use uuid::Uuid;

use rl_domain::error::{Error, Result};
use rl_domain::event::{Event, EventData, EventType};

use crate::log::{EventLog, EventStream, SubscriptionItem};

/// Splices `seq` into the serialized envelope. The envelope serializes
/// `seq` before `data`, so the first `"seq":0` is always the placeholder.
const APPEND_SCRIPT: &str = r#"
local seq = redis.call('LLEN', KEYS[1]) + 1
local payload = string.gsub(ARGV[1], '"seq":0', '"seq":' .. seq, 1)
redis.call('RPUSH', KEYS[1], payload)
redis.call('PUBLISH', KEYS[2], payload)
return payload
"#;

pub fn events_key(run_id: Uuid) -> String {
    format!("ai:run:{run_id}:events")
}

pub fn notify_key(run_id: Uuid) -> String {
    format!("ai:run:{run_id}:notify")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RedisEventLog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RedisEventLog {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
    append_script: redis::Script,
}

impl RedisEventLog {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::EventStoreUnavailable(e.to_string()))?;
        let manager = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| Error::EventStoreUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            manager,
            append_script: redis::Script::new(APPEND_SCRIPT),
        })
    }

    fn parse_entry(raw: &str) -> Option<Event> {
        match serde_json::from_str::<Event>(raw) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable event entry");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl EventLog for RedisEventLog {
    async fn append(&self, run_id: Uuid, kind: EventType, data: EventData) -> Result<Event> {
        // seq 0 is the placeholder the script replaces.
        let envelope = Event {
            event_id: Uuid::new_v4(),
            run_id,
            seq: 0,
            timestamp: Utc::now(),
            kind,
            data,
        };
        let payload = serde_json::to_string(&envelope)?;

        let mut conn = self.manager.clone();
        let stored: String = self
            .append_script
            .key(events_key(run_id))
            .key(notify_key(run_id))
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::EventStoreUnavailable(e.to_string()))?;

        let event = serde_json::from_str::<Event>(&stored)?;
        Ok(event)
    }

    async fn history(&self, run_id: Uuid) -> Result<Vec<Event>> {
        let mut conn = self.manager.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(events_key(run_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::EventStoreUnavailable(e.to_string()))?;
        Ok(raw.iter().filter_map(|r| Self::parse_entry(r)).collect())
    }

    async fn subscribe(&self, run_id: Uuid) -> Result<EventStream> {
        // Attach to the channel first so nothing published while we read
        // history is missed; the overlap dedupes by seq below.
        let mut pubsub = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| Error::EventStoreUnavailable(e.to_string()))?
            .into_pubsub();
        pubsub
            .subscribe(notify_key(run_id))
            .await
            .map_err(|e| Error::EventStoreUnavailable(e.to_string()))?;

        let history = self.history(run_id).await?;

        let stream = async_stream::stream! {
            let mut last_seq = 0u64;
            for event in history {
                last_seq = event.seq;
                let terminal = event.is_terminal();
                yield SubscriptionItem::Event(event);
                if terminal {
                    return;
                }
            }
            let mut messages = pubsub.on_message();
            while let Some(msg) = futures_util::StreamExt::next(&mut messages).await {
                let raw: String = match msg.get_payload() {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable notify payload");
                        continue;
                    }
                };
                let Some(event) = Self::parse_entry(&raw) else {
                    continue;
                };
                if event.seq <= last_seq {
                    continue;
                }
                last_seq = event.seq;
                let terminal = event.is_terminal();
                yield SubscriptionItem::Event(event);
                if terminal {
                    return;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    #[test]
    fn key_layout() {
        let run_id = Uuid::nil();
        assert_eq!(
            events_key(run_id),
            "ai:run:00000000-0000-0000-0000-000000000000:events"
        );
        assert_eq!(
            notify_key(run_id),
            "ai:run:00000000-0000-0000-0000-000000000000:notify"
        );
    }

    /// The script's splice target must appear exactly once, before `data`,
    /// even when the payload itself contains a decoy.
    #[test]
    fn seq_placeholder_is_unambiguous() {
        let envelope = Event {
            event_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            seq: 0,
            timestamp: Utc::now(),
            kind: EventType::DecisionMade,
            data: rl_domain::event::payload(json!({"note": "{\"seq\":0}"})),
        };
        let payload = serde_json::to_string(&envelope).unwrap();

        let placeholder = "\"seq\":0";
        let first = payload.find(placeholder).unwrap();
        let data_pos = payload.find("\"data\"").unwrap();
        assert!(first < data_pos, "placeholder must precede data");

        // Simulate the Lua gsub (count = 1).
        let spliced = payload.replacen(placeholder, "\"seq\":42", 1);
        let event: Event = serde_json::from_str(&spliced).unwrap();
        assert_eq!(event.seq, 42);
        assert_eq!(event.data_str("note"), Some("{\"seq\":0}"));
    }

    // Live-server tests: run with `cargo test -- --ignored` against a local
    // redis at REDIS_URL (default redis://127.0.0.1:6379).

    async fn live_log() -> RedisEventLog {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisEventLog::connect(&url).await.unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn live_append_assigns_seq() {
        let log = live_log().await;
        let run_id = Uuid::new_v4();
        let first = log
            .append(run_id, EventType::RunStarted, EventData::new())
            .await
            .unwrap();
        let second = log
            .append(run_id, EventType::OutputChunk, EventData::new())
            .await
            .unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(log.history(run_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    #[ignore]
    async fn live_subscribe_replays_then_tails() {
        let log = live_log().await;
        let run_id = Uuid::new_v4();
        log.append(run_id, EventType::RunStarted, EventData::new())
            .await
            .unwrap();

        let mut stream = log.subscribe(run_id).await.unwrap();
        log.append(run_id, EventType::RunCompleted, EventData::new())
            .await
            .unwrap();

        let mut seqs = Vec::new();
        while let Some(SubscriptionItem::Event(e)) = stream.next().await {
            seqs.push(e.seq);
        }
        assert_eq!(seqs, vec![1, 2]);
    }
}
