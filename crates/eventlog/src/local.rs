//! In-process transport: one JSONL file per run plus a per-run broadcast
//! channel for live fan-out.
//!
//! Appends serialize through a per-run async mutex; the persist happens
//! under that lock and strictly before the broadcast, so every subscriber
//! observes events in seq order and never sees an event that could be lost
//! by a crash.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use rl_domain::error::{Error, Result};
use rl_domain::event::{Event, EventData, EventType};

use crate::log::{EventLog, EventStream, SubscriptionItem};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-run log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RunLog {
    /// Serializes writers; also guards the snapshot taken by subscribers.
    inner: tokio::sync::Mutex<Vec<Event>>,
    tx: broadcast::Sender<Event>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LocalEventLog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LocalEventLog {
    dir: PathBuf,
    runs: Mutex<HashMap<Uuid, Arc<RunLog>>>,
    subscriber_buffer: usize,
}

impl LocalEventLog {
    pub fn new(dir: impl Into<PathBuf>, subscriber_buffer: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            runs: Mutex::new(HashMap::new()),
            subscriber_buffer: subscriber_buffer.max(2),
        })
    }

    fn file_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.jsonl"))
    }

    /// Get or lazily load the per-run log. Loading replays the JSONL file so
    /// a restarted process resumes from the persisted prefix.
    fn run_log(&self, run_id: Uuid) -> Arc<RunLog> {
        let mut runs = self.runs.lock();
        runs.entry(run_id)
            .or_insert_with(|| {
                let events = Self::load(&self.file_path(run_id));
                let (tx, _) = broadcast::channel(self.subscriber_buffer);
                Arc::new(RunLog {
                    inner: tokio::sync::Mutex::new(events),
                    tx,
                })
            })
            .clone()
    }

    fn load(path: &Path) -> Vec<Event> {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| match serde_json::from_str::<Event>(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt event line");
                    None
                }
            })
            .collect()
    }

    fn persist(&self, run_id: Uuid, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event)?;
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.file_path(run_id))?;
            writeln!(file, "{json}")?;
            file.flush()
        };
        write().map_err(|e| Error::EventStoreUnavailable(e.to_string()))
    }
}

#[async_trait::async_trait]
impl EventLog for LocalEventLog {
    async fn append(&self, run_id: Uuid, kind: EventType, data: EventData) -> Result<Event> {
        let run_log = self.run_log(run_id);
        let mut events = run_log.inner.lock().await;

        let event = Event {
            event_id: Uuid::new_v4(),
            run_id,
            seq: events.len() as u64 + 1,
            timestamp: Utc::now(),
            kind,
            data,
        };

        // Persist, then mirror in memory, then broadcast. A failed persist
        // leaves no trace anywhere.
        self.persist(run_id, &event)?;
        events.push(event.clone());
        let _ = run_log.tx.send(event.clone());

        Ok(event)
    }

    async fn history(&self, run_id: Uuid) -> Result<Vec<Event>> {
        let run_log = self.run_log(run_id);
        let events = run_log.inner.lock().await;
        Ok(events.clone())
    }

    async fn subscribe(&self, run_id: Uuid) -> Result<EventStream> {
        let run_log = self.run_log(run_id);

        // Snapshot and receiver are taken under the writer lock, so the
        // splice point between replay and live delivery has no gap; the
        // overlap (events broadcast while snapshotting) dedupes by seq.
        let (snapshot, mut rx) = {
            let events = run_log.inner.lock().await;
            (events.clone(), run_log.tx.subscribe())
        };

        let stream = async_stream::stream! {
            let mut last_seq = 0u64;
            for event in snapshot {
                last_seq = event.seq;
                let terminal = event.is_terminal();
                yield SubscriptionItem::Event(event);
                if terminal {
                    return;
                }
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
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
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        yield SubscriptionItem::Overflowed { skipped };
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
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
    use rl_domain::event::payload;
    use serde_json::json;

    fn make_log(dir: &Path) -> LocalEventLog {
        LocalEventLog::new(dir.join("events"), 64).unwrap()
    }

    #[tokio::test]
    async fn append_assigns_gapless_seq() {
        let dir = tempfile::tempdir().unwrap();
        let log = make_log(dir.path());
        let run_id = Uuid::new_v4();

        for _ in 0..5 {
            log.append(run_id, EventType::OutputChunk, EventData::new())
                .await
                .unwrap();
        }
        let history = log.history(run_id).await.unwrap();
        let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn concurrent_appends_stay_gapless() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(make_log(dir.path()));
        let run_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    log.append(run_id, EventType::OutputChunk, EventData::new())
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let history = log.history(run_id).await.unwrap();
        assert_eq!(history.len(), 80);
        for (i, event) in history.iter().enumerate() {
            assert_eq!(event.seq, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn history_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        {
            let log = make_log(dir.path());
            log.append(run_id, EventType::RunStarted, payload(json!({"mode": "answer"})))
                .await
                .unwrap();
            log.append(run_id, EventType::RunCompleted, EventData::new())
                .await
                .unwrap();
        }
        // Fresh instance over the same directory replays the file.
        let log = make_log(dir.path());
        let history = log.history(run_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, EventType::RunStarted);
        assert_eq!(history[0].data_str("mode"), Some("answer"));
        assert_eq!(history[1].seq, 2);
    }

    #[tokio::test]
    async fn subscribe_replays_then_tails_without_gap() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(make_log(dir.path()));
        let run_id = Uuid::new_v4();

        for _ in 0..3 {
            log.append(run_id, EventType::OutputChunk, EventData::new())
                .await
                .unwrap();
        }

        let mut stream = log.subscribe(run_id).await.unwrap();

        // Live events appended after subscription.
        let log2 = log.clone();
        let producer = tokio::spawn(async move {
            log2.append(run_id, EventType::OutputChunk, EventData::new())
                .await
                .unwrap();
            log2.append(run_id, EventType::RunCompleted, EventData::new())
                .await
                .unwrap();
        });

        let mut seqs = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                SubscriptionItem::Event(e) => seqs.push(e.seq),
                SubscriptionItem::Overflowed { .. } => panic!("unexpected overflow"),
            }
        }
        producer.await.unwrap();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn late_subscriber_sees_history_then_close() {
        let dir = tempfile::tempdir().unwrap();
        let log = make_log(dir.path());
        let run_id = Uuid::new_v4();

        log.append(run_id, EventType::RunStarted, EventData::new())
            .await
            .unwrap();
        log.append(run_id, EventType::RunFailed, EventData::new())
            .await
            .unwrap();

        let mut stream = log.subscribe(run_id).await.unwrap();
        let mut kinds = Vec::new();
        while let Some(item) = stream.next().await {
            if let SubscriptionItem::Event(e) = item {
                kinds.push(e.kind);
            }
        }
        // Stream closed by itself after the terminal event.
        assert_eq!(kinds, vec![EventType::RunStarted, EventType::RunFailed]);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_with_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let log = LocalEventLog::new(dir.path().join("events"), 4).unwrap();
        let run_id = Uuid::new_v4();

        let mut stream = log.subscribe(run_id).await.unwrap();

        // Publish far past the buffer without polling the subscriber.
        for _ in 0..32 {
            log.append(run_id, EventType::OutputChunk, EventData::new())
                .await
                .unwrap();
        }

        let mut overflowed = false;
        while let Some(item) = stream.next().await {
            match item {
                SubscriptionItem::Event(_) => {}
                SubscriptionItem::Overflowed { skipped } => {
                    assert!(skipped > 0);
                    overflowed = true;
                    break;
                }
            }
        }
        assert!(overflowed, "expected the slow subscriber to be dropped");
    }

    #[tokio::test]
    async fn appends_to_distinct_runs_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let log = make_log(dir.path());
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        log.append(run_a, EventType::RunStarted, EventData::new())
            .await
            .unwrap();
        let b1 = log
            .append(run_b, EventType::RunStarted, EventData::new())
            .await
            .unwrap();

        assert_eq!(b1.seq, 1);
        assert_eq!(log.history(run_a).await.unwrap().len(), 1);
        assert_eq!(log.history(run_b).await.unwrap().len(), 1);
    }
}
