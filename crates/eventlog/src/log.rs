use std::pin::Pin;

use uuid::Uuid;

use rl_domain::error::Result;
use rl_domain::event::{Event, EventData, EventType};

/// One item observed by a subscriber.
#[derive(Debug, Clone)]
pub enum SubscriptionItem {
    Event(Event),
    /// The subscriber fell behind its bounded buffer and was dropped.
    /// No further items follow; re-subscribe to replay from the start.
    Overflowed { skipped: u64 },
}

/// A finite-or-live sequence of subscription items.
pub type EventStream = Pin<Box<dyn futures_core::Stream<Item = SubscriptionItem> + Send>>;

/// The append-only per-run event log.
///
/// Contract (identical across transports):
/// - `append` assigns `seq = max(existing) + 1` atomically per run,
///   persists the event, **then** broadcasts it. Persistence failures
///   surface as [`rl_domain::Error::EventStoreUnavailable`]; broadcast
///   failures never fail an append.
/// - `history` returns the persisted prefix in seq order.
/// - `subscribe` yields the full history first, then live events, strictly
///   seq-increasing with no gap and no duplicate at the splice point. The
///   stream ends after a terminal event, on overflow, or when dropped.
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, run_id: Uuid, kind: EventType, data: EventData) -> Result<Event>;

    async fn history(&self, run_id: Uuid) -> Result<Vec<Event>>;

    async fn subscribe(&self, run_id: Uuid) -> Result<EventStream>;
}
