//! The event substrate: an append-only per-run log with persist-first
//! broadcast and replay-plus-tail subscriptions.
//!
//! Two transports share the [`EventLog`] contract:
//! - [`local::LocalEventLog`] — JSONL files plus in-process fan-out.
//! - [`distributed::RedisEventLog`] — a redis list per run plus a notify
//!   channel, for multi-process deployments.

pub mod distributed;
pub mod local;
mod log;

pub use distributed::RedisEventLog;
pub use local::LocalEventLog;
pub use log::{EventLog, EventStream, SubscriptionItem};
