//! The durable run engine: projector, workflow store, step scheduler,
//! activity adapters, tool executor, and run lifecycle coordination.
//!
//! Transport-agnostic by construction — everything talks to the event
//! substrate through `rl_eventlog::EventLog`, and the distributed tool
//! queue slots in behind [`context::ToolQueueProducer`].

pub mod activity;
pub mod cache;
pub mod cancel;
pub mod context;
pub mod coordinator;
pub mod engine;
pub mod executor;
pub mod limits;
pub mod locks;
pub mod projection;
pub mod queue;
pub mod store;

pub use activity::{derive_request_id, ActivityResult};
pub use cancel::{CancelMap, CancelToken};
pub use context::{Services, ToolQueueProducer};
pub use coordinator::{AdmissionError, ControlError, Coordinator, StartRun};
pub use engine::WorkflowEngine;
pub use executor::ToolExecutor;
pub use limits::{AdmissionLimiter, LimitScope};
pub use projection::Projector;
pub use queue::RedisToolQueue;
pub use store::WorkflowStore;
