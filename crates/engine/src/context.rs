//! Shared service handles threaded through the engine, activities, and the
//! tool executor.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use rl_collab::{
    Guardrail, ModelStreamer, PermissionGate, Planner, Retriever, ToolRegistry,
};
use rl_domain::config::Config;
use rl_domain::error::Result;
use rl_domain::event::{payload, Event, EventType};
use rl_domain::run::RunState;
use rl_domain::tool::ToolRequest;
use rl_domain::workflow::Step;
use rl_eventlog::EventLog;

use crate::cache::BoundedCache;
use crate::cancel::CancelToken;
use crate::projection::Projector;
use crate::store::WorkflowStore;

/// Producer side of the distributed tool queue (§4.G). `None` in
/// single-process mode, where the executor consumes the event bus directly.
#[async_trait::async_trait]
pub trait ToolQueueProducer: Send + Sync {
    async fn enqueue(&self, request: &ToolRequest) -> Result<()>;
}

/// Everything the engine and its activities depend on.
pub struct Services {
    pub config: Arc<Config>,
    pub log: Arc<dyn EventLog>,
    pub projector: Arc<Projector>,
    pub store: Arc<WorkflowStore>,

    pub planner: Arc<dyn Planner>,
    pub retriever: Arc<dyn Retriever>,
    pub streamer: Arc<dyn ModelStreamer>,
    pub guardrail: Arc<dyn Guardrail>,
    pub gate: Arc<dyn PermissionGate>,
    pub registry: Arc<ToolRegistry>,

    pub tool_queue: Option<Arc<dyn ToolQueueProducer>>,
    pub retrieval_cache: Option<Arc<BoundedCache>>,
}

impl Services {
    /// Append an event and fold it into the snapshot in one motion, so the
    /// next read inside the same step observes it.
    pub async fn emit(&self, run_id: Uuid, kind: EventType, data: Value) -> Result<Event> {
        let event = self.log.append(run_id, kind, payload(data)).await?;
        self.projector.apply(&event)?;
        Ok(event)
    }

    /// Latest snapshot, rebuilding from the log when the cache is missing
    /// or stale (crash recovery).
    pub async fn snapshot(&self, run_id: Uuid) -> Result<RunState> {
        if let Some(state) = self.projector.get(run_id) {
            return Ok(state);
        }
        let history = self.log.history(run_id).await?;
        self.projector.rebuild(run_id, &history)
    }
}

/// Per-invocation context handed to an activity adapter.
pub struct ActivityCtx {
    pub services: Arc<Services>,
    pub run_id: Uuid,
    pub step: Step,
    /// Attempt number for this invocation (1-based).
    pub attempt: u32,
    /// Fresh projection at invocation time.
    pub state: RunState,
    /// Recorded human decision, if any (approval gate).
    pub human_decision: Option<rl_domain::workflow::ApprovalDecision>,
    pub cancel: CancelToken,
}

impl ActivityCtx {
    pub async fn emit(&self, kind: EventType, data: Value) -> Result<Event> {
        self.services.emit(self.run_id, kind, data).await
    }
}
