//! Assemble the engine stack for the configured transport.

use std::sync::Arc;

use anyhow::Context;

use rl_collab::{
    EnvPermissionGate, HeuristicPlanner, PatternGuardrail, StaticRetriever, TemplateStreamer,
    ToolRegistry,
};
use rl_domain::config::{Config, EngineMode};
use rl_engine::cache::BoundedCache;
use rl_engine::{
    AdmissionLimiter, CancelMap, CancelToken, Coordinator, Projector, RedisToolQueue, Services,
    ToolExecutor, WorkflowEngine,
};
use rl_eventlog::{EventLog, LocalEventLog, RedisEventLog};

use crate::state::AppState;

/// Build the full application state: transports, collaborators, engine,
/// coordinator. Also resumes orphaned runs from the workflow store.
pub async fn build(config: Arc<Config>) -> anyhow::Result<AppState> {
    let data_dir = &config.data.dir;
    if config.data.clear_on_startup && data_dir.exists() {
        tracing::warn!(dir = %data_dir.display(), "clearing data directory");
        std::fs::remove_dir_all(data_dir).context("clearing data directory")?;
    }
    std::fs::create_dir_all(data_dir).context("creating data directory")?;

    // ── Event substrate ──────────────────────────────────────────────
    let log: Arc<dyn EventLog> = match config.mode {
        EngineMode::SingleProcess => Arc::new(
            LocalEventLog::new(data_dir.join("events"), config.limits.subscriber_buffer)
                .context("opening local event log")?,
        ),
        EngineMode::Distributed => Arc::new(
            RedisEventLog::connect(&config.event_store.url)
                .await
                .context("connecting to the distributed event store")?,
        ),
    };
    let projector = Arc::new(Projector::new(data_dir.join("state"))?);
    let store = Arc::new(rl_engine::WorkflowStore::new(data_dir.join("workflow"))?);

    // ── Collaborators (offline built-ins) ────────────────────────────
    let registry = Arc::new(ToolRegistry::with_builtin());
    let retrieval_cache = config
        .cache
        .retrieval
        .then(|| Arc::new(BoundedCache::new(config.cache.max_entries)));

    // ── Distributed tool queue ───────────────────────────────────────
    let tool_queue = match config.mode {
        EngineMode::SingleProcess => None,
        EngineMode::Distributed => {
            let consumer = format!("worker-{}", uuid::Uuid::new_v4().simple());
            let queue = Arc::new(
                RedisToolQueue::connect(&config.event_store.url, consumer)
                    .await
                    .context("connecting to the tool queue")?,
            );
            Some(queue)
        }
    };

    let services = Arc::new(Services {
        config: config.clone(),
        log,
        projector,
        store,
        planner: Arc::new(HeuristicPlanner::new()),
        retriever: Arc::new(StaticRetriever::with_default_corpus()),
        streamer: Arc::new(TemplateStreamer::default()),
        guardrail: Arc::new(PatternGuardrail::new()),
        gate: Arc::new(EnvPermissionGate::from_process_env()),
        registry,
        tool_queue: tool_queue
            .clone()
            .map(|q| q as Arc<dyn rl_engine::ToolQueueProducer>),
        retrieval_cache,
    });

    // ── Engine + executor + coordinator ──────────────────────────────
    let cancels = Arc::new(CancelMap::new());
    let engine = WorkflowEngine::start(services.clone(), cancels);
    let limiter = AdmissionLimiter::new(
        config.limits.global_concurrency,
        config.limits.tenant_concurrency,
    );

    let executor = ToolExecutor::new(services.clone());
    let local_executor = match config.mode {
        EngineMode::SingleProcess => Some(executor.clone()),
        EngineMode::Distributed => {
            // Workers consume the durable stream instead of the bus.
            if let Some(queue) = tool_queue {
                tokio::spawn(queue.run_worker(executor, CancelToken::new()));
            }
            None
        }
    };

    let coordinator = Coordinator::new(services.clone(), engine, limiter, local_executor);

    let resumed = coordinator.resume_incomplete().await?;
    if resumed > 0 {
        tracing::info!(resumed, "re-enqueued orphaned runs");
    }

    Ok(AppState {
        config,
        services,
        coordinator,
    })
}
