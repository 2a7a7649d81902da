//! Run lifecycle coordination: admission, wiring, approvals, cancellation,
//! and orphan resume at boot.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use rl_domain::error::Result;
use rl_domain::event::EventType;
use rl_domain::run::Identity;
use rl_domain::workflow::{ApprovalDecision, WorkflowState, WorkflowStatus};
use rl_eventlog::{EventLog, SubscriptionItem};

use crate::context::Services;
use crate::engine::WorkflowEngine;
use crate::executor::ToolExecutor;
use crate::limits::AdmissionLimiter;

/// A request to start a run, as received from the API surface.
#[derive(Debug, Clone)]
pub struct StartRun {
    /// Client-supplied id (idempotent re-posts); generated when absent.
    pub run_id: Option<Uuid>,
    pub message: String,
    pub context: Option<String>,
    pub mode: String,
    pub identity: Identity,
}

/// Why an admission was refused. No `run.started` is appended for any of
/// the refusal variants.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("run already exists")]
    AlreadyExists,
    #[error("rate limit exceeded: {scope}")]
    RateLimited { scope: String },
    #[error(transparent)]
    Internal(#[from] rl_domain::Error),
}

/// Control-plane failures for approvals and cancellation.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("run not found")]
    NotFound,
    #[error("run already terminated")]
    AlreadyTerminated,
    #[error(transparent)]
    Internal(#[from] rl_domain::Error),
}

pub struct Coordinator {
    services: Arc<Services>,
    engine: Arc<WorkflowEngine>,
    limiter: Arc<AdmissionLimiter>,
    /// Present in single-process mode; distributed deployments consume the
    /// durable queue instead.
    executor: Option<Arc<ToolExecutor>>,
}

impl Coordinator {
    pub fn new(
        services: Arc<Services>,
        engine: Arc<WorkflowEngine>,
        limiter: Arc<AdmissionLimiter>,
        executor: Option<Arc<ToolExecutor>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            services,
            engine,
            limiter,
            executor,
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Admission
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Admit and enqueue a run. Order matters: every refusal happens
    /// before `run.started` is appended.
    pub async fn start_run(
        &self,
        request: StartRun,
    ) -> std::result::Result<Uuid, AdmissionError> {
        if request.message.trim().is_empty() {
            return Err(AdmissionError::EmptyMessage);
        }
        let run_id = request.run_id.unwrap_or_else(Uuid::new_v4);

        if !self
            .services
            .log
            .history(run_id)
            .await
            .map_err(AdmissionError::Internal)?
            .is_empty()
        {
            return Err(AdmissionError::AlreadyExists);
        }

        let permit = match self.limiter.try_acquire(&request.identity.tenant_id) {
            Ok(permit) => permit,
            Err(scope) => {
                self.services
                    .emit(
                        run_id,
                        EventType::RateLimitExceeded,
                        json!({"scope": scope.as_str()}),
                    )
                    .await?;
                return Err(AdmissionError::RateLimited {
                    scope: scope.as_str().into(),
                });
            }
        };

        // A full ready queue refuses admission too.
        let Some(slot) = self.engine.reserve_slot() else {
            self.services
                .emit(
                    run_id,
                    EventType::RateLimitExceeded,
                    json!({"scope": "global"}),
                )
                .await?;
            return Err(AdmissionError::RateLimited {
                scope: "global".into(),
            });
        };

        self.services.projector.ensure(run_id);
        self.services
            .emit(
                run_id,
                EventType::RunStarted,
                json!({
                    "message": request.message,
                    "context": request.context,
                    "mode": request.mode,
                    "tenant_id": request.identity.tenant_id,
                    "user_id": request.identity.user_id,
                    "cost_limit": self.services.config.limits.run_model_budget,
                }),
            )
            .await?;

        self.wire_run(run_id);
        self.engine.admit(run_id, permit);
        slot.send(run_id);
        tracing::info!(%run_id, tenant = %request.identity.tenant_id, "run admitted");
        Ok(run_id)
    }

    /// Per-run background wiring: the projection pump (fold everything the
    /// bus delivers, including appends from other processes) and, in
    /// single-process mode, the tool executor subscription.
    fn wire_run(&self, run_id: Uuid) {
        let services = self.services.clone();
        tokio::spawn(async move {
            let Ok(mut stream) = services.log.subscribe(run_id).await else {
                return;
            };
            while let Some(item) = futures_util::StreamExt::next(&mut stream).await {
                match item {
                    SubscriptionItem::Event(event) => {
                        if let Err(e) = services.projector.apply(&event) {
                            tracing::warn!(%run_id, error = %e, "projection pump fold failed");
                        }
                    }
                    SubscriptionItem::Overflowed { skipped } => {
                        tracing::warn!(%run_id, skipped, "projection pump lagged; rebuilding");
                        if let Ok(history) = services.log.history(run_id).await {
                            let _ = services.projector.rebuild(run_id, &history);
                        }
                        return;
                    }
                }
            }
        });

        if let Some(executor) = &self.executor {
            executor.attach(run_id);
        }
    }

    /// Re-enqueue every non-terminal run found in the workflow store.
    /// Called once at process start.
    pub async fn resume_incomplete(&self) -> Result<usize> {
        let orphans = self.services.store.list_incomplete()?;
        let count = orphans.len();
        for wf in orphans {
            let run_id = wf.run_id;
            // Rebuild the snapshot so resumed activities see fresh truth.
            let history = self.services.log.history(run_id).await?;
            let state = self.services.projector.rebuild(run_id, &history)?;

            let permit = self.limiter.acquire_unchecked(&state.identity.tenant_id);
            self.wire_run(run_id);
            self.engine.admit(run_id, permit);
            self.engine.enqueue_wake(run_id).await;
            tracing::info!(%run_id, step = %wf.current_step, status = %wf.status, "resuming orphaned run");
        }
        Ok(count)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Approvals & cancellation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Record a human decision. On a terminated run this is a no-op with a
    /// well-defined error.
    pub async fn record_approval(
        &self,
        run_id: Uuid,
        decision: ApprovalDecision,
    ) -> std::result::Result<(), ControlError> {
        let mut wf = self.load_active(run_id)?;
        wf.human_decision = Some(decision);
        wf.touch();
        self.services.store.save(&wf)?;
        let decision_str = match decision {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
        };
        self.services
            .emit(
                run_id,
                EventType::WorkflowApprovalRecorded,
                json!({"decision": decision_str}),
            )
            .await?;
        self.engine.enqueue_wake(run_id).await;
        Ok(())
    }

    /// Cancel a run: terminal event first, then the workflow record. Any
    /// in-flight activity observes the token at its next suspension point;
    /// already-persisted events are kept.
    pub async fn cancel(&self, run_id: Uuid) -> std::result::Result<(), ControlError> {
        let mut wf = self.load_active(run_id)?;
        self.engine.cancels().cancel(run_id);
        self.services
            .emit(
                run_id,
                EventType::RunFailed,
                json!({
                    "error_type": "cancelled",
                    "reason": "cancelled",
                    "outcome": "failed",
                }),
            )
            .await?;
        wf.status = WorkflowStatus::Failed;
        wf.last_error = Some("cancelled".into());
        wf.clear_wait();
        wf.touch();
        self.services.store.save(&wf)?;
        self.engine.enqueue_wake(run_id).await;
        Ok(())
    }

    fn load_active(&self, run_id: Uuid) -> std::result::Result<WorkflowState, ControlError> {
        let Some(wf) = self.services.store.load(run_id)? else {
            return Err(ControlError::NotFound);
        };
        if wf.status.is_terminal() {
            return Err(ControlError::AlreadyTerminated);
        }
        Ok(wf)
    }
}
