//! The workflow engine: a worker pool over a bounded ready queue, driving
//! runs through the fixed pipeline one step at a time.
//!
//! Parallel across runs, serial per run (per-run lock). Suspension is a
//! persisted data transition — waits and retry deadlines live in the
//! workflow record, and watcher/timer tasks merely re-enqueue the run.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tracing::Instrument;
use uuid::Uuid;

use rl_domain::error::{ErrorKind, Result, RunError};
use rl_domain::event::EventType;
use rl_domain::run::Outcome;
use rl_domain::workflow::{Step, WorkflowState, WorkflowStatus};
use rl_eventlog::{EventLog, SubscriptionItem};

use crate::activity::{self, ActivityResult};
use crate::cancel::CancelMap;
use crate::context::{ActivityCtx, Services};
use crate::limits::AdmissionPermit;
use crate::locks::RunLockMap;

pub struct WorkflowEngine {
    services: Arc<Services>,
    ready_tx: mpsc::Sender<Uuid>,
    locks: Arc<RunLockMap>,
    cancels: Arc<CancelMap>,
    /// Admission permits held until the run terminates.
    permits: Mutex<HashMap<Uuid, AdmissionPermit>>,
    /// Guards: at most one wait-watcher / retry-timer per run.
    watchers: Mutex<HashSet<Uuid>>,
    timers: Mutex<HashSet<Uuid>>,
}

impl WorkflowEngine {
    /// Build the engine and spawn its dispatcher + worker pool.
    pub fn start(services: Arc<Services>, cancels: Arc<CancelMap>) -> Arc<Self> {
        let limits = &services.config.limits;
        let (ready_tx, mut ready_rx) = mpsc::channel::<Uuid>(limits.queue_capacity.max(1));
        let workers = Arc::new(Semaphore::new(limits.workers.max(1)));

        let engine = Arc::new(Self {
            services,
            ready_tx,
            locks: Arc::new(RunLockMap::new()),
            cancels,
            permits: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashSet::new()),
            timers: Mutex::new(HashSet::new()),
        });

        let dispatcher = engine.clone();
        tokio::spawn(async move {
            while let Some(run_id) = ready_rx.recv().await {
                let slot = workers
                    .clone()
                    .acquire_owned()
                    .await
                    .unwrap_or_else(|_| unreachable!("worker semaphore closed"));
                let engine = dispatcher.clone();
                tokio::spawn(async move {
                    engine.drive(run_id).await;
                    drop(slot);
                });
            }
        });

        engine
    }

    /// Reserve a ready-queue slot for admission. `None` means the queue is
    /// full and the coordinator must refuse the run.
    pub fn reserve_slot(&self) -> Option<mpsc::OwnedPermit<Uuid>> {
        self.ready_tx.clone().try_reserve_owned().ok()
    }

    /// Attach the admission permit released when the run terminates.
    pub fn admit(&self, run_id: Uuid, permit: AdmissionPermit) {
        self.permits.lock().insert(run_id, permit);
    }

    /// Internal wake-up path (watchers, timers, approvals, cancellation).
    /// Waits for queue space rather than dropping the wake.
    pub(crate) async fn enqueue_wake(&self, run_id: Uuid) {
        if self.ready_tx.send(run_id).await.is_err() {
            tracing::error!(%run_id, "ready queue closed; wake dropped");
        }
    }

    pub fn cancels(&self) -> &CancelMap {
        &self.cancels
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Drive loop
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn drive(self: Arc<Self>, run_id: Uuid) {
        let _guard = self.locks.acquire(run_id).await;
        if let Err(e) = self.drive_locked(run_id).await {
            // Divergence from durable truth is worse than a restart: the
            // recovery path re-reads persisted state and resumes cleanly.
            tracing::error!(%run_id, error = %e, "durable store failure; terminating process");
            std::process::exit(70);
        }
    }

    async fn drive_locked(self: &Arc<Self>, run_id: Uuid) -> Result<()> {
        loop {
            let mut wf = match self.services.store.load(run_id)? {
                Some(wf) => wf,
                None => {
                    let wf = WorkflowState::new(run_id);
                    self.services.store.save(&wf)?;
                    self.services
                        .emit(run_id, EventType::WorkflowStarted, json!({}))
                        .await?;
                    wf
                }
            };
            if wf.status.is_terminal() {
                self.cleanup(run_id);
                return Ok(());
            }

            // Converge with a terminal event written elsewhere
            // (cancellation, or an activity that terminated the run).
            let snapshot = self.services.snapshot(run_id).await?;
            if snapshot.is_terminated() {
                wf.status = if snapshot.outcome == Some(Outcome::Success) {
                    WorkflowStatus::Completed
                } else {
                    WorkflowStatus::Failed
                };
                wf.clear_wait();
                wf.touch();
                self.services.store.save(&wf)?;
                self.cleanup(run_id);
                return Ok(());
            }

            // Resuming from a wait re-invokes the same attempt; fresh entry
            // and retry bump the counter.
            let mut bump = true;
            match wf.status {
                WorkflowStatus::Running => {}
                WorkflowStatus::WaitingForEvent => {
                    let history = self.services.log.history(run_id).await?;
                    let satisfied = history.iter().any(|e| {
                        e.seq > wf.wait_since_seq && wf.pending_event_types.contains(&e.kind)
                    });
                    if !satisfied {
                        self.spawn_watcher(
                            run_id,
                            wf.pending_event_types.clone(),
                            wf.wait_since_seq,
                        );
                        return Ok(());
                    }
                    wf.status = WorkflowStatus::Running;
                    wf.clear_wait();
                    bump = false;
                }
                WorkflowStatus::WaitingForApproval => {
                    if wf.human_decision.is_none() {
                        self.spawn_watcher(
                            run_id,
                            BTreeSet::from([EventType::WorkflowApprovalRecorded]),
                            wf.wait_since_seq,
                        );
                        return Ok(());
                    }
                    wf.status = WorkflowStatus::Running;
                    wf.clear_wait();
                    bump = false;
                }
                WorkflowStatus::Retrying => {
                    if let Some(at) = wf.retry_at {
                        if Utc::now() < at {
                            self.spawn_timer(run_id, at);
                            return Ok(());
                        }
                    }
                    // A deadline that passed while the process was down
                    // schedules the step immediately.
                    wf.status = WorkflowStatus::Running;
                    wf.retry_at = None;
                }
                WorkflowStatus::Completed | WorkflowStatus::Failed => unreachable!(),
            }

            let step = wf.current_step;
            if bump {
                wf.bump_attempt(step);
            }
            let attempt = wf.attempt(step).max(1);
            wf.touch();
            self.services.store.save(&wf)?;

            self.services
                .emit(
                    run_id,
                    EventType::WorkflowStepStarted,
                    json!({"step": step.as_str(), "attempt": attempt}),
                )
                .await?;

            let policy = self.services.config.retry.policy_for(step);
            let ctx = ActivityCtx {
                services: self.services.clone(),
                run_id,
                step,
                attempt,
                state: self.services.snapshot(run_id).await?,
                human_decision: wf.human_decision,
                cancel: self.cancels.token(run_id),
            };

            let span = tracing::info_span!("step", %run_id, step = step.as_str(), attempt);
            let result =
                match tokio::time::timeout(policy.timeout, activity::run(&ctx).instrument(span))
                    .await
                {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => ActivityResult::Transient(RunError::new(
                        ErrorKind::Timeout,
                        format!("step {step} exceeded its wall-clock budget"),
                    )),
                };

            // A cancellation may have landed while the activity ran; the
            // loop top converges on the terminal event.
            if self.services.snapshot(run_id).await?.is_terminated() {
                continue;
            }

            match result {
                ActivityResult::Next(next) => {
                    self.services
                        .emit(
                            run_id,
                            EventType::WorkflowStepCompleted,
                            json!({"step": step.as_str()}),
                        )
                        .await?;
                    wf.current_step = next;
                    wf.status = WorkflowStatus::Running;
                    wf.attempts.entry(next).or_insert(0);
                    wf.clear_wait();
                    wf.touch();
                    self.services.store.save(&wf)?;
                }
                ActivityResult::Done => {
                    self.services
                        .emit(
                            run_id,
                            EventType::WorkflowStepCompleted,
                            json!({"step": step.as_str()}),
                        )
                        .await?;
                    self.services
                        .emit(run_id, EventType::WorkflowCompleted, json!({}))
                        .await?;
                    self.services
                        .emit(run_id, EventType::RunCompleted, json!({"outcome": "success"}))
                        .await?;
                    wf.status = WorkflowStatus::Completed;
                    wf.clear_wait();
                    wf.touch();
                    self.services.store.save(&wf)?;
                    self.cleanup(run_id);
                    return Ok(());
                }
                ActivityResult::Fatal(err) => {
                    self.fail_run(run_id, &mut wf, step, err).await?;
                    return Ok(());
                }
                ActivityResult::Transient(err) => {
                    let attempts = wf.attempt(step);
                    if attempts < policy.max_attempts {
                        let backoff = policy.backoff(attempts);
                        wf.status = WorkflowStatus::Retrying;
                        wf.retry_at = Some(
                            Utc::now() + chrono::Duration::milliseconds(backoff.as_millis() as i64),
                        );
                        wf.last_error = Some(err.to_string());
                        wf.touch();
                        self.services.store.save(&wf)?;
                        self.services
                            .emit(
                                run_id,
                                EventType::WorkflowRetrying,
                                json!({
                                    "step": step.as_str(),
                                    "attempt": attempts,
                                    "backoff_seconds": backoff.as_secs_f64(),
                                }),
                            )
                            .await?;
                        if let Some(at) = wf.retry_at {
                            self.spawn_timer(run_id, at);
                        }
                        return Ok(());
                    }
                    self.fail_run(run_id, &mut wf, step, err).await?;
                    return Ok(());
                }
                ActivityResult::WaitForEvents { types, reason } => {
                    // The wait is satisfied only by events the activity had
                    // not yet observed; anything it already folded (earlier
                    // attempts' terminators included) must not wake it.
                    let since = ctx.state.last_applied_seq;
                    wf.status = WorkflowStatus::WaitingForEvent;
                    wf.pending_event_types = types.clone();
                    wf.wait_since_seq = since;
                    wf.waiting_reason = Some(reason.clone());
                    wf.touch();
                    self.services.store.save(&wf)?;
                    let names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
                    self.services
                        .emit(
                            run_id,
                            EventType::WorkflowWaitingForEvent,
                            json!({"event_types": names, "reason": reason}),
                        )
                        .await?;
                    self.spawn_watcher(run_id, types, since);
                    return Ok(());
                }
                ActivityResult::WaitForApproval { reason } => {
                    let since = ctx.state.last_applied_seq;
                    wf.status = WorkflowStatus::WaitingForApproval;
                    wf.wait_since_seq = since;
                    wf.waiting_reason = Some(reason.clone());
                    wf.touch();
                    self.services.store.save(&wf)?;
                    self.services
                        .emit(
                            run_id,
                            EventType::WorkflowWaitingForApproval,
                            json!({"reason": reason}),
                        )
                        .await?;
                    self.spawn_watcher(
                        run_id,
                        BTreeSet::from([EventType::WorkflowApprovalRecorded]),
                        since,
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        wf: &mut WorkflowState,
        step: Step,
        err: RunError,
    ) -> Result<()> {
        self.services
            .emit(
                run_id,
                EventType::WorkflowStepCompleted,
                json!({"step": step.as_str(), "error": err.kind.as_str()}),
            )
            .await?;
        self.services
            .emit(
                run_id,
                EventType::WorkflowFailed,
                json!({"error_type": err.kind.as_str(), "reason": err.message}),
            )
            .await?;

        // Exactly one terminal event per run: skip synthesis if one is
        // already in the log (e.g. cancellation raced this step).
        if !self.services.snapshot(run_id).await?.is_terminated() {
            let outcome = if err.kind == ErrorKind::Refusal {
                "refusal"
            } else {
                "failed"
            };
            self.services
                .emit(
                    run_id,
                    EventType::RunFailed,
                    json!({
                        "error_type": err.kind.as_str(),
                        "reason": err.message,
                        "outcome": outcome,
                        "verification_reason": err.message,
                    }),
                )
                .await?;
        }

        wf.status = WorkflowStatus::Failed;
        wf.last_error = Some(err.to_string());
        wf.clear_wait();
        wf.touch();
        self.services.store.save(wf)?;
        self.cleanup(run_id);
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Wake sources
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Watch the run's stream and re-enqueue it when an awaited event (or a
    /// terminal event) arrives. Every observed event is also folded into
    /// the projection, which keeps cross-process appends visible locally.
    fn spawn_watcher(self: &Arc<Self>, run_id: Uuid, types: BTreeSet<EventType>, since: u64) {
        if !self.watchers.lock().insert(run_id) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.services.log.subscribe(run_id).await {
                Ok(mut stream) => {
                    while let Some(item) = futures_util::StreamExt::next(&mut stream).await {
                        match item {
                            SubscriptionItem::Event(event) => {
                                if let Err(e) = engine.services.projector.apply(&event) {
                                    tracing::warn!(%run_id, error = %e, "watcher fold failed");
                                }
                                let wakes = event.is_terminal()
                                    || (event.seq > since && types.contains(&event.kind));
                                if wakes {
                                    break;
                                }
                            }
                            SubscriptionItem::Overflowed { skipped } => {
                                tracing::warn!(%run_id, skipped, "watcher lagged; re-evaluating");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(%run_id, error = %e, "watcher subscription failed");
                }
            }
            engine.watchers.lock().remove(&run_id);
            engine.enqueue_wake(run_id).await;
        });
    }

    fn spawn_timer(self: &Arc<Self>, run_id: Uuid, at: DateTime<Utc>) {
        if !self.timers.lock().insert(run_id) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            let now = Utc::now();
            if at > now {
                if let Ok(wait) = (at - now).to_std() {
                    tokio::time::sleep(wait).await;
                }
            }
            engine.timers.lock().remove(&run_id);
            engine.enqueue_wake(run_id).await;
        });
    }

    fn cleanup(&self, run_id: Uuid) {
        self.cancels.remove(run_id);
        self.permits.lock().remove(&run_id);
        self.locks.prune_idle();
    }
}
