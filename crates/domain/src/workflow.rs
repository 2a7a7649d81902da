//! Workflow records: the fixed step pipeline, per-step retry policy, and
//! the durable per-run workflow state.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventType;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The fixed pipeline. `MaybeApprove` is conditional: it only runs when the
/// plan marked the run as approval-requiring; otherwise `Verify` advances
/// straight to `Finalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Receive,
    Plan,
    Retrieve,
    Respond,
    Verify,
    MaybeApprove,
    Finalize,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::Receive,
        Step::Plan,
        Step::Retrieve,
        Step::Respond,
        Step::Verify,
        Step::MaybeApprove,
        Step::Finalize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Receive => "receive",
            Self::Plan => "plan",
            Self::Retrieve => "retrieve",
            Self::Respond => "respond",
            Self::Verify => "verify",
            Self::MaybeApprove => "maybe_approve",
            Self::Finalize => "finalize",
        }
    }

    /// The unconditional successor in the pipeline. `Verify` returns
    /// `Finalize` here; the verify adapter substitutes `MaybeApprove` when
    /// the run requires a human decision.
    pub fn next(self) -> Option<Step> {
        match self {
            Self::Receive => Some(Self::Plan),
            Self::Plan => Some(Self::Retrieve),
            Self::Retrieve => Some(Self::Respond),
            Self::Respond => Some(Self::Verify),
            Self::Verify => Some(Self::Finalize),
            Self::MaybeApprove => Some(Self::Finalize),
            Self::Finalize => None,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-step execution policy resolved from config.
#[derive(Debug, Clone, PartialEq)]
pub struct StepPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Hard wall-clock timeout for one activity invocation.
    pub timeout: Duration,
}

impl StepPolicy {
    /// Exponential backoff: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.backoff_base.saturating_mul(1u32 << exp);
        raw.min(self.backoff_cap)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    WaitingForEvent,
    WaitingForApproval,
    Retrying,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingForEvent => "waiting_for_event",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// Durable per-run workflow record.
///
/// Mostly a cache over the event log, with two additions the log does not
/// carry: the transient wait target (`pending_event_types` +
/// `wait_since_seq`) and the retry deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: Uuid,
    pub current_step: Step,
    pub status: WorkflowStatus,
    pub attempts: HashMap<Step, u32>,
    /// Event types that resume a `waiting_for_event` suspension. Any one
    /// arriving (with `seq > wait_since_seq`) wakes the run.
    pub pending_event_types: BTreeSet<EventType>,
    /// Only events newer than this satisfy the wait — types awaited by an
    /// earlier step must not wake a later one.
    #[serde(default)]
    pub wait_since_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_decision: Option<ApprovalDecision>,
    /// Deadline for a `retrying` suspension. A deadline that passed while
    /// the process was down schedules the step immediately on resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            current_step: Step::Receive,
            status: WorkflowStatus::Running,
            attempts: HashMap::from([(Step::Receive, 0)]),
            pending_event_types: BTreeSet::new(),
            wait_since_seq: 0,
            waiting_reason: None,
            human_decision: None,
            retry_at: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn attempt(&self, step: Step) -> u32 {
        self.attempts.get(&step).copied().unwrap_or(0)
    }

    pub fn bump_attempt(&mut self, step: Step) -> u32 {
        let n = self.attempts.entry(step).or_insert(0);
        *n += 1;
        *n
    }

    /// Clear any suspension bookkeeping when the run resumes or advances.
    pub fn clear_wait(&mut self) {
        self.pending_event_types.clear();
        self.wait_since_seq = 0;
        self.waiting_reason = None;
        self.retry_at = None;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
