use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::workflow::{Step, StepPolicy};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry / step policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-step retry and timeout policy.
///
/// The `max_attempts` / `backoff_base_secs` maps hold per-step overrides;
/// steps without an entry use the defaults. Conservative defaults: two
/// attempts for collaborator-facing steps, one for the bookkeeping steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_backoff_cap")]
    pub backoff_cap_secs: f64,
    /// Hard wall-clock timeout for a single activity invocation.
    #[serde(default = "d_step_timeout")]
    pub step_timeout_secs: f64,
    /// Per-invocation timeout for tool servers.
    #[serde(default = "d_tool_timeout")]
    pub tool_timeout_secs: f64,
    #[serde(default = "d_max_attempts")]
    pub max_attempts: HashMap<Step, u32>,
    #[serde(default = "d_backoff_base")]
    pub backoff_base_secs: HashMap<Step, f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_cap_secs: d_backoff_cap(),
            step_timeout_secs: d_step_timeout(),
            tool_timeout_secs: d_tool_timeout(),
            max_attempts: d_max_attempts(),
            backoff_base_secs: d_backoff_base(),
        }
    }
}

impl RetryConfig {
    pub fn max_attempts_for(&self, step: Step) -> u32 {
        self.max_attempts.get(&step).copied().unwrap_or(1).max(1)
    }

    pub fn backoff_base_for(&self, step: Step) -> Duration {
        let secs = self
            .backoff_base_secs
            .get(&step)
            .copied()
            .unwrap_or(0.5)
            .max(0.0);
        Duration::from_secs_f64(secs)
    }

    pub fn policy_for(&self, step: Step) -> StepPolicy {
        StepPolicy {
            max_attempts: self.max_attempts_for(step),
            backoff_base: self.backoff_base_for(step),
            backoff_cap: Duration::from_secs_f64(self.backoff_cap_secs.max(0.0)),
            timeout: Duration::from_secs_f64(self.step_timeout_secs.max(0.1)),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_attempts() -> HashMap<Step, u32> {
    HashMap::from([
        (Step::Receive, 1),
        (Step::Plan, 2),
        (Step::Retrieve, 2),
        (Step::Respond, 2),
        (Step::Verify, 1),
        (Step::MaybeApprove, 1),
        (Step::Finalize, 1),
    ])
}

fn d_backoff_base() -> HashMap<Step, f64> {
    Step::ALL.iter().map(|s| (*s, 0.5)).collect()
}

fn d_backoff_cap() -> f64 {
    30.0
}

fn d_step_timeout() -> f64 {
    120.0
}

fn d_tool_timeout() -> f64 {
    30.0
}
