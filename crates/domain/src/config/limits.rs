use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits — admission caps, budgets, and bounded-queue sizes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum runs in flight across all tenants.
    #[serde(default = "d_global")]
    pub global_concurrency: usize,
    /// Maximum runs in flight per tenant.
    #[serde(default = "d_tenant")]
    pub tenant_concurrency: usize,
    /// Per-run model cost cap. `0.0` disables the budget check.
    #[serde(default)]
    pub run_model_budget: f64,
    /// Worker tasks draining the engine's ready queue.
    #[serde(default = "d_workers")]
    pub workers: usize,
    /// Capacity of the engine's ready queue. A full queue refuses admission.
    #[serde(default = "d_queue")]
    pub queue_capacity: usize,
    /// Per-subscriber event buffer. A subscriber that falls this far behind
    /// is dropped with an overflow signal rather than blocking publishers.
    #[serde(default = "d_sub_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global_concurrency: d_global(),
            tenant_concurrency: d_tenant(),
            run_model_budget: 0.0,
            workers: d_workers(),
            queue_capacity: d_queue(),
            subscriber_buffer: d_sub_buffer(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_global() -> usize {
    8
}
fn d_tenant() -> usize {
    2
}
fn d_workers() -> usize {
    4
}
fn d_queue() -> usize {
    64
}
fn d_sub_buffer() -> usize {
    256
}
