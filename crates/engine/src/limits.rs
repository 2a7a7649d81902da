//! Admission limits — global and per-tenant concurrency counters.
//!
//! Counting semaphore semantics with named scopes so refusals can say which
//! cap was hit (`rate.limit.exceeded{scope}`).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Which cap refused an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    Tenant,
}

impl LimitScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Tenant => "tenant",
        }
    }
}

#[derive(Debug)]
struct Counters {
    global: usize,
    per_tenant: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct AdmissionLimiter {
    global_cap: usize,
    tenant_cap: usize,
    counters: Mutex<Counters>,
}

/// Held for the lifetime of an admitted run; releases both counters on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    limiter: Arc<AdmissionLimiter>,
    tenant_id: String,
}

impl AdmissionLimiter {
    pub fn new(global_cap: usize, tenant_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            global_cap: global_cap.max(1),
            tenant_cap: tenant_cap.max(1),
            counters: Mutex::new(Counters {
                global: 0,
                per_tenant: HashMap::new(),
            }),
        })
    }

    /// Admit a run for `tenant_id`, or report which cap refused it.
    pub fn try_acquire(
        self: &Arc<Self>,
        tenant_id: &str,
    ) -> Result<AdmissionPermit, LimitScope> {
        let mut counters = self.counters.lock();
        if counters.global >= self.global_cap {
            return Err(LimitScope::Global);
        }
        let tenant = counters.per_tenant.entry(tenant_id.to_owned()).or_insert(0);
        if *tenant >= self.tenant_cap {
            return Err(LimitScope::Tenant);
        }
        *tenant += 1;
        counters.global += 1;
        Ok(AdmissionPermit {
            limiter: self.clone(),
            tenant_id: tenant_id.to_owned(),
        })
    }

    /// Admit without cap checks. Used when resuming persisted runs at boot:
    /// they were admitted before the restart and must not be re-refused.
    pub fn acquire_unchecked(self: &Arc<Self>, tenant_id: &str) -> AdmissionPermit {
        let mut counters = self.counters.lock();
        *counters.per_tenant.entry(tenant_id.to_owned()).or_insert(0) += 1;
        counters.global += 1;
        AdmissionPermit {
            limiter: self.clone(),
            tenant_id: tenant_id.to_owned(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.counters.lock().global
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut counters = self.limiter.counters.lock();
        counters.global = counters.global.saturating_sub(1);
        if let Some(count) = counters.per_tenant.get_mut(&self.tenant_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.per_tenant.remove(&self.tenant_id);
            }
        }
    }
}
