//! Configuration: sectioned structs with serde defaults, environment
//! overrides for the enumerated deployment knobs, and startup validation.

mod engine;
mod limits;
mod server;
mod store;

pub use engine::*;
pub use limits::*;
pub use server::*;
pub use store::*;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::workflow::Step;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Transport selection: one process with in-memory fan-out, or a shared
/// redis store with cross-process delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    #[default]
    SingleProcess,
    Distributed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mode: EngineMode,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub event_store: EventStoreConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Apply the enumerated environment overrides on top of whatever the
    /// config file provided. Unknown or unparsable values are logged and
    /// skipped — a typo'd knob must not silently change behavior.
    pub fn apply_env_overrides(&mut self, vars: &HashMap<String, String>) {
        if let Some(v) = vars.get("MODE") {
            match v.as_str() {
                "single_process" => self.mode = EngineMode::SingleProcess,
                "distributed" => self.mode = EngineMode::Distributed,
                other => tracing::warn!(value = other, "ignoring unknown MODE"),
            }
        }
        if let Some(v) = vars.get("EVENT_STORE_URL") {
            self.event_store.url = v.clone();
        }
        if let Some(v) = parse(vars, "GLOBAL_CONCURRENCY") {
            self.limits.global_concurrency = v;
        }
        if let Some(v) = parse(vars, "TENANT_CONCURRENCY") {
            self.limits.tenant_concurrency = v;
        }
        if let Some(v) = parse(vars, "RUN_MODEL_BUDGET") {
            self.limits.run_model_budget = v;
        }
        if let Some(v) = parse(vars, "CACHE_RETRIEVAL") {
            self.cache.retrieval = v;
        }
        if let Some(v) = parse(vars, "CACHE_TOOL_RESULTS") {
            self.cache.tool_results = v;
        }
        if let Some(v) = parse(vars, "CLEAR_DATA_ON_STARTUP") {
            self.data.clear_on_startup = v;
        }
        for step in Step::ALL {
            let suffix = step.as_str().to_uppercase();
            if let Some(v) = parse(vars, &format!("MAX_ATTEMPTS_{suffix}")) {
                self.retry.max_attempts.insert(step, v);
            }
            if let Some(v) = parse(vars, &format!("BACKOFF_BASE_{suffix}")) {
                self.retry.backoff_base_secs.insert(step, v);
            }
        }
    }

    /// Defaults plus overrides from the process environment.
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let mut config = Self::default();
        config.apply_env_overrides(&vars);
        config
    }
}

fn parse<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = vars.get(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = raw.as_str(), "ignoring unparsable override");
            None
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        let mut check = |ok: bool, severity: ConfigSeverity, field: &str, message: &str| {
            if !ok {
                issues.push(ConfigIssue {
                    severity,
                    field: field.into(),
                    message: message.into(),
                });
            }
        };

        use ConfigSeverity::{Error, Warning};
        check(
            self.limits.global_concurrency > 0,
            Error,
            "limits.global_concurrency",
            "must be at least 1",
        );
        check(
            self.limits.tenant_concurrency > 0,
            Error,
            "limits.tenant_concurrency",
            "must be at least 1",
        );
        check(
            self.limits.workers > 0,
            Error,
            "limits.workers",
            "must be at least 1",
        );
        check(
            self.mode != EngineMode::Distributed || !self.event_store.url.is_empty(),
            Error,
            "event_store.url",
            "required when mode = distributed",
        );
        check(
            self.retry.backoff_cap_secs > 0.0,
            Error,
            "retry.backoff_cap_secs",
            "must be positive",
        );
        check(
            self.limits.tenant_concurrency <= self.limits.global_concurrency,
            Warning,
            "limits.tenant_concurrency",
            "exceeds global_concurrency and can never be reached",
        );
        check(
            self.limits.run_model_budget >= 0.0,
            Warning,
            "limits.run_model_budget",
            "negative budget treated as disabled",
        );

        issues
    }
}
