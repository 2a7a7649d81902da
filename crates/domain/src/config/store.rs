use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Data directory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root for events, snapshots, and workflow records (local mode).
    #[serde(default = "d_dir")]
    pub dir: PathBuf,
    /// Wipe the data directory on boot (dev / test installs).
    #[serde(default)]
    pub clear_on_startup: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: d_dir(),
            clear_on_startup: false,
        }
    }
}

fn d_dir() -> PathBuf {
    PathBuf::from("./data")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Distributed event store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStoreConfig {
    /// Redis address. Ignored in single-process mode.
    #[serde(default = "d_url")]
    pub url: String,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self { url: d_url() }
    }
}

fn d_url() -> String {
    "redis://127.0.0.1:6379".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Caches
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache retrieval results keyed by query.
    #[serde(default)]
    pub retrieval: bool,
    /// Cache read-only tool results, content-addressed by
    /// `(tool_name, canonical(arguments))`.
    #[serde(default)]
    pub tool_results: bool,
    /// Bound for each cache; oldest entries are evicted first.
    #[serde(default = "d_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retrieval: false,
            tool_results: false,
            max_entries: d_max_entries(),
        }
    }
}

fn d_max_entries() -> usize {
    256
}
