//! Bounded content-addressed caches for read-only tool results and
//! retrieval hits.
//!
//! Keys are sha256 digests over a canonical JSON rendering, so two
//! requests with the same logical arguments hit the same entry regardless
//! of key order. Eviction is oldest-insertion-first; the policy lives
//! behind this struct and can be swapped without touching callers.

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub struct BoundedCache {
    max_entries: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<String, Value>,
    order: VecDeque<String>,
}

impl BoundedCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Insert if absent (first writer wins), evicting the oldest entry when
    /// the bound is reached.
    pub fn insert(&self, key: String, value: Value) {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&key) {
            return;
        }
        if inner.entries.len() >= self.max_entries {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content addressing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `sha256(name + canonical(arguments))`, hex-encoded.
pub fn content_key(name: &str, arguments: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical(arguments).as_bytes());
    hex::encode(hasher.finalize())
}

/// Render a JSON value with object keys sorted at every level.
fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            let body: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), v))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}
