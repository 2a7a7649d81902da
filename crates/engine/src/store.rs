//! Durable workflow state store: one JSON document per run.
//!
//! Writes go through a temp-file + rename so readers never observe a
//! partially written record. `list_incomplete` backs orphan resume at boot.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use rl_domain::error::{Error, Result};
use rl_domain::workflow::WorkflowState;

pub struct WorkflowStore {
    dir: PathBuf,
}

impl WorkflowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    pub fn load(&self, run_id: Uuid) -> Result<Option<WorkflowState>> {
        let path = self.path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let state = serde_json::from_str(&content).map_err(|e| Error::WorkflowStateCorrupt {
            run_id,
            message: e.to_string(),
        })?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &WorkflowState) -> Result<()> {
        atomic_write_json(&self.path(state.run_id), state)
    }

    /// Every persisted run whose workflow has not reached a terminal
    /// status. Consulted at process start so orphaned runs resume.
    pub fn list_incomplete(&self) -> Result<Vec<WorkflowState>> {
        let mut incomplete = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<WorkflowState>(&content) {
                Ok(state) if !state.status.is_terminal() => incomplete.push(state),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt workflow record");
                }
            }
        }
        incomplete.sort_by_key(|s| s.updated_at);
        Ok(incomplete)
    }
}

/// Write `value` as JSON via a sibling temp file and an atomic rename.
pub(crate) fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
