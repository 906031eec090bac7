use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Echo of the run parameters that shaped a checkpoint, kept so an operator
/// can tell whether a resume is being run with compatible filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub only_latest: bool,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Running,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub timestamp: DateTime<Utc>,
    pub processed_schemes: Vec<String>,
    pub total_written: u64,
    pub total_errors: u64,
    pub completed: u64,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub args: RunParams,
}

/// Persists run progress between batches so an interrupted run can resume.
/// Saves are best-effort: losing one checkpoint write costs redone work on
/// the next resume, never correctness, because all writes are idempotent.
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &CheckpointState) {
        let serialized = match serde_json::to_string_pretty(state) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to serialize checkpoint");
                return;
            }
        };
        match std::fs::write(&self.path, serialized) {
            Ok(()) => info!(
                path = %self.path.display(),
                schemes = state.processed_schemes.len(),
                "checkpoint saved"
            ),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to save checkpoint"),
        }
    }

    /// Absent and corrupt files both mean "start fresh"; corruption is
    /// surfaced as a warning instead of failing the run.
    pub fn load(&self) -> Option<CheckpointState> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read checkpoint");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => {
                info!(path = %self.path.display(), "checkpoint loaded");
                Some(state)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt checkpoint; starting fresh");
                None
            }
        }
    }

    pub fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "checkpoint cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to clear checkpoint"),
        }
    }
}
