//! Durable rotation state: a single small JSON snapshot, not a journal.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Snapshot persisted after every scheduler mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RotationState {
    pub current_index: usize,
    pub active: bool,
    pub last_post_time: Option<DateTime<Utc>>,
}

/// File-backed store for [`RotationState`]. Writes go through a temp file
/// and an atomic rename so a crash mid-write never leaves a corrupt record.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state. A missing or unreadable file yields the
    /// default state; an index no longer valid for `destination_count`
    /// is clamped back to zero.
    pub fn load(&self, destination_count: usize) -> RotationState {
        let mut state = match fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<RotationState>(&raw) {
                Ok(state) => state,
                Err(err) => {
                    warn!(?err, path = %self.path.display(), "corrupt state file; starting fresh");
                    RotationState::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RotationState::default(),
            Err(err) => {
                warn!(?err, path = %self.path.display(), "failed to read state file; starting fresh");
                RotationState::default()
            }
        };
        if state.current_index >= destination_count {
            state.current_index = 0;
        }
        debug!(index = state.current_index, active = state.active, "loaded rotation state");
        state
    }

    /// Persist the state synchronously (temp file + rename).
    pub fn save(&self, state: &RotationState) -> Result<()> {
        let raw = serde_json::to_string_pretty(state)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating state dir {}", parent.display()))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        Ok(())
    }
}
