//! On-disk snapshot of the sync state: known devices, per-kind versions and
//! the authoritative record of each kind.
//!
//! JSON, loaded entirely into memory, flushed atomically via temp+rename.
//! Dropping a dirty store flushes it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use commsync_core::types::DataKind;

use crate::device::Device;
use crate::record::SyncRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub devices: Vec<Device>,
    pub versions: BTreeMap<DataKind, u64>,
    pub records: Vec<SyncRecord>,
}

pub struct StateStore {
    path: PathBuf,
    state: PersistedState,
    dirty: bool,
}

impl StateStore {
    /// Load or create a store at `path`. A missing file is an empty state.
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading sync state: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing sync state: {}", path.display()))?
        } else {
            PersistedState::default()
        };

        Ok(StateStore {
            path: path.to_path_buf(),
            state,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Replace the snapshot; no-op if nothing changed.
    pub fn update(&mut self, state: PersistedState) {
        if state != self.state {
            self.state = state;
            self.dirty = true;
        }
    }

    /// Write dirty changes to disk (write temp, then rename).
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state dir: {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(&self.state).context("serializing sync state")?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing sync state temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming sync state: {}", self.path.display()))?;

        self.dirty = false;
        Ok(())
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                tracing::warn!("failed to flush sync state on drop: {e}");
            }
        }
    }
}
