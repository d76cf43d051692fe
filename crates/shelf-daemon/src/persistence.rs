//! Persistence for the sync guard's last completion time.
//!
//! Stored in `.sync/shelf-state.json` within the vault directory so the
//! cooldown survives restarts. This is the only state the daemon persists;
//! the identifier index is rebuilt from the notes on startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shelf_core::guard::{GuardStateStore, StateStoreError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// On-disk shape of the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    /// Unix millis when the last pass finished
    pub last_sync_completed_at: Option<u64>,
}

/// JSON state file inside the vault.
pub struct StateFile {
    path: PathBuf,
    /// Serializes read-modify-write of the file
    io: Mutex<()>,
}

impl StateFile {
    /// State file for the vault at `vault_path`.
    pub fn new(vault_path: &Path) -> Self {
        Self::at(vault_path.join(".sync").join("shelf-state.json"))
    }

    /// State file at an explicit location.
    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            io: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, empty if the file does not exist yet.
    pub fn read_state(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            return Ok(PersistedState::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(state)
    }

    pub fn write_state(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(state)?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, contents)?;
        fs::rename(&temp, &self.path)?;
        debug!("Saved sync state to {}", self.path.display());
        Ok(())
    }
}

impl GuardStateStore for StateFile {
    fn load(&self) -> std::result::Result<Option<u64>, StateStoreError> {
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());
        self.read_state()
            .map(|state| state.last_sync_completed_at)
            .map_err(|e| StateStoreError::Io(format!("{:#}", e)))
    }

    fn save(&self, last_sync_completed_at: u64) -> std::result::Result<(), StateStoreError> {
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());
        // Unreadable state is replaced rather than blocking every future save
        let mut state = self.read_state().unwrap_or_default();
        state.last_sync_completed_at = Some(last_sync_completed_at);
        self.write_state(&state)
            .map_err(|e| StateStoreError::Io(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_core::guard::{GuardConfig, GuardError, SyncGuard};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = StateFile::new(dir.path());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = StateFile::new(dir.path());
        store.save(1_700_000_000_000).unwrap();

        let reopened = StateFile::new(dir.path());
        assert_eq!(reopened.load().unwrap(), Some(1_700_000_000_000));

        let raw = fs::read_to_string(dir.path().join(".sync/shelf-state.json")).unwrap();
        assert!(raw.contains("\"lastSyncCompletedAt\": 1700000000000"));
    }

    #[test]
    fn test_corrupt_file_reports_error_then_recovers_on_save() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".sync")).unwrap();
        fs::write(dir.path().join(".sync/shelf-state.json"), "{not json").unwrap();

        let store = StateFile::new(dir.path());
        assert!(matches!(store.load(), Err(StateStoreError::Io(_))));

        store.save(42).unwrap();
        assert_eq!(store.load().unwrap(), Some(42));
    }

    #[test]
    fn test_cooldown_survives_restart() {
        let dir = TempDir::new().unwrap();
        let config = GuardConfig::default();

        let guard = SyncGuard::new(config.clone(), Arc::new(StateFile::new(dir.path())));
        guard.acquire_at(1_000).unwrap().release_at(2_000);

        let restarted = SyncGuard::new(config, Arc::new(StateFile::new(dir.path())));
        let err = restarted.acquire_at(62_000).unwrap_err();
        assert!(matches!(err, GuardError::CooldownActive { .. }));
        assert_eq!(err.minutes_remaining(), Some(4));
    }
}
