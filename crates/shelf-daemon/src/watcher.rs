//! Vault watcher: turns edits made outside the daemon into store changes.
//!
//! Uses notify-debouncer-mini. Only visible `.md` files are reported. The
//! debouncer does not say what happened, so existence on disk decides between
//! `Modified` and `Deleted`; a rename arrives as a delete plus a modify.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use shelf_core::vault::is_note_path;
use shelf_core::StoreChange;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Debounce window for bursts of writes to the same file.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Last seen mtime per note, to drop events that changed nothing
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// Watches the vault directory recursively.
pub struct FileWatcher {
    vault_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<StoreChange>,
}

impl FileWatcher {
    pub fn new(vault_path: PathBuf) -> Result<Self> {
        // FSEvents on macOS needs the real path (/var -> /private/var)
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root = vault_path.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(change) = Self::process_event(&event, &root, &mtime_cache) {
                            if event_tx.send(change).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
        )?;

        debouncer
            .watcher()
            .watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            vault_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Map one debounced event to a store change, if it concerns a note.
    fn process_event(
        event: &DebouncedEvent,
        vault_path: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<StoreChange> {
        let path = &event.path;
        let relative = path.strip_prefix(vault_path).ok()?;
        // Vault paths are always '/'-separated
        let relative_str = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?
            .join("/");

        if !is_note_path(&relative_str) {
            return None;
        }

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        let change = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                if cache.get(relative) == Some(&mtime) {
                    // Touched without a content change
                    return None;
                }
                cache.insert(relative.to_path_buf(), mtime);
                StoreChange::modified(relative_str)
            }
            Err(_) if !path.exists() => {
                cache.remove(relative);
                StoreChange::deleted(relative_str)
            }
            Err(_) => StoreChange::modified(relative_str),
        };

        debug!("Watcher saw {:?} {}", change.kind, change.path);
        Some(change)
    }

    /// Receiver for changes observed on disk.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<StoreChange> {
        &mut self.event_rx
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}
