//! Vault: the note store the index reads and the orchestrator writes.
//!
//! A vault is a folder of markdown notes on some `FileSystem`. Hidden paths
//! (`.obsidian`, `.sync`, `.trash`, ...) are never treated as notes. Every
//! mutation made through the vault is published on its `EventBus` so the
//! identifier index can observe it.

use crate::events::{EventBus, StoreChange};
use crate::fs::{normalize_path, FileSystem, FsError};
use crate::markdown::{self, Frontmatter};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Note not found: {0}")]
    NotFound(String),

    #[error("Note already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid note path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Reference to a stored note: its path and last modification time.
///
/// Handles are snapshots owned by the store; a handle may go stale when the
/// note is renamed or deleted behind our back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentHandle {
    pub path: String,
    pub mtime_millis: u64,
}

/// The store primitives the index and orchestrator depend on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every note currently in the store.
    async fn list_documents(&self) -> Result<Vec<DocumentHandle>>;

    /// Frontmatter of a note, `None` if it has none or no longer exists.
    async fn read_metadata(&self, handle: &DocumentHandle) -> Result<Option<Frontmatter>>;

    /// Current handle for `path`, `None` if no such note.
    async fn stat(&self, path: &str) -> Result<Option<DocumentHandle>>;

    /// Full text of a note.
    async fn read(&self, handle: &DocumentHandle) -> Result<String>;

    /// Create a new note. Fails if `path` is taken.
    async fn create(&self, path: &str, content: &str) -> Result<DocumentHandle>;

    /// Overwrite an existing note. Fails with `NotFound` if the handle is stale.
    async fn modify(&self, handle: &DocumentHandle, content: &str) -> Result<DocumentHandle>;
}

/// Whether a vault-relative path names a note (visible `.md` file).
pub fn is_note_path(path: &str) -> bool {
    let path = path.trim_matches('/');
    path.ends_with(".md")
        && path
            .split('/')
            .all(|part| !part.is_empty() && !part.starts_with('.'))
}

fn validate_note_path(path: &str) -> Result<String> {
    let clean = normalize_path(path);
    let invalid = |reason| StoreError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    if clean.split('/').any(|part| part == "..") {
        return Err(invalid("parent directory references are not allowed"));
    }
    if !is_note_path(&clean) {
        return Err(invalid("notes must be visible .md files"));
    }
    Ok(clean)
}

/// Markdown vault over a `FileSystem`.
pub struct Vault<F: FileSystem> {
    fs: F,
    events: Arc<EventBus>,
}

impl<F: FileSystem> Vault<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            events: Arc::new(EventBus::new()),
        }
    }

    /// Bus on which every vault mutation is published.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Move a note and publish the rename.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = validate_note_path(from)?;
        let to = validate_note_path(to)?;
        self.fs.rename(&from, &to).await.map_err(|e| match e {
            FsError::NotFound(_) => StoreError::NotFound(from.clone()),
            FsError::AlreadyExists(_) => StoreError::AlreadyExists(to.clone()),
            other => StoreError::Fs(other),
        })?;
        debug!("Renamed {} -> {}", from, to);
        self.events.emit(StoreChange::renamed(from, to));
        Ok(())
    }

    /// Delete a note and publish the removal.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let path = validate_note_path(path)?;
        self.fs.delete(&path).await.map_err(|e| match e {
            FsError::NotFound(_) => StoreError::NotFound(path.clone()),
            other => StoreError::Fs(other),
        })?;
        debug!("Deleted {}", path);
        self.events.emit(StoreChange::deleted(path));
        Ok(())
    }

    /// Collect every note path, walking directories depth-first.
    async fn collect_notes(&self) -> Result<Vec<String>> {
        let mut notes = Vec::new();
        let mut pending = vec![String::new()];

        while let Some(dir) = pending.pop() {
            let entries = match self.fs.list(&dir).await {
                Ok(entries) => entries,
                // Directory vanished mid-scan
                Err(FsError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            for entry in entries {
                if entry.name.starts_with('.') {
                    continue;
                }
                let path = if dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", dir, entry.name)
                };
                if entry.is_dir {
                    pending.push(path);
                } else if entry.name.ends_with(".md") {
                    notes.push(path);
                }
            }
        }
        Ok(notes)
    }
}

#[async_trait]
impl<F: FileSystem> DocumentStore for Vault<F> {
    async fn list_documents(&self) -> Result<Vec<DocumentHandle>> {
        let mut paths = self.collect_notes().await?;
        paths.sort();

        let mut handles = Vec::with_capacity(paths.len());
        for path in paths {
            // Notes deleted between listing and stat are simply skipped
            match self.stat(&path).await {
                Ok(Some(handle)) => handles.push(handle),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable entry {}: {}", path, e),
            }
        }
        Ok(handles)
    }

    async fn read_metadata(&self, handle: &DocumentHandle) -> Result<Option<Frontmatter>> {
        match self.fs.read(&handle.path).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                Ok(markdown::parse(&text).frontmatter)
            }
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, path: &str) -> Result<Option<DocumentHandle>> {
        let path = normalize_path(path);
        match self.fs.stat(&path).await {
            Ok(stat) if !stat.is_dir => Ok(Some(DocumentHandle {
                path,
                mtime_millis: stat.mtime_millis,
            })),
            Ok(_) | Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, handle: &DocumentHandle) -> Result<String> {
        match self.fs.read(&handle.path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(FsError::NotFound(_)) => Err(StoreError::NotFound(handle.path.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, path: &str, content: &str) -> Result<DocumentHandle> {
        let path = validate_note_path(path)?;
        if self.fs.exists(&path).await? {
            return Err(StoreError::AlreadyExists(path));
        }
        self.fs.write(&path, content.as_bytes()).await?;
        let handle = self
            .stat(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        debug!("Created {}", path);
        self.events.emit(StoreChange::created(path));
        Ok(handle)
    }

    async fn modify(&self, handle: &DocumentHandle, content: &str) -> Result<DocumentHandle> {
        let path = validate_note_path(&handle.path)?;
        if self.stat(&path).await?.is_none() {
            return Err(StoreError::NotFound(path));
        }
        self.fs.write(&path, content.as_bytes()).await?;
        let updated = self
            .stat(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        debug!("Modified {}", path);
        self.events.emit(StoreChange::modified(path));
        Ok(updated)
    }
}
