//! FileSystem trait abstraction for vault storage.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in shelf-daemon) - Uses tokio::fs
//!
//! Paths are vault-relative and `/`-separated.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete a file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Move a file, failing if the destination exists
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<String, MemoryFile>,
    dirs: BTreeSet<String>,
    /// Paths whose reads, stats and listings fail with `FsError::Io`
    unreadable: BTreeSet<String>,
    /// Last handed-out mtime, so successive writes get strictly increasing times
    clock: u64,
}

struct MemoryFile {
    content: Vec<u8>,
    mtime: u64,
}

impl MemoryState {
    fn tick(&mut self) -> u64 {
        let now = crate::now_millis().max(self.clock + 1);
        self.clock = now;
        now
    }

    fn check_readable(&self, path: &str) -> Result<()> {
        if self.unreadable.contains(path) {
            return Err(FsError::Io(format!("{}: permission denied", path)));
        }
        Ok(())
    }

    fn mkdir_all(&mut self, path: &str) {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }
}

/// In-memory filesystem for testing
#[derive(Default)]
pub struct InMemoryFs {
    state: RwLock<MemoryState>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a specific mtime for testing "most recent wins" scenarios
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = normalize_path(path);
        if let Some(file) = self.write_state().files.get_mut(&path) {
            file.mtime = mtime;
        }
    }

    /// Make `path` fail every read, stat and listing, as a file with broken
    /// permissions or a symlink loop would.
    pub fn set_unreadable(&self, path: &str, unreadable: bool) {
        let path = normalize_path(path);
        let mut state = self.write_state();
        if unreadable {
            state.unreadable.insert(path);
        } else {
            state.unreadable.remove(&path);
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

pub(crate) fn parent_path(path: &str) -> Option<&str> {
    path.rfind('/').map(|pos| &path[..pos])
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path);
        let state = self.read_state();
        state.check_readable(&path)?;
        state
            .files
            .get(&path)
            .map(|file| file.content.clone())
            .ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = normalize_path(path);
        let mut state = self.write_state();
        if state.dirs.contains(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        if let Some(parent) = parent_path(&path) {
            state.mkdir_all(parent);
        }
        let mtime = state.tick();
        state.files.insert(
            path,
            MemoryFile {
                content: content.to_vec(),
                mtime,
            },
        );
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = normalize_path(path);
        let state = self.read_state();
        state.check_readable(&path)?;
        if !path.is_empty() && !state.dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let direct_child = |full: &str| {
            full.strip_prefix(&prefix)
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(str::to_string)
        };

        let mut entries: Vec<FileEntry> = state
            .dirs
            .iter()
            .filter_map(|d| direct_child(d.as_str()))
            .map(|name| FileEntry { name, is_dir: true })
            .collect();
        entries.extend(
            state
                .files
                .keys()
                .filter_map(|f| direct_child(f.as_str()))
                .map(|name| FileEntry {
                    name,
                    is_dir: false,
                }),
        );
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        match self.write_state().files.remove(&path) {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        let state = self.read_state();
        Ok(path.is_empty() || state.files.contains_key(&path) || state.dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = normalize_path(path);
        let state = self.read_state();
        state.check_readable(&path)?;
        if let Some(file) = state.files.get(&path) {
            return Ok(FileStat {
                mtime_millis: file.mtime,
                size: file.content.len() as u64,
                is_dir: false,
            });
        }
        if path.is_empty() || state.dirs.contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }
        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        self.write_state().mkdir_all(&path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        let mut state = self.write_state();
        if state.files.contains_key(&to) || state.dirs.contains(&to) {
            return Err(FsError::AlreadyExists(to));
        }
        // A rename keeps the content but counts as a modification of the new path
        let mut file = state
            .files
            .remove(&from)
            .ok_or_else(|| FsError::NotFound(from.clone()))?;
        if let Some(parent) = parent_path(&to) {
            state.mkdir_all(parent);
        }
        file.mtime = state.tick();
        state.files.insert(to, file);
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows tests to keep a handle on the filesystem a Vault owns
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }
}
