//! shelf-core: Keeps a vault of markdown notes in step with a remote catalog.
//!
//! This crate provides:
//! - `Identifier`: the `provider:category:id` key written into each note
//! - `IdentifierIndex`: reverse index from identifiers to notes, kept current
//!   from store change notifications
//! - `LockManager`: per-identifier write serialization with stale-lock recovery
//! - `SyncGuard`: one pass at a time, plus a cooldown between passes
//! - `Synchronizer`: the pass itself (fetch, look up, create or update)
//! - FileSystem, DocumentStore and CatalogSource trait abstractions

pub mod catalog;
pub mod events;
pub mod fs;
pub mod guard;
pub mod identifier;
pub mod index;
pub mod lock;
pub mod markdown;
pub mod render;
pub mod upsert;
pub mod vault;

pub use catalog::{CatalogError, CatalogItem, CatalogSource, StaticCatalog};
pub use events::{ChangeKind, EventBus, StoreChange, Subscription};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use guard::{
    GuardConfig, GuardError, GuardState, GuardStateStore, MemoryStateStore, StateStoreError,
    SyncGuard, SyncPermit,
};
pub use identifier::{Identifier, IdentifierError};
pub use index::{
    IdentifierIndex, IndexConfig, IndexError, IndexStats, PendingKind, PendingUpdate,
    RebuildOutcome, DEFAULT_ID_FIELD,
};
pub use lock::{LockConfig, LockError, LockGuard, LockManager, LockStats};
pub use markdown::{Frontmatter, ParsedMarkdown};
pub use render::NoteRenderer;
pub use upsert::{PassReport, SyncConfig, SyncError, Synchronizer};
pub use vault::{DocumentHandle, DocumentStore, StoreError, Vault};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix milliseconds (0 if the clock is before 1970).
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
