//! Synchronizer: one full catalog-to-vault pass.
//!
//! A pass runs under the sync guard. It brings the identifier index up to
//! date, fetches the catalog, then upserts every item with bounded
//! concurrency. Each item is written under the lock for its identifier, and
//! the index is drained inside that lock, so two writers for the same item
//! never both decide the note is missing.

use crate::catalog::{CatalogError, CatalogItem, CatalogSource};
use crate::events::{StoreChange, Subscription};
use crate::fs::FileSystem;
use crate::guard::{GuardConfig, GuardError, GuardStateStore, SyncGuard};
use crate::identifier::Identifier;
use crate::index::{IdentifierIndex, IndexConfig, IndexError};
use crate::lock::{LockConfig, LockManager};
use crate::render::{note_file_name, NoteRenderer, DEFAULT_BODY_TEMPLATE};
use crate::vault::{DocumentHandle, DocumentStore, StoreError, Vault};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Attempts at finding a free file name before giving up on an item.
const MAX_NAME_ATTEMPTS: usize = 100;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("Failed to fetch catalog: {0}")]
    Catalog(#[from] CatalogError),

    /// Nothing is known about existing notes, so writing could duplicate them.
    #[error("Vault could not be indexed: {0}")]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Vault folder new notes are created in (default: "Shelf")
    pub folder: String,
    /// Items upserted concurrently (default: 4)
    pub concurrency: usize,
    /// Body template for new notes
    pub body_template: String,
    pub lock: LockConfig,
    pub guard: GuardConfig,
    pub index: IndexConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            folder: "Shelf".to_string(),
            concurrency: 4,
            body_template: DEFAULT_BODY_TEMPLATE.to_string(),
            lock: LockConfig::default(),
            guard: GuardConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

/// What a pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Items that could not be written (bad identifier, store error)
    pub failed: usize,
    /// Items skipped because their lock timed out; retried next pass
    pub deferred: usize,
    /// Identifiers claimed by more than one note after the pass
    pub duplicates: usize,
}

impl PassReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Created => self.created += 1,
            ItemOutcome::Updated => self.updated += 1,
            ItemOutcome::Unchanged => self.unchanged += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Deferred => self.deferred += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged + self.failed + self.deferred
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} unchanged, {} failed, {} deferred, {} duplicated",
            self.created, self.updated, self.unchanged, self.failed, self.deferred, self.duplicates
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Created,
    Updated,
    Unchanged,
    Failed,
    Deferred,
}

/// Owns the index, lock manager and guard for one vault.
pub struct Synchronizer<F: FileSystem + 'static> {
    vault: Arc<Vault<F>>,
    index: Arc<IdentifierIndex<Vault<F>>>,
    locks: LockManager,
    guard: SyncGuard,
    catalog: Arc<dyn CatalogSource>,
    renderer: NoteRenderer,
    config: SyncConfig,
    /// Paths claimed by in-flight creates
    reserved: Mutex<HashSet<String>>,
    _vault_events: Subscription,
}

impl<F: FileSystem + 'static> Synchronizer<F> {
    pub fn new(
        vault: Arc<Vault<F>>,
        catalog: Arc<dyn CatalogSource>,
        state_store: Arc<dyn GuardStateStore>,
        config: SyncConfig,
    ) -> Self {
        let index = Arc::new(IdentifierIndex::new(Arc::clone(&vault), config.index.clone()));
        let vault_events = index.observe(vault.events());
        let renderer = NoteRenderer::new(config.index.id_field.clone(), config.body_template.clone());
        Self {
            locks: LockManager::new(config.lock.clone()),
            guard: SyncGuard::new(config.guard.clone(), state_store),
            vault,
            index,
            catalog,
            renderer,
            config,
            reserved: Mutex::new(HashSet::new()),
            _vault_events: vault_events,
        }
    }

    pub fn vault(&self) -> &Arc<Vault<F>> {
        &self.vault
    }

    pub fn index(&self) -> &Arc<IdentifierIndex<Vault<F>>> {
        &self.index
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn guard(&self) -> &SyncGuard {
        &self.guard
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one full pass.
    ///
    /// A pass that ends before writing anything (no index to consult, or
    /// the catalog fetch failed) does not start the cooldown.
    pub async fn run_pass(&self) -> Result<PassReport, SyncError> {
        let permit = self.guard.acquire()?;
        let started = Instant::now();

        if let Err(e) = self.index.ensure_ready().await {
            if !self.index.is_built() {
                permit.abort();
                return Err(e.into());
            }
            warn!("Continuing with the previous index: {}", e);
        }

        let items = match self.catalog.fetch_items().await {
            Ok(items) => items,
            Err(e) => {
                permit.abort();
                return Err(e.into());
            }
        };
        info!("Fetched {} items from {}", items.len(), self.catalog.name());

        let mut report = PassReport::default();
        let mut outcomes = stream::iter(items)
            .map(|item| self.sync_item(item))
            .buffer_unordered(self.config.concurrency.max(1));
        while let Some(outcome) = outcomes.next().await {
            report.record(outcome);
        }
        drop(outcomes);

        self.index.drain_pending().await;
        for (id, handles) in self.index.duplicates() {
            let canonical = IdentifierIndex::<Vault<F>>::select_canonical(&handles);
            warn!(
                "{} is claimed by {} notes, using {}",
                id,
                handles.len(),
                canonical.map(|h| h.path).unwrap_or_default()
            );
            report.duplicates += 1;
        }

        permit.release();
        info!("Sync pass done in {:?}: {}", started.elapsed(), report);
        Ok(report)
    }

    async fn sync_item(&self, item: CatalogItem) -> ItemOutcome {
        let id = match item.identifier() {
            Ok(id) => id,
            Err(e) => {
                warn!("Skipping '{}': {}", item.title, e);
                return ItemOutcome::Failed;
            }
        };

        match self.locks.with_lock(&id, || self.upsert(&id, &item)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!("Failed to write note for {}: {}", id, e);
                ItemOutcome::Failed
            }
            Err(e) => {
                warn!("{}", e);
                ItemOutcome::Deferred
            }
        }
    }

    /// Create or update the note for `id`. Caller holds the lock for `id`.
    async fn upsert(&self, id: &Identifier, item: &CatalogItem) -> Result<ItemOutcome, StoreError> {
        // Apply everything observed so far, including writes by the previous holder
        self.index.drain_pending().await;

        let handles = self.index.lookup(id);
        if let Some(canonical) = IdentifierIndex::<Vault<F>>::select_canonical(&handles) {
            match self.update_note(&canonical, id, item).await {
                Err(StoreError::NotFound(path)) => {
                    debug!("{} vanished, recreating note for {}", path, id);
                    self.index.note_change(&StoreChange::deleted(path));
                }
                other => return other,
            }
        }
        self.create_note(id, item).await
    }

    async fn update_note(
        &self,
        handle: &DocumentHandle,
        id: &Identifier,
        item: &CatalogItem,
    ) -> Result<ItemOutcome, StoreError> {
        let existing = self.vault.read(handle).await?;
        let rendered = self.renderer.render_onto(&existing, id, item);
        if rendered == existing {
            return Ok(ItemOutcome::Unchanged);
        }
        self.vault.modify(handle, &rendered).await?;
        debug!("Updated {} for {}", handle.path, id);
        Ok(ItemOutcome::Updated)
    }

    async fn create_note(&self, id: &Identifier, item: &CatalogItem) -> Result<ItemOutcome, StoreError> {
        let content = self.renderer.render(id, item);
        let file_name = note_file_name(&item.title, &id.to_string());

        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let path = self.candidate_path(&file_name, attempt);
            if !self.reserve(&path) {
                continue;
            }
            let result = self.vault.create(&path, &content).await;
            self.unreserve(&path);

            match result {
                Ok(handle) => {
                    info!("Created {} for {}", handle.path, id);
                    return Ok(ItemOutcome::Created);
                }
                Err(StoreError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::AlreadyExists(self.candidate_path(&file_name, 1)))
    }

    /// `Folder/Name.md`, then `Folder/Name (2).md`, `Folder/Name (3).md`, ...
    fn candidate_path(&self, file_name: &str, attempt: usize) -> String {
        let name = if attempt == 1 {
            file_name.to_string()
        } else {
            let stem = file_name.strip_suffix(".md").unwrap_or(file_name);
            format!("{} ({}).md", stem, attempt)
        };
        let folder = self.config.folder.trim_matches('/');
        if folder.is_empty() {
            name
        } else {
            format!("{}/{}", folder, name)
        }
    }

    fn reserve(&self, path: &str) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string())
    }

    fn unreserve(&self, path: &str) {
        self.reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    /// Reset the index, locks and guard.
    pub fn clear(&self) {
        self.index.clear();
        self.locks.clear();
        self.guard.clear();
    }
}
