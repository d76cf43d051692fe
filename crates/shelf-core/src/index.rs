//! Identifier index: which notes currently claim which catalog item.
//!
//! The index keeps two maps in step:
//! - Forward: identifier -> handles of the notes whose frontmatter names it
//! - Reverse: note path -> identifier, so a delete or rename can drop the
//!   right entry without a rescan
//!
//! It is built by a full scan of the store and then kept current from store
//! change notifications. Notifications only append to an ordered queue; a
//! single consumer drains it in arrival order, re-reading one note per
//! update. Draining and rebuilding share one worker lock so they never
//! interleave, and every map mutation happens in one synchronous critical
//! section.
//!
//! The index owns nothing authoritative. It can be cleared and rebuilt from
//! the store at any time.

use crate::events::{ChangeKind, EventBus, StoreChange, Subscription};
use crate::identifier::Identifier;
use crate::markdown::{self, Frontmatter};
use crate::now_millis;
use crate::vault::{is_note_path, DocumentHandle, DocumentStore, StoreError};

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Frontmatter key holding a note's identifier.
pub const DEFAULT_ID_FIELD: &str = "shelf-id";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index build failed, keeping previous index: {0}")]
    Build(#[source] StoreError),

    /// The index was never built and the last attempt is still cooling down.
    #[error("Index not built yet, next attempt in {retry_in:?}")]
    NotBuilt { retry_in: Duration },
}

/// Configuration for the identifier index.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Frontmatter key holding the identifier (default: "shelf-id")
    pub id_field: String,
    /// Minimum time between rebuild attempts (default: 5s)
    pub rebuild_cooldown: Duration,
    /// Full rebuild cadence even without staleness signals (default: 60s)
    pub safety_interval: Duration,
    /// Pending updates processed between yields (default: 64)
    pub batch_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            id_field: DEFAULT_ID_FIELD.to_string(),
            rebuild_cooldown: Duration::from_secs(5),
            safety_interval: Duration::from_secs(60),
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PendingKind {
    Add,
    Update,
    Remove,
}

/// A queued change, applied strictly in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    pub kind: PendingKind,
    pub path: String,
    /// Unix millis when the notification arrived
    pub observed_at: u64,
    #[serde(skip)]
    seq: u64,
}

/// Counts describing the current index contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    /// Distinct identifiers with at least one note
    pub identifiers: usize,
    /// Notes carrying a well-formed identifier
    pub documents: usize,
    /// Identifiers claimed by more than one note
    pub duplicates: usize,
    /// Updates waiting to be applied
    pub pending: usize,
}

/// Result of an explicit rebuild request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    Rebuilt { identifiers: usize, documents: usize },
    /// A rebuild ran too recently; try again after `retry_in`
    Skipped { retry_in: Duration },
}

#[derive(Default)]
struct Maps {
    forward: HashMap<Identifier, BTreeMap<String, DocumentHandle>>,
    reverse: HashMap<String, Identifier>,
}

impl Maps {
    fn insert(&mut self, id: Identifier, handle: DocumentHandle) {
        self.remove_path(&handle.path);
        self.reverse.insert(handle.path.clone(), id.clone());
        self.forward
            .entry(id)
            .or_default()
            .insert(handle.path.clone(), handle);
    }

    fn remove_path(&mut self, path: &str) -> Option<Identifier> {
        let id = self.reverse.remove(path)?;
        if let Some(handles) = self.forward.get_mut(&id) {
            handles.remove(path);
            if handles.is_empty() {
                self.forward.remove(&id);
            }
        }
        Some(id)
    }
}

#[derive(Default)]
struct IndexState {
    maps: Maps,
    built_at: Option<Instant>,
    last_rebuild_attempt: Option<Instant>,
    stale: bool,
}

#[derive(Default)]
struct Queue {
    updates: VecDeque<PendingUpdate>,
    next_seq: u64,
}

/// Reverse index from identifiers to the notes representing them.
pub struct IdentifierIndex<S: DocumentStore + ?Sized> {
    store: Arc<S>,
    config: IndexConfig,
    state: Mutex<IndexState>,
    queue: Mutex<Queue>,
    /// Serializes draining and rebuilding (the only map mutators)
    worker: tokio::sync::Mutex<()>,
    wake: Notify,
}

impl<S: DocumentStore + ?Sized> IdentifierIndex<S> {
    pub fn new(store: Arc<S>, config: IndexConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(IndexState::default()),
            queue: Mutex::new(Queue::default()),
            worker: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Handles of every note claiming `id`, ordered by path. Empty if unknown.
    pub fn lookup(&self, id: &Identifier) -> Vec<DocumentHandle> {
        self.lock_state()
            .maps
            .forward
            .get(id)
            .map(|handles| handles.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The identifier a note path currently maps to.
    pub fn identifier_for_path(&self, path: &str) -> Option<Identifier> {
        self.lock_state().maps.reverse.get(path).cloned()
    }

    /// Pick the note that represents an identifier when several claim it.
    ///
    /// The most recently modified handle wins; equal times fall back to the
    /// smallest path, so the choice never depends on input order.
    pub fn select_canonical(handles: &[DocumentHandle]) -> Option<DocumentHandle> {
        handles
            .iter()
            .max_by(|a, b| {
                a.mtime_millis
                    .cmp(&b.mtime_millis)
                    .then_with(|| b.path.cmp(&a.path))
            })
            .cloned()
    }

    /// Canonical note for `id`, if any.
    pub fn canonical(&self, id: &Identifier) -> Option<DocumentHandle> {
        Self::select_canonical(&self.lookup(id))
    }

    /// Non-canonical notes claiming `id`. These are reported, never deleted.
    pub fn orphans(&self, id: &Identifier) -> Vec<DocumentHandle> {
        let handles = self.lookup(id);
        match Self::select_canonical(&handles) {
            Some(canonical) => handles
                .into_iter()
                .filter(|h| h.path != canonical.path)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every identifier claimed by more than one note.
    pub fn duplicates(&self) -> Vec<(Identifier, Vec<DocumentHandle>)> {
        let state = self.lock_state();
        let mut dups: Vec<_> = state
            .maps
            .forward
            .iter()
            .filter(|(_, handles)| handles.len() > 1)
            .map(|(id, handles)| (id.clone(), handles.values().cloned().collect()))
            .collect();
        dups.sort_by(|a, b| a.0.cmp(&b.0));
        dups
    }

    pub fn stats(&self) -> IndexStats {
        let pending = self.lock_queue().updates.len();
        let state = self.lock_state();
        IndexStats {
            identifiers: state.maps.forward.len(),
            documents: state.maps.reverse.len(),
            duplicates: state
                .maps
                .forward
                .values()
                .filter(|handles| handles.len() > 1)
                .count(),
            pending,
        }
    }

    pub fn is_built(&self) -> bool {
        self.lock_state().built_at.is_some()
    }

    // ------------------------------------------------------------------
    // Change intake
    // ------------------------------------------------------------------

    /// Queue a store change. Never blocks and never touches the store.
    pub fn note_change(&self, change: &StoreChange) {
        let observed_at = now_millis();
        let mut queue = self.lock_queue();
        let mut push = |kind: PendingKind, path: &str| {
            if !is_note_path(path) {
                return;
            }
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.updates.push_back(PendingUpdate {
                kind,
                path: path.trim_matches('/').to_string(),
                observed_at,
                seq,
            });
        };

        match change.kind {
            ChangeKind::Created => push(PendingKind::Add, &change.path),
            ChangeKind::Modified => push(PendingKind::Update, &change.path),
            ChangeKind::Deleted => push(PendingKind::Remove, &change.path),
            ChangeKind::Renamed => {
                if let Some(previous) = &change.previous_path {
                    push(PendingKind::Remove, previous);
                }
                push(PendingKind::Add, &change.path);
            }
        }
        drop(queue);
        self.wake.notify_one();
    }

    /// Feed every change published on `bus` into this index.
    ///
    /// The subscription holds only a weak reference to the index.
    pub fn observe(self: &Arc<Self>, bus: &Arc<EventBus>) -> Subscription
    where
        S: 'static,
    {
        let index = Arc::downgrade(self);
        bus.subscribe(move |change| {
            if let Some(index) = index.upgrade() {
                index.note_change(change);
            }
        })
    }

    /// Updates waiting to be applied, oldest first.
    pub fn pending(&self) -> Vec<PendingUpdate> {
        self.lock_queue().updates.iter().cloned().collect()
    }

    /// Ask for a rebuild on the next `ensure_ready` (subject to the cooldown).
    pub fn mark_stale(&self) {
        self.lock_state().stale = true;
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Make the index current: build it if needed, then apply pending updates.
    ///
    /// Concurrent callers queue on the same worker lock, so only the first
    /// one builds and the rest observe its result.
    ///
    /// Fails with `NotBuilt` while a never-built index waits out the cooldown
    /// after a failed attempt, so callers never mistake it for an empty store.
    pub async fn ensure_ready(&self) -> Result<(), IndexError> {
        let _worker = self.worker.lock().await;
        let result = match self.rebuild_wait() {
            Some(wait) if wait.is_zero() => self.rebuild_locked().await.map(|_| ()),
            Some(retry_in) if !self.is_built() => Err(IndexError::NotBuilt { retry_in }),
            _ => Ok(()),
        };
        self.drain_locked().await;
        result
    }

    /// `Some(cooldown left)` when a rebuild is wanted: never built, past the
    /// safety interval, or marked stale.
    fn rebuild_wait(&self) -> Option<Duration> {
        let state = self.lock_state();
        let wanted = match state.built_at {
            None => true,
            Some(built_at) => state.stale || built_at.elapsed() >= self.config.safety_interval,
        };
        wanted.then(|| self.cooldown_remaining(&state))
    }

    fn cooldown_remaining(&self, state: &IndexState) -> Duration {
        state
            .last_rebuild_attempt
            .map(|at| self.config.rebuild_cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    /// Rebuild from a full scan unless one ran within the rebuild cooldown.
    pub async fn rebuild_full(&self) -> Result<RebuildOutcome, IndexError> {
        let _worker = self.worker.lock().await;
        let retry_in = self.cooldown_remaining(&self.lock_state());
        if !retry_in.is_zero() {
            debug!("Skipping index rebuild, cooldown {:?} remaining", retry_in);
            return Ok(RebuildOutcome::Skipped { retry_in });
        }
        self.rebuild_locked().await
    }

    /// Rebuild from a full scan, ignoring the cooldown.
    pub async fn force_rebuild(&self) -> Result<RebuildOutcome, IndexError> {
        let _worker = self.worker.lock().await;
        self.rebuild_locked().await
    }

    /// Scan the store into fresh maps and swap them in. Caller holds `worker`.
    async fn rebuild_locked(&self) -> Result<RebuildOutcome, IndexError> {
        // Updates queued before the scan are reflected by it
        let cutoff = self.lock_queue().next_seq;
        self.lock_state().last_rebuild_attempt = Some(Instant::now());

        let (maps, skipped) = match self.scan().await {
            Ok(scanned) => scanned,
            Err(e) => {
                warn!("Identifier index rebuild failed: {}", e);
                return Err(IndexError::Build(e));
            }
        };

        let identifiers = maps.forward.len();
        let documents = maps.reverse.len();
        {
            let mut state = self.lock_state();
            state.maps = maps;
            state.built_at = Some(Instant::now());
            // Skipped notes get another look after the cooldown
            state.stale = skipped > 0;
        }
        let discarded = {
            let mut queue = self.lock_queue();
            let before = queue.updates.len();
            queue.updates.retain(|u| u.seq >= cutoff);
            before - queue.updates.len()
        };

        info!(
            "Indexed {} identifiers across {} notes ({} queued updates superseded)",
            identifiers, documents, discarded
        );
        Ok(RebuildOutcome::Rebuilt {
            identifiers,
            documents,
        })
    }

    /// Read every note's identifier. One unreadable note is skipped and
    /// counted; only a failed listing fails the scan.
    async fn scan(&self) -> Result<(Maps, usize), StoreError> {
        let handles = self.store.list_documents().await?;
        let mut maps = Maps::default();
        let mut skipped = 0;

        for (n, handle) in handles.into_iter().enumerate() {
            match self.store.read_metadata(&handle).await {
                Ok(metadata) => {
                    if let Some(id) = self.identifier_in(&handle.path, metadata.as_ref()) {
                        maps.insert(id, handle);
                    }
                }
                Err(e) => {
                    warn!("Skipping unreadable note {}: {}", handle.path, e);
                    skipped += 1;
                }
            }
            if (n + 1) % self.config.batch_size.max(1) == 0 {
                tokio::task::yield_now().await;
            }
        }
        Ok((maps, skipped))
    }

    fn identifier_in(&self, path: &str, metadata: Option<&Frontmatter>) -> Option<Identifier> {
        let raw = markdown::field_str(metadata?, &self.config.id_field)?;
        match raw.parse() {
            Ok(id) => Some(id),
            Err(e) => {
                debug!("Ignoring {}: {}", path, e);
                None
            }
        }
    }

    /// Apply all pending updates in arrival order.
    pub async fn drain_pending(&self) {
        let _worker = self.worker.lock().await;
        self.drain_locked().await;
    }

    async fn drain_locked(&self) {
        let batch_size = self.config.batch_size.max(1);
        loop {
            let batch: Vec<PendingUpdate> = {
                let mut queue = self.lock_queue();
                let n = batch_size.min(queue.updates.len());
                queue.updates.drain(..n).collect()
            };
            if batch.is_empty() {
                return;
            }
            for update in batch {
                self.apply(update).await;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn apply(&self, update: PendingUpdate) {
        if update.kind == PendingKind::Remove {
            if let Some(id) = self.lock_state().maps.remove_path(&update.path) {
                debug!("Unindexed {} ({})", update.path, id);
            }
            return;
        }

        // Read outside the state lock, then mutate in one step
        let resolved = match self.store.stat(&update.path).await {
            Ok(Some(handle)) => match self.store.read_metadata(&handle).await {
                Ok(metadata) => {
                    let id = self.identifier_in(&handle.path, metadata.as_ref());
                    Ok(id.map(|id| (id, handle)))
                }
                Err(e) => Err(e),
            },
            // Gone again before we got to it
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };

        let mut state = self.lock_state();
        match resolved {
            Ok(Some((id, handle))) => {
                debug!("Indexed {} as {}", handle.path, id);
                state.maps.insert(id, handle);
            }
            Ok(None) => {
                // No readable identifier (yet); a later update or rebuild catches up
                state.maps.remove_path(&update.path);
            }
            Err(e) => {
                warn!("Failed to re-read {}: {}", update.path, e);
                state.stale = true;
            }
        }
    }

    /// Run the safety rebuild if the index has been built and is due.
    async fn maintain(&self) {
        let _worker = self.worker.lock().await;
        if self.is_built() && self.rebuild_wait().is_some_and(|wait| wait.is_zero()) {
            // Failure already logged; the previous index stays in place
            let _ = self.rebuild_locked().await;
        }
        self.drain_locked().await;
    }

    /// Spawn the queue consumer: drains on every change and runs the
    /// periodic safety rebuild. Abort the handle to stop it.
    pub fn spawn_consumer(self: &Arc<Self>) -> JoinHandle<()>
    where
        S: 'static,
    {
        let index = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(index.config.safety_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = index.wake.notified() => index.drain_pending().await,
                    _ = ticker.tick() => index.maintain().await,
                }
            }
        })
    }

    /// Forget everything; the next `ensure_ready` rebuilds from scratch.
    pub fn clear(&self) {
        *self.lock_state() = IndexState::default();
        self.lock_queue().updates.clear();
    }
}
