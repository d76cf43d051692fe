//! Per-identifier mutual exclusion with stale-lock recovery.
//!
//! Every write to a note goes through `LockManager::with_lock` for the note's
//! identifier, so at most one writer is in flight per catalog item while
//! unrelated items proceed concurrently.
//!
//! Waiters park on the holder's release signal (a `watch` channel) in bounded
//! slices. A waiter that has waited longer than the configured ceiling
//! force-releases a holder that has been in place at least as long, then
//! reports `LockError::Timeout` so the caller can retry later.

use crate::identifier::Identifier;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock on {id}, try again later")]
    Timeout { id: Identifier, waited: Duration },
}

/// Timing knobs for the lock manager.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Longest single wait on a release signal before re-checking (default: 100ms)
    pub poll_interval: Duration,
    /// Total wait after which a stale holder is force-released (default: 30s)
    pub timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

struct LockEntry {
    acquired_at: Instant,
    /// Distinguishes successive holders of the same identifier
    token: u64,
    released: watch::Sender<bool>,
}

impl LockEntry {
    fn signal_release(&self) {
        // send_replace updates the value even when nobody is subscribed
        self.released.send_replace(true);
    }
}

/// Snapshot of lock contention counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LockStats {
    pub acquisitions: u64,
    pub contended: u64,
    pub timeouts: u64,
    pub forced_releases: u64,
    pub held: usize,
}

#[derive(Default)]
struct Counters {
    acquisitions: AtomicU64,
    contended: AtomicU64,
    timeouts: AtomicU64,
    forced_releases: AtomicU64,
}

/// Table of in-flight critical sections keyed by identifier.
pub struct LockManager {
    config: LockConfig,
    entries: Mutex<HashMap<Identifier, LockEntry>>,
    next_token: AtomicU64,
    counters: Counters,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

impl LockManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<Identifier, LockEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire the lock for `id`, waiting for the current holder if any.
    ///
    /// The returned guard releases the lock when dropped. Prefer `with_lock`.
    pub async fn acquire(&self, id: &Identifier) -> Result<LockGuard<'_>, LockError> {
        let started = Instant::now();
        let mut contended = false;

        loop {
            let mut released = {
                let mut entries = self.lock_entries();
                match entries.get(id) {
                    Some(entry) => entry.released.subscribe(),
                    None => {
                        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                        let (tx, _) = watch::channel(false);
                        entries.insert(
                            id.clone(),
                            LockEntry {
                                acquired_at: Instant::now(),
                                token,
                                released: tx,
                            },
                        );
                        drop(entries);

                        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
                        if contended {
                            self.counters.contended.fetch_add(1, Ordering::Relaxed);
                        }
                        debug!("Acquired lock for {}", id);
                        return Ok(LockGuard {
                            manager: self,
                            id: id.clone(),
                            token,
                            active: true,
                        });
                    }
                }
            };
            contended = true;

            let waited = started.elapsed();
            if waited >= self.config.timeout {
                self.expire_stale(id, waited);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(LockError::Timeout {
                    id: id.clone(),
                    waited,
                });
            }

            let slice = self.config.poll_interval.min(self.config.timeout - waited);
            // Either outcome (released, holder dropped, slice elapsed) re-checks the table
            let _ = tokio::time::timeout(slice, released.wait_for(|done| *done)).await;
        }
    }

    /// Force-release the holder of `id` if it has held the lock past the ceiling.
    fn expire_stale(&self, id: &Identifier, waited: Duration) {
        let mut entries = self.lock_entries();
        let stale = entries
            .get(id)
            .is_some_and(|entry| entry.acquired_at.elapsed() >= self.config.timeout);
        if !stale {
            return;
        }
        if let Some(entry) = entries.remove(id) {
            entry.signal_release();
            self.counters.forced_releases.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Force-released stale lock for {} (held {:?}, waiter gave up after {:?})",
                id,
                entry.acquired_at.elapsed(),
                waited
            );
        }
    }

    /// Release the lock for `id`. Safe to call when no lock is held.
    pub fn release(&self, id: &Identifier) {
        if let Some(entry) = self.lock_entries().remove(id) {
            entry.signal_release();
            debug!("Released lock for {}", id);
        }
    }

    /// Release only if the entry still belongs to the holder identified by `token`.
    fn release_token(&self, id: &Identifier, token: u64) {
        let mut entries = self.lock_entries();
        if entries.get(id).is_some_and(|entry| entry.token == token) {
            if let Some(entry) = entries.remove(id) {
                entry.signal_release();
                debug!("Released lock for {}", id);
            }
        }
    }

    /// Run `f` while holding the lock for `id`.
    ///
    /// The lock is released on every exit path, including when the future is
    /// dropped or panics.
    pub async fn with_lock<F, Fut, T>(&self, id: &Identifier, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(id).await?;
        let output = f().await;
        guard.release();
        Ok(output)
    }

    pub fn is_locked(&self, id: &Identifier) -> bool {
        self.lock_entries().contains_key(id)
    }

    /// Number of identifiers currently locked.
    pub fn held_count(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquisitions: self.counters.acquisitions.load(Ordering::Relaxed),
            contended: self.counters.contended.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            forced_releases: self.counters.forced_releases.load(Ordering::Relaxed),
            held: self.held_count(),
        }
    }

    /// Release every held lock, waking all waiters.
    pub fn clear(&self) {
        for (_, entry) in self.lock_entries().drain() {
            entry.signal_release();
        }
    }
}

/// Held lock for one identifier. Releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    id: Identifier,
    token: u64,
    active: bool,
}

impl LockGuard<'_> {
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.active {
            self.active = false;
            self.manager.release_token(&self.id, self.token);
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
