//! Sync guard: one synchronization pass at a time, with a settle cooldown.
//!
//! The vault's change notifications arrive asynchronously, so a pass started
//! right after the previous one can observe a half-updated index and create
//! duplicate notes. The guard rejects overlapping passes and passes started
//! within `cooldown` of the last completed one.
//!
//! Only the last completion time survives restarts; it is read once from the
//! `GuardStateStore` at construction and written once per completed pass.
//! An aborted pass (`SyncPermit::abort`) wrote nothing and records nothing.

use crate::now_millis;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("A sync is already running (started {} seconds ago)", .elapsed.as_secs())]
    AlreadySyncing { elapsed: Duration },

    #[error("Sync is cooling down, try again in {} minute(s)", minutes_ceil(.remaining))]
    CooldownActive { remaining: Duration },
}

impl GuardError {
    /// Whole minutes left before a new pass may start (rounded up).
    pub fn minutes_remaining(&self) -> Option<u64> {
        match self {
            GuardError::CooldownActive { remaining } => Some(minutes_ceil(remaining)),
            GuardError::AlreadySyncing { .. } => None,
        }
    }
}

fn minutes_ceil(d: &Duration) -> u64 {
    d.as_millis().div_ceil(60_000) as u64
}

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("State store error: {0}")]
    Io(String),
}

/// Durable home for the last completed sync time (unix millis).
pub trait GuardStateStore: Send + Sync {
    fn load(&self) -> Result<Option<u64>, StateStoreError>;

    fn save(&self, last_sync_completed_at: u64) -> Result<(), StateStoreError>;
}

/// Non-durable state store for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    value: Mutex<Option<u64>>,
}

impl MemoryStateStore {
    pub fn new(initial: Option<u64>) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }
}

impl GuardStateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<u64>, StateStoreError> {
        Ok(*self.value.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn save(&self, last_sync_completed_at: u64) -> Result<(), StateStoreError> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(last_sync_completed_at);
        Ok(())
    }
}

/// Configuration for the sync guard.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Minimum idle time between passes (default: 5 minutes)
    pub cooldown: Duration,
    /// A pass running longer than this is presumed dead (default: 30 minutes)
    pub safety_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5 * 60),
            safety_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Observable guard state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardState {
    pub is_syncing: bool,
    pub last_sync_completed_at: Option<u64>,
    pub active_sync_started_at: Option<u64>,
}

struct Inner {
    state: GuardState,
    /// Incremented per granted pass so stale permits can't end a newer one
    run: u64,
}

/// Global mutex plus cooldown gate around a synchronization pass.
pub struct SyncGuard {
    config: GuardConfig,
    store: Arc<dyn GuardStateStore>,
    inner: Mutex<Inner>,
}

impl SyncGuard {
    pub fn new(config: GuardConfig, store: Arc<dyn GuardStateStore>) -> Self {
        let last_sync_completed_at = match store.load() {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to load last sync time, assuming none: {}", e);
                None
            }
        };
        Self {
            config,
            store,
            inner: Mutex::new(Inner {
                state: GuardState {
                    is_syncing: false,
                    last_sync_completed_at,
                    active_sync_started_at: None,
                },
                run: 0,
            }),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> GuardState {
        self.lock_inner().state
    }

    /// Start a pass now. See `acquire_at`.
    pub fn acquire(&self) -> Result<SyncPermit<'_>, GuardError> {
        self.acquire_at(now_millis())
    }

    /// Start a pass at `now_ms`.
    ///
    /// Rejects with `AlreadySyncing` while another pass is running and with
    /// `CooldownActive` within the cooldown window after the last pass.
    pub fn acquire_at(&self, now_ms: u64) -> Result<SyncPermit<'_>, GuardError> {
        let mut inner = self.lock_inner();
        self.check(&mut inner, now_ms)?;

        inner.run += 1;
        inner.state.is_syncing = true;
        inner.state.active_sync_started_at = Some(now_ms);
        info!("Sync pass started");

        Ok(SyncPermit {
            guard: self,
            run: inner.run,
            active: true,
        })
    }

    /// Whether a pass could start now, and why not.
    pub fn can_proceed(&self) -> Result<(), GuardError> {
        self.can_proceed_at(now_millis())
    }

    pub fn can_proceed_at(&self, now_ms: u64) -> Result<(), GuardError> {
        let mut inner = self.lock_inner();
        self.check(&mut inner, now_ms)
    }

    fn check(&self, inner: &mut Inner, now_ms: u64) -> Result<(), GuardError> {
        self.expire_overdue(inner, now_ms);

        if inner.state.is_syncing {
            let started = inner.state.active_sync_started_at.unwrap_or(now_ms);
            return Err(GuardError::AlreadySyncing {
                elapsed: Duration::from_millis(now_ms.saturating_sub(started)),
            });
        }

        if let Some(last) = inner.state.last_sync_completed_at {
            let since = Duration::from_millis(now_ms.saturating_sub(last));
            if since < self.config.cooldown {
                return Err(GuardError::CooldownActive {
                    remaining: self.config.cooldown - since,
                });
            }
        }

        Ok(())
    }

    /// Reset a pass that has outlived the safety timeout.
    fn expire_overdue(&self, inner: &mut Inner, now_ms: u64) {
        if !inner.state.is_syncing {
            return;
        }
        let started = inner.state.active_sync_started_at.unwrap_or(now_ms);
        let running = Duration::from_millis(now_ms.saturating_sub(started));
        if running >= self.config.safety_timeout {
            warn!(
                "Sync pass running for {:?} never released, forcing guard back to idle",
                running
            );
            inner.state.is_syncing = false;
            inner.state.active_sync_started_at = None;
        }
    }

    /// End the running pass now and restart the cooldown clock.
    pub fn release(&self) {
        self.release_at(now_millis());
    }

    /// End the running pass at `now_ms`. No-op when idle.
    pub fn release_at(&self, now_ms: u64) {
        let run = self.lock_inner().run;
        self.finish(run, now_ms);
    }

    fn finish(&self, run: u64, now_ms: u64) {
        {
            let mut inner = self.lock_inner();
            if !inner.state.is_syncing || inner.run != run {
                debug!("Sync guard release ignored (no matching pass running)");
                return;
            }
            inner.state.is_syncing = false;
            inner.state.active_sync_started_at = None;
            inner.state.last_sync_completed_at = Some(now_ms);
        }

        if let Err(e) = self.store.save(now_ms) {
            warn!("Failed to persist last sync time: {}", e);
        }
        info!("Sync pass finished, cooldown {:?}", self.config.cooldown);
    }

    /// End a pass that wrote nothing: back to Idle, no completion recorded.
    fn abandon(&self, run: u64) {
        let mut inner = self.lock_inner();
        if !inner.state.is_syncing || inner.run != run {
            return;
        }
        inner.state.is_syncing = false;
        inner.state.active_sync_started_at = None;
        info!("Sync pass aborted, no cooldown started");
    }

    /// Run `f` as a sync pass, releasing the guard however `f` exits.
    pub async fn with_guard<F, Fut, T>(&self, f: F) -> Result<T, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let permit = self.acquire()?;
        let output = f().await;
        permit.release();
        Ok(output)
    }

    /// Drop any running pass without recording a completion.
    pub fn clear(&self) {
        let mut inner = self.lock_inner();
        inner.state.is_syncing = false;
        inner.state.active_sync_started_at = None;
    }
}

/// Proof that a pass is running. Releases the guard on drop.
#[must_use = "the sync guard is released as soon as the permit is dropped"]
pub struct SyncPermit<'a> {
    guard: &'a SyncGuard,
    run: u64,
    active: bool,
}

impl std::fmt::Debug for SyncPermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPermit")
            .field("run", &self.run)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl SyncPermit<'_> {
    pub fn release(self) {
        self.release_at(now_millis());
    }

    pub fn release_at(mut self, now_ms: u64) {
        self.active = false;
        self.guard.finish(self.run, now_ms);
    }

    /// Give up the pass without counting it as completed, so the next pass
    /// may start right away.
    pub fn abort(mut self) {
        self.active = false;
        self.guard.abandon(self.run);
    }
}

impl Drop for SyncPermit<'_> {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            self.guard.finish(self.run, now_millis());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60_000;

    fn guard_with(store: Arc<dyn GuardStateStore>) -> SyncGuard {
        SyncGuard::new(GuardConfig::default(), store)
    }

    fn guard() -> SyncGuard {
        guard_with(Arc::new(MemoryStateStore::default()))
    }

    #[test]
    fn test_second_acquire_rejected_while_running() {
        let guard = guard();
        let t0 = 1_000_000;

        let permit = guard.acquire_at(t0).unwrap();
        assert!(guard.state().is_syncing);

        let err = guard.acquire_at(t0 + 2_000).err().unwrap();
        assert_eq!(
            err,
            GuardError::AlreadySyncing {
                elapsed: Duration::from_secs(2)
            }
        );
        assert_eq!(err.minutes_remaining(), None);

        permit.release_at(t0 + 10_000);
        assert!(!guard.state().is_syncing);
    }

    #[test]
    fn test_cooldown_after_release() {
        let guard = guard();
        let t0 = 1_000_000;

        guard.acquire_at(t0).unwrap().release_at(t0 + 1_000);

        let err = guard.acquire_at(t0 + 1_500).err().unwrap();
        assert!(matches!(err, GuardError::CooldownActive { .. }));
        assert_eq!(err.minutes_remaining(), Some(5));
        assert!(err.to_string().contains("5 minute"));

        // Still cooling down one millisecond before the window closes
        assert!(guard.acquire_at(t0 + 1_000 + 5 * MINUTE - 1).is_err());

        // Succeeds once the cooldown has elapsed
        let permit = guard.acquire_at(t0 + 1_000 + 5 * MINUTE).unwrap();
        permit.release_at(t0 + 6 * MINUTE);
    }

    #[test]
    fn test_acquire_acquire_release_scenario() {
        let guard = guard();
        let t0 = 50 * MINUTE;

        let permit = guard.acquire_at(t0).unwrap();
        assert!(matches!(
            guard.acquire_at(t0),
            Err(GuardError::AlreadySyncing { .. })
        ));
        permit.release_at(t0);

        let err = guard.acquire_at(t0 + 999).err().unwrap();
        assert_eq!(err.minutes_remaining(), Some(5));
    }

    #[test]
    fn test_minutes_remaining_rounds_up() {
        let err = GuardError::CooldownActive {
            remaining: Duration::from_secs(61),
        };
        assert_eq!(err.minutes_remaining(), Some(2));
        let err = GuardError::CooldownActive {
            remaining: Duration::from_secs(60),
        };
        assert_eq!(err.minutes_remaining(), Some(1));
    }

    #[test]
    fn test_can_proceed_reports_reason() {
        let guard = guard();
        let t0 = 10 * MINUTE;

        assert!(guard.can_proceed_at(t0).is_ok());
        let permit = guard.acquire_at(t0).unwrap();
        assert!(matches!(
            guard.can_proceed_at(t0 + 1),
            Err(GuardError::AlreadySyncing { .. })
        ));
        permit.release_at(t0 + 2);
        assert!(matches!(
            guard.can_proceed_at(t0 + 3),
            Err(GuardError::CooldownActive { .. })
        ));
        // Checking does not change state
        assert!(!guard.state().is_syncing);
    }

    #[test]
    fn test_safety_timeout_resets_abandoned_pass() {
        let guard = guard();
        let t0 = 10 * MINUTE;

        let abandoned = guard.acquire_at(t0).unwrap();
        std::mem::forget(abandoned);

        assert!(guard.acquire_at(t0 + 29 * MINUTE).is_err());

        let permit = guard.acquire_at(t0 + 30 * MINUTE).unwrap();
        // The abandoned pass never counted as completed
        assert_eq!(guard.state().last_sync_completed_at, None);
        permit.release_at(t0 + 31 * MINUTE);
        assert_eq!(guard.state().last_sync_completed_at, Some(t0 + 31 * MINUTE));
    }

    #[test]
    fn test_stale_permit_does_not_end_newer_pass() {
        let guard = guard();
        let t0 = 10 * MINUTE;

        let stale = guard.acquire_at(t0).unwrap();
        let fresh = guard.acquire_at(t0 + 30 * MINUTE).unwrap();

        stale.release_at(t0 + 31 * MINUTE);
        assert!(guard.state().is_syncing, "newer pass must keep running");

        fresh.release_at(t0 + 32 * MINUTE);
        assert!(!guard.state().is_syncing);
    }

    #[test]
    fn test_last_completion_persists_across_instances() {
        let store = Arc::new(MemoryStateStore::default());
        let t0 = 100 * MINUTE;

        {
            let guard = guard_with(store.clone());
            guard.acquire_at(t0).unwrap().release_at(t0 + MINUTE);
        }
        assert_eq!(store.load().unwrap(), Some(t0 + MINUTE));

        let restarted = guard_with(store);
        assert!(matches!(
            restarted.acquire_at(t0 + 2 * MINUTE),
            Err(GuardError::CooldownActive { .. })
        ));
        assert!(restarted.acquire_at(t0 + 6 * MINUTE).is_ok());
    }

    #[test]
    fn test_dropped_permit_releases() {
        let guard = guard();
        {
            let _permit = guard.acquire().unwrap();
            assert!(guard.state().is_syncing);
        }
        assert!(!guard.state().is_syncing);
        assert!(guard.state().last_sync_completed_at.is_some());
    }

    #[test]
    fn test_aborted_pass_records_no_completion() {
        let store = Arc::new(MemoryStateStore::default());
        let guard = guard_with(store.clone());
        let t0 = 10 * MINUTE;

        guard.acquire_at(t0).unwrap().abort();
        assert_eq!(guard.state(), GuardState::default());
        assert_eq!(store.load().unwrap(), None);

        // No cooldown: the next pass starts immediately
        let permit = guard.acquire_at(t0 + 1).unwrap();
        permit.release_at(t0 + 2);
        assert_eq!(store.load().unwrap(), Some(t0 + 2));
    }

    #[test]
    fn test_stale_abort_does_not_end_newer_pass() {
        let guard = guard();
        let t0 = 10 * MINUTE;

        let stale = guard.acquire_at(t0).unwrap();
        let fresh = guard.acquire_at(t0 + 30 * MINUTE).unwrap();
        stale.abort();
        assert!(guard.state().is_syncing);
        fresh.release_at(t0 + 31 * MINUTE);
    }

    #[test]
    fn test_release_when_idle_is_noop() {
        let guard = guard();
        guard.release_at(5);
        assert_eq!(guard.state(), GuardState::default());
    }

    struct FailingStore;

    impl GuardStateStore for FailingStore {
        fn load(&self) -> Result<Option<u64>, StateStoreError> {
            Err(StateStoreError::Io("unreadable".into()))
        }

        fn save(&self, _: u64) -> Result<(), StateStoreError> {
            Err(StateStoreError::Io("read-only".into()))
        }
    }

    #[test]
    fn test_store_failures_are_not_fatal() {
        let guard = guard_with(Arc::new(FailingStore));
        let t0 = 10 * MINUTE;
        guard.acquire_at(t0).unwrap().release_at(t0 + 1);
        assert_eq!(guard.state().last_sync_completed_at, Some(t0 + 1));
        assert!(guard.acquire_at(t0 + 2).is_err());
    }

    #[tokio::test]
    async fn test_with_guard_releases_after_pass() {
        let guard = guard();
        let value = guard.with_guard(|| async { 42 }).await.unwrap();
        assert_eq!(value, 42);
        assert!(!guard.state().is_syncing);

        // The pass just finished, so the next one is cooling down
        let again = guard.with_guard(|| async { 0 }).await;
        assert!(matches!(again, Err(GuardError::CooldownActive { .. })));
    }
}
