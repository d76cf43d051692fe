//! The long-running daemon: periodic passes plus live vault watching.

use crate::config::Config;
use crate::native_fs::NativeFs;
use crate::persistence::StateFile;
use crate::watcher::FileWatcher;

use anyhow::Result;
use shelf_core::catalog::CatalogSource;
use shelf_core::upsert::{PassReport, SyncError, Synchronizer};
use shelf_core::Vault;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

pub struct Daemon {
    config: Config,
    sync: Synchronizer<NativeFs>,
}

impl Daemon {
    pub fn new(config: Config, catalog: Arc<dyn CatalogSource>) -> Self {
        let vault = Arc::new(Vault::new(NativeFs::new(config.vault_path.clone())));
        let state = Arc::new(StateFile::new(&config.vault_path));
        let sync = Synchronizer::new(vault, catalog, state, config.sync.clone());
        Self { config, sync }
    }

    pub fn synchronizer(&self) -> &Synchronizer<NativeFs> {
        &self.sync
    }

    /// Run one pass, logging the outcome. Returns the report if the pass ran.
    pub async fn sync_once(&self) -> Option<PassReport> {
        match self.sync.run_pass().await {
            Ok(report) => Some(report),
            Err(SyncError::Guard(e)) => {
                info!("Skipping sync: {}", e);
                None
            }
            Err(e) => {
                error!("Sync pass failed: {}", e);
                None
            }
        }
    }

    /// Watch the vault and sync on every interval tick until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut watcher = FileWatcher::new(self.config.vault_path.clone())?;
        info!("Watching {}", watcher.vault_path().display());

        let consumer = self.sync.index().spawn_consumer();
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(report) = self.sync_while_watching(&mut watcher).await {
                        let stats = self.sync.index().stats();
                        info!(
                            "Vault holds {} tracked items in {} notes ({} pending changes): {}",
                            stats.identifiers, stats.documents, stats.pending, report
                        );
                    }
                }

                Some(change) = watcher.event_rx().recv() => {
                    self.sync.index().note_change(&change);
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        consumer.abort();
        self.sync.clear();
        Ok(())
    }

    /// Run one pass, feeding the index every change the watcher reports
    /// while it runs.
    async fn sync_while_watching(&self, watcher: &mut FileWatcher) -> Option<PassReport> {
        let pass = self.sync_once();
        tokio::pin!(pass);
        loop {
            tokio::select! {
                report = &mut pass => return report,
                Some(change) = watcher.event_rx().recv() => {
                    self.sync.index().note_change(&change);
                }
            }
        }
    }
}
