//! End-to-end tests for shelf-daemon.
//!
//! Drives full sync passes against a temp-dir vault with a fixed catalog,
//! including restarts, notes moved by the user, and live file watching.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use shelf_core::catalog::CatalogError;
use shelf_core::markdown::{self, field_str};
use shelf_core::{CatalogItem, CatalogSource, ChangeKind, Identifier, StaticCatalog};
use shelf_daemon::{Args, Config, Daemon, FileWatcher};
use tempfile::TempDir;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep, timeout};

fn config(vault: &Path, extra: &[&str]) -> Config {
    let mut argv = vec!["shelf", "--vault", vault.to_str().unwrap(), "--token", "test-token"];
    argv.extend_from_slice(extra);
    Config::from_args(Args::try_parse_from(argv).expect("valid args")).expect("valid config")
}

fn catalog() -> Arc<StaticCatalog> {
    Arc::new(StaticCatalog::new(vec![
        CatalogItem::new("mal", "anime", 1245, "One Punch Man").with_field("status", "watching"),
        CatalogItem::new("mal", "anime", 5114, "Fullmetal Alchemist: Brotherhood")
            .with_field("status", "completed"),
        CatalogItem::new("mal", "manga", 2, "Berserk").with_field("status", "reading"),
    ]))
}

fn read_id(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    field_str(&markdown::parse(&text).frontmatter?, "shelf-id")
}

/// Catalog whose fetch blocks until the test opens the gate.
struct GatedCatalog {
    items: Vec<CatalogItem>,
    entered: Notify,
    gate: Notify,
}

#[async_trait]
impl CatalogSource for GatedCatalog {
    fn name(&self) -> &str {
        "gated"
    }

    async fn fetch_items(&self) -> Result<Vec<CatalogItem>, CatalogError> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(self.items.clone())
    }
}

/// Catalog that is never reachable.
struct Unreachable;

#[async_trait]
impl CatalogSource for Unreachable {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn fetch_items(&self) -> Result<Vec<CatalogItem>, CatalogError> {
        Err(CatalogError::Request("connection refused".into()))
    }
}

/// Poll `check` until it holds or `limit` elapses.
async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    check()
}

/// A first pass materializes every item as a note on disk.
#[tokio::test]
async fn test_pass_writes_notes_and_state() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let vault = temp_dir.path();
    let daemon = Daemon::new(config(vault, &[]), catalog());

    let report = daemon.sync_once().await.expect("pass should run");
    assert_eq!(report.created, 3);

    assert_eq!(
        read_id(&vault.join("Shelf/One Punch Man.md")).as_deref(),
        Some("mal:anime:1245")
    );
    assert_eq!(
        read_id(&vault.join("Shelf/Fullmetal Alchemist Brotherhood.md")).as_deref(),
        Some("mal:anime:5114")
    );
    assert_eq!(read_id(&vault.join("Shelf/Berserk.md")).as_deref(), Some("mal:manga:2"));

    let state = std::fs::read_to_string(vault.join(".sync/shelf-state.json")).unwrap();
    assert!(state.contains("lastSyncCompletedAt"));
}

/// The cooldown is persisted, so a restarted daemon does not sync again immediately.
#[tokio::test]
async fn test_cooldown_survives_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let vault = temp_dir.path();

    let first = Daemon::new(config(vault, &[]), catalog());
    assert!(first.sync_once().await.is_some());
    drop(first);

    let restarted = Daemon::new(config(vault, &[]), catalog());
    assert!(restarted.sync_once().await.is_none());
    assert!(restarted.synchronizer().guard().can_proceed().is_err());
}

/// Notes moved and edited while the daemon was down are found again, not duplicated.
#[tokio::test]
async fn test_restart_finds_moved_notes() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let vault = temp_dir.path();

    let first = Daemon::new(config(vault, &["--cooldown-secs", "0"]), catalog());
    first.sync_once().await.expect("first pass");
    drop(first);

    std::fs::create_dir_all(vault.join("Archive")).unwrap();
    std::fs::rename(vault.join("Shelf/Berserk.md"), vault.join("Archive/Berserk (manga).md")).unwrap();
    let archived = vault.join("Archive/Berserk (manga).md");
    let notes = format!("{}\nRe-read the Golden Age arc.\n", std::fs::read_to_string(&archived).unwrap());
    std::fs::write(&archived, notes).unwrap();

    let catalog = catalog();
    catalog.set_items(vec![
        CatalogItem::new("mal", "anime", 1245, "One Punch Man").with_field("status", "watching"),
        CatalogItem::new("mal", "anime", 5114, "Fullmetal Alchemist: Brotherhood")
            .with_field("status", "completed"),
        CatalogItem::new("mal", "manga", 2, "Berserk").with_field("status", "on_hold"),
    ]);
    let restarted = Daemon::new(config(vault, &["--cooldown-secs", "0"]), catalog);
    let report = restarted.sync_once().await.expect("second pass");
    assert_eq!(report.created, 0);
    assert_eq!(report.updated, 1);
    assert_eq!(report.unchanged, 2);
    assert_eq!(report.duplicates, 0);

    assert!(!vault.join("Shelf/Berserk.md").exists());
    let text = std::fs::read_to_string(&archived).unwrap();
    assert!(text.contains("on_hold"));
    assert!(text.contains("Re-read the Golden Age arc."));
}

/// An unreadable entry in the vault does not make a restarted daemon forget its notes.
#[cfg(unix)]
#[tokio::test]
async fn test_restart_with_symlink_loop_keeps_notes() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let vault = temp_dir.path();

    let first = Daemon::new(config(vault, &["--cooldown-secs", "0"]), catalog());
    assert_eq!(first.sync_once().await.expect("first pass").created, 3);
    drop(first);

    std::os::unix::fs::symlink("loop.md", vault.join("loop.md")).unwrap();

    let restarted = Daemon::new(config(vault, &["--cooldown-secs", "0"]), catalog());
    let report = restarted.sync_once().await.expect("second pass");
    assert_eq!(report.created, 0);
    assert_eq!(report.unchanged, 3);

    let mut names: Vec<_> = std::fs::read_dir(vault.join("Shelf"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["Berserk.md", "Fullmetal Alchemist Brotherhood.md", "One Punch Man.md"]
    );
}

/// A failed catalog fetch leaves no cooldown behind, even across a restart.
#[tokio::test]
async fn test_failed_fetch_persists_no_cooldown() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let vault = temp_dir.path();

    let daemon = Daemon::new(config(vault, &[]), Arc::new(Unreachable));
    assert!(daemon.sync_once().await.is_none());
    assert!(!vault.join(".sync/shelf-state.json").exists());
    drop(daemon);

    let restarted = Daemon::new(config(vault, &[]), catalog());
    assert!(restarted.synchronizer().guard().can_proceed().is_ok());
    assert_eq!(restarted.sync_once().await.expect("pass should run").created, 3);
}

/// Watcher reports edits to notes and ignores everything else.
#[tokio::test]
async fn test_file_watcher_reports_note_changes() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let vault_path = temp_dir.path().to_path_buf();
    std::fs::create_dir_all(vault_path.join(".sync")).unwrap();

    let mut watcher = FileWatcher::new(vault_path.clone()).expect("Failed to create watcher");

    // Give watcher time to fully initialize - FSEvents on macOS needs time
    sleep(Duration::from_millis(500)).await;

    std::fs::write(vault_path.join(".sync/shelf-state.json"), "{}").unwrap();
    std::fs::write(vault_path.join("cover.png"), "png").unwrap();
    sleep(Duration::from_millis(200)).await;

    let note = vault_path.join("note.md");
    std::fs::write(&note, "# Hello").unwrap();
    sleep(Duration::from_millis(100)).await;
    std::fs::write(&note, "# Hello World").unwrap();

    let change = timeout(Duration::from_secs(10), watcher.event_rx().recv())
        .await
        .expect("Timeout waiting for file event")
        .expect("No event received");
    assert_eq!(change.path, "note.md");
    assert_eq!(change.kind, ChangeKind::Modified);
}

/// While running, a note moved by the user is tracked at its new path.
#[tokio::test]
async fn test_running_daemon_follows_renames() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let vault = temp_dir.path().to_path_buf();
    let daemon = Daemon::new(
        config(&vault, &["--cooldown-secs", "0", "--interval-secs", "3600"]),
        catalog() as Arc<dyn CatalogSource>,
    );
    let id: Identifier = "mal:anime:1245".parse().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let driver = async {
        // The first interval tick runs a pass right away
        let created = vault.join("Shelf/One Punch Man.md");
        assert!(eventually(Duration::from_secs(10), || created.exists()).await);
        sleep(Duration::from_millis(500)).await;

        std::fs::create_dir_all(vault.join("Shelf/Anime")).unwrap();
        std::fs::rename(&created, vault.join("Shelf/Anime/OPM.md")).unwrap();

        let index = daemon.synchronizer().index();
        let followed = eventually(Duration::from_secs(10), || {
            index
                .lookup(&id)
                .iter()
                .any(|h| h.path == "Shelf/Anime/OPM.md")
        })
        .await;
        let old_gone = index.identifier_for_path("Shelf/One Punch Man.md").is_none();
        let _ = stop_tx.send(());
        (followed, old_gone)
    };
    let shutdown = async {
        let _ = stop_rx.await;
    };

    let (run, (followed, old_gone)) = tokio::join!(daemon.run_until(shutdown), driver);
    run.expect("daemon should stop cleanly");
    assert!(followed, "index should follow the rename");
    assert!(old_gone, "old path should no longer be indexed");
}

/// Edits made while a pass is in flight reach the index before the pass writes.
#[tokio::test]
async fn test_changes_during_pass_reach_index() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let vault = temp_dir.path().to_path_buf();
    std::fs::create_dir_all(vault.join("Shelf")).unwrap();
    std::fs::write(
        vault.join("Shelf/One Punch Man.md"),
        "---\nshelf-id: mal:anime:1245\ntitle: One Punch Man\n---\n\n# One Punch Man\n",
    )
    .unwrap();

    let catalog = Arc::new(GatedCatalog {
        items: vec![CatalogItem::new("mal", "anime", 1245, "One Punch Man").with_field("status", "watching")],
        entered: Notify::new(),
        gate: Notify::new(),
    });
    let daemon = Daemon::new(
        config(&vault, &["--cooldown-secs", "0", "--interval-secs", "3600"]),
        Arc::clone(&catalog) as Arc<dyn CatalogSource>,
    );
    let id: Identifier = "mal:anime:1245".parse().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let driver = async {
        // The first pass has indexed the vault and is waiting on the catalog
        catalog.entered.notified().await;
        sleep(Duration::from_millis(500)).await;

        std::fs::create_dir_all(vault.join("Shelf/Anime")).unwrap();
        std::fs::rename(vault.join("Shelf/One Punch Man.md"), vault.join("Shelf/Anime/OPM.md")).unwrap();

        let index = daemon.synchronizer().index();
        let seen_mid_pass = eventually(Duration::from_secs(10), || {
            index
                .pending()
                .iter()
                .any(|u| u.path == "Shelf/Anime/OPM.md")
                || index.lookup(&id).iter().any(|h| h.path == "Shelf/Anime/OPM.md")
        })
        .await;
        let still_running = daemon.synchronizer().guard().state().is_syncing;

        catalog.gate.notify_one();
        let finished = eventually(Duration::from_secs(10), || {
            daemon.synchronizer().guard().state().last_sync_completed_at.is_some()
        })
        .await;
        let _ = stop_tx.send(());
        (seen_mid_pass, still_running, finished)
    };
    let shutdown = async {
        let _ = stop_rx.await;
    };

    let (run, (seen_mid_pass, still_running, finished)) =
        tokio::join!(daemon.run_until(shutdown), driver);
    run.expect("daemon should stop cleanly");
    assert!(seen_mid_pass, "rename should reach the index during the pass");
    assert!(still_running, "pass should still be waiting on the catalog");
    assert!(finished);

    // The pass wrote to the moved note instead of recreating the old one
    assert!(!vault.join("Shelf/One Punch Man.md").exists());
    assert_eq!(read_id(&vault.join("Shelf/Anime/OPM.md")).as_deref(), Some("mal:anime:1245"));
}
