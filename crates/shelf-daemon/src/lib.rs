//! shelf-daemon library: Exposes the daemon components for testing.
//!
//! This is a thin layer over the native pieces (filesystem, watcher, state
//! file, MyAnimeList client) that plug into shelf-core.

pub mod config;
pub mod daemon;
pub mod mal;
pub mod native_fs;
pub mod persistence;
pub mod watcher;

pub use config::{Args, Config, ConfigError};
pub use daemon::Daemon;
pub use mal::{MalClient, MalConfig};
pub use native_fs::NativeFs;
pub use persistence::StateFile;
pub use watcher::FileWatcher;
