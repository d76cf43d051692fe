//! Daemon configuration from command-line flags and environment variables.

use clap::Parser;
use shelf_core::guard::GuardConfig;
use shelf_core::upsert::SyncConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Lists the MyAnimeList API can read.
pub const CATEGORIES: &[&str] = &["anime", "manga"];

#[derive(Parser, Debug, Clone)]
#[command(name = "shelf")]
#[command(about = "Keep your MyAnimeList lists as notes in an Obsidian vault")]
pub struct Args {
    /// Path to the vault directory (supports ~)
    #[arg(short, long, env = "SHELF_VAULT_PATH")]
    pub vault: String,

    /// Vault folder new notes are created in
    #[arg(long, default_value = "Shelf", env = "SHELF_FOLDER")]
    pub folder: String,

    /// MyAnimeList OAuth access token
    #[arg(long, env = "MAL_ACCESS_TOKEN", hide_env_values = true)]
    pub token: String,

    /// List to sync (repeatable): anime, manga
    #[arg(
        long = "category",
        default_value = "anime",
        env = "SHELF_CATEGORIES",
        value_delimiter = ','
    )]
    pub categories: Vec<String>,

    /// Seconds between sync passes
    #[arg(long, default_value_t = 900, env = "SHELF_INTERVAL_SECS")]
    pub interval_secs: u64,

    /// Minimum seconds between the end of one pass and the start of the next
    #[arg(long, default_value_t = 300, env = "SHELF_COOLDOWN_SECS")]
    pub cooldown_secs: u64,

    /// Items written concurrently
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Run a single pass and exit
    #[arg(long)]
    pub once: bool,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub vault_path: PathBuf,
    pub access_token: String,
    pub categories: Vec<String>,
    pub interval: Duration,
    pub once: bool,
    pub sync: SyncConfig,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let vault_path = expand_tilde(&args.vault);
        if !vault_path.is_dir() {
            return Err(ConfigError::VaultNotFound(vault_path));
        }

        let access_token = args.token.trim().to_string();
        if access_token.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        let mut categories = Vec::new();
        for category in args.categories {
            let category = category.trim().to_lowercase();
            if !CATEGORIES.contains(&category.as_str()) {
                return Err(ConfigError::UnknownCategory(category));
            }
            if !categories.contains(&category) {
                categories.push(category);
            }
        }

        if args.interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }

        Ok(Self {
            vault_path,
            access_token,
            categories,
            interval: Duration::from_secs(args.interval_secs),
            once: args.once,
            sync: SyncConfig {
                folder: args.folder.trim_matches('/').to_string(),
                concurrency: args.concurrency.max(1),
                guard: GuardConfig {
                    cooldown: Duration::from_secs(args.cooldown_secs),
                    ..GuardConfig::default()
                },
                ..SyncConfig::default()
            },
        })
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Vault directory not found: {}", .0.display())]
    VaultNotFound(PathBuf),

    #[error("MAL_ACCESS_TOKEN (or --token) must not be empty")]
    MissingToken,

    #[error("Unknown category '{0}', expected one of: anime, manga")]
    UnknownCategory(String),

    #[error("--interval-secs must be at least 1")]
    ZeroInterval,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(dir: &TempDir, extra: &[&str]) -> Result<Config, ConfigError> {
        let vault = dir.path().to_str().unwrap();
        let mut argv = vec!["shelf", "--vault", vault, "--token", "abc"];
        argv.extend_from_slice(extra);
        Config::from_args(Args::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_defaults() {
        let dir = TempDir::new().unwrap();
        let config = parse(&dir, &[]).unwrap();
        assert_eq!(config.categories, vec!["anime"]);
        assert_eq!(config.interval, Duration::from_secs(900));
        assert_eq!(config.sync.folder, "Shelf");
        assert_eq!(config.sync.guard.cooldown, Duration::from_secs(300));
        assert!(!config.once);
    }

    #[test]
    fn test_repeated_and_delimited_categories() {
        let dir = TempDir::new().unwrap();
        let config = parse(&dir, &["--category", "manga", "--category", "anime,Manga"]).unwrap();
        assert_eq!(config.categories, vec!["manga", "anime"]);
    }

    #[test]
    fn test_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            parse(&dir, &["--category", "novels"]),
            Err(ConfigError::UnknownCategory(_))
        ));
        assert!(matches!(
            parse(&dir, &["--interval-secs", "0"]),
            Err(ConfigError::ZeroInterval)
        ));

        let args = Args::try_parse_from(["shelf", "--vault", "/definitely/not/here", "--token", "x"]).unwrap();
        assert!(matches!(Config::from_args(args), Err(ConfigError::VaultNotFound(_))));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~"), home);
            assert_eq!(expand_tilde("~/vault"), home.join("vault"));
        }
    }
}
