//! CatalogSource trait for remote item lists.
//!
//! Implementations:
//! - `MalClient` (in shelf-daemon) - MyAnimeList v2 REST API
//! - `StaticCatalog` - Fixed item list for tests and dry runs

use crate::identifier::{Identifier, IdentifierError};
use crate::markdown::Frontmatter;

use async_trait::async_trait;
use serde_yaml::Value;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// One tracked item as reported by the remote catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    /// Identifier provider, e.g. "mal"
    pub platform: String,
    /// Item category, e.g. "anime" or "manga"
    pub category: String,
    /// Remote numeric id
    pub id: u64,
    pub title: String,
    /// Extra properties copied into the note, in display order
    pub fields: Frontmatter,
}

impl CatalogItem {
    pub fn new(platform: &str, category: &str, id: u64, title: impl Into<String>) -> Self {
        Self {
            platform: platform.to_string(),
            category: category.to_string(),
            id,
            title: title.into(),
            fields: Frontmatter::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(Value::from(key), value.into());
        self
    }

    /// The identifier this item is filed under in the vault.
    pub fn identifier(&self) -> std::result::Result<Identifier, IdentifierError> {
        Identifier::new(&self.platform, &self.category, self.id)
    }
}

/// Source of the items a sync pass materializes.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Every item currently tracked by the user
    async fn fetch_items(&self) -> Result<Vec<CatalogItem>>;
}

/// Catalog serving a fixed, replaceable list of items.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    items: Mutex<Vec<CatalogItem>>,
}

impl StaticCatalog {
    pub fn new(items: Vec<CatalogItem>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    /// Replace the list served by subsequent fetches.
    pub fn set_items(&self, items: Vec<CatalogItem>) {
        *self.items.lock().unwrap_or_else(|e| e.into_inner()) = items;
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_items(&self) -> Result<Vec<CatalogItem>> {
        Ok(self.items.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_identifier() {
        let item = CatalogItem::new("mal", "anime", 1245, "One Punch Man");
        assert_eq!(item.identifier().unwrap().to_string(), "mal:anime:1245");

        let bad = CatalogItem::new("mal", "Anime", 1, "x");
        assert!(matches!(bad.identifier(), Err(IdentifierError::Format { .. })));
        let zero = CatalogItem::new("mal", "anime", 0, "x");
        assert!(zero.identifier().is_err());
    }

    #[test]
    fn test_with_field_keeps_order() {
        let item = CatalogItem::new("mal", "anime", 1, "x")
            .with_field("status", "watching")
            .with_field("episodes", 12);
        let keys: Vec<_> = item.fields.keys().filter_map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["status", "episodes"]);
    }

    #[tokio::test]
    async fn test_static_catalog() {
        let catalog = StaticCatalog::new(vec![CatalogItem::new("mal", "anime", 1, "a")]);
        assert_eq!(catalog.fetch_items().await.unwrap().len(), 1);

        catalog.set_items(Vec::new());
        assert!(catalog.fetch_items().await.unwrap().is_empty());
    }
}
