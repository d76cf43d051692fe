//! MyAnimeList catalog client.
//!
//! Reads the authenticated user's lists through the v2 REST API, following
//! `paging.next` links until the list is exhausted. Rate limiting (429) and
//! server errors are retried with exponential backoff.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use shelf_core::catalog::{CatalogError, CatalogItem, CatalogSource, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PLATFORM: &str = "mal";
pub const DEFAULT_BASE_URL: &str = "https://api.myanimelist.net";
const LIST_FIELDS: &str = "list_status,num_episodes,num_chapters,media_type,start_date";

#[derive(Debug, Clone)]
pub struct MalConfig {
    pub base_url: String,
    /// OAuth access token sent as a bearer token
    pub access_token: String,
    /// Lists to read: "anime", "manga"
    pub categories: Vec<String>,
    /// Items per page (API maximum for lists is 1000)
    pub page_limit: u32,
    pub timeout: Duration,
    /// Attempts per page, including the first
    pub max_attempts: u32,
    /// First retry delay; doubles on each further attempt
    pub initial_backoff: Duration,
}

impl MalConfig {
    pub fn new(access_token: impl Into<String>, categories: Vec<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token: access_token.into(),
            categories,
            page_limit: 100,
            timeout: Duration::from_secs(30),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default)]
    data: Vec<ListEntry>,
    #[serde(default)]
    paging: Paging,
}

#[derive(Debug, Default, Deserialize)]
struct Paging {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    node: Node,
    list_status: Option<ListStatus>,
}

#[derive(Debug, Deserialize)]
struct Node {
    id: u64,
    title: String,
    media_type: Option<String>,
    num_episodes: Option<u32>,
    num_chapters: Option<u32>,
    start_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListStatus {
    status: Option<String>,
    #[serde(default)]
    score: u32,
    num_episodes_watched: Option<u32>,
    num_chapters_read: Option<u32>,
    updated_at: Option<String>,
}

impl ListEntry {
    fn into_item(self, category: &str) -> CatalogItem {
        let node = self.node;
        let mut item = CatalogItem::new(PLATFORM, category, node.id, node.title);

        if let Some(media_type) = node.media_type {
            item = item.with_field("media_type", media_type);
        }
        if let Some(status) = self.list_status.as_ref().and_then(|s| s.status.clone()) {
            item = item.with_field("status", status);
        }
        if let Some(score) = self.list_status.as_ref().map(|s| s.score).filter(|s| *s > 0) {
            item = item.with_field("score", score);
        }
        let progress = self
            .list_status
            .as_ref()
            .and_then(|s| s.num_episodes_watched.or(s.num_chapters_read));
        if let Some(progress) = progress {
            item = item.with_field("progress", progress);
        }
        if let Some(total) = node.num_episodes.or(node.num_chapters).filter(|n| *n > 0) {
            item = item.with_field("total", total);
        }
        if let Some(start_date) = node.start_date {
            item = item.with_field("start_date", start_date);
        }
        if let Some(updated_at) = self.list_status.and_then(|s| s.updated_at) {
            item = item.with_field("updated_at", updated_at);
        }
        item
    }
}

pub struct MalClient {
    http: reqwest::Client,
    config: MalConfig,
}

impl MalClient {
    pub fn new(config: MalConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("shelf/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CatalogError::Request(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn first_page_url(&self, category: &str) -> String {
        format!(
            "{}/v2/users/@me/{}list?fields={}&limit={}&nsfw=true",
            self.config.base_url.trim_end_matches('/'),
            category,
            LIST_FIELDS,
            self.config.page_limit
        )
    }

    /// Every entry of one list, across all pages.
    pub async fn fetch_list(&self, category: &str) -> Result<Vec<CatalogItem>> {
        let mut items = Vec::new();
        let mut next = Some(self.first_page_url(category));

        while let Some(url) = next {
            let page = self.get_page(&url).await?;
            debug!("Fetched {} {} entries", page.data.len(), category);
            items.extend(page.data.into_iter().map(|entry| entry.into_item(category)));
            next = page.paging.next;
        }

        info!("Fetched {} {} entries from MyAnimeList", items.len(), category);
        Ok(items)
    }

    async fn get_page(&self, url: &str) -> Result<ListPage> {
        let attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.try_get_page(url).await {
                Ok(page) => return Ok(page),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(reason)) => {
                    last_error = reason;
                    if attempt < attempts {
                        warn!(
                            "MyAnimeList request failed ({}), retrying in {:?} (attempt {}/{})",
                            last_error, backoff, attempt, attempts
                        );
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(CatalogError::Exhausted {
            attempts,
            last: last_error,
        })
    }

    async fn try_get_page(&self, url: &str) -> std::result::Result<ListPage, Attempt> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    Attempt::Retry(e.to_string())
                } else {
                    Attempt::Fatal(CatalogError::Request(e.to_string()))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(Attempt::Retry(format!("HTTP {}", status)));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(Attempt::Fatal(CatalogError::Unauthorized(format!(
                "HTTP {}: {}",
                status, body
            ))));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Attempt::Fatal(CatalogError::Request(format!(
                "HTTP {}: {}",
                status, body
            ))));
        }

        response
            .json::<ListPage>()
            .await
            .map_err(|e| Attempt::Fatal(CatalogError::Decode(e.to_string())))
    }
}

enum Attempt {
    Retry(String),
    Fatal(CatalogError),
}

#[async_trait]
impl CatalogSource for MalClient {
    fn name(&self) -> &str {
        "MyAnimeList"
    }

    async fn fetch_items(&self) -> Result<Vec<CatalogItem>> {
        let mut items = Vec::new();
        for category in &self.config.categories {
            items.extend(self.fetch_list(category).await?);
        }
        Ok(items)
    }
}
