//! Core domain model for PAW.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "paw-core";

pub const FALLBACK_NOTIFICATION_TITLE: &str = "新着記事";
pub const FALLBACK_NOTIFICATION_URL: &str = "/";

/// One scraped article. `link` is the only identity the store knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl ArticleRecord {
    pub fn new(title: impl Into<String>, link: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            date: date.into(),
            published_at: None,
        }
    }

    /// Links that are empty after trimming cannot be deduplicated.
    pub fn has_dedup_key(&self) -> bool {
        !self.link.trim().is_empty()
    }
}

/// Field selectors, each evaluated relative to one list item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelectors {
    pub title: String,
    pub link: String,
    pub date: String,
}

impl Default for FieldSelectors {
    fn default() -> Self {
        Self {
            title: "h2, .entry-title".to_string(),
            link: "a".to_string(),
            date: "time, .entry-date".to_string(),
        }
    }
}

/// Operator-authored extraction rule for one listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub list_selector: String,
    #[serde(default)]
    pub fields: FieldSelectors,
}

impl Default for ExtractionRule {
    fn default() -> Self {
        Self {
            list_selector: "article".to_string(),
            fields: FieldSelectors::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Browser push subscription as stored by the subscription directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
    /// The subscription object exactly as the browser produced it.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl PushSubscription {
    /// Parses the object `PushSubscription.toJSON()` yields in a browser.
    /// Returns `None` unless it carries an endpoint and both keys.
    pub fn from_browser_json(raw: serde_json::Value) -> Option<Self> {
        let endpoint = raw.get("endpoint")?.as_str()?.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }
        let keys: SubscriptionKeys = serde_json::from_value(raw.get("keys")?.clone()).ok()?;
        Some(Self { endpoint, keys, raw })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub url: String,
}

impl NotificationPayload {
    pub fn for_article(article: &ArticleRecord) -> Self {
        let title = non_empty(&article.title);
        let link = non_empty(&article.link);
        Self {
            title: title.unwrap_or(FALLBACK_NOTIFICATION_TITLE).to_string(),
            body: title.or(link).unwrap_or_default().to_string(),
            url: link.unwrap_or(FALLBACK_NOTIFICATION_URL).to_string(),
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Stage of a single pipeline pass. `Failed` is only reachable from
/// `Fetching` and `Persisting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    Fetching,
    Extracting,
    Classifying,
    Persisting,
    Notifying,
    Done,
    Failed,
}

impl RunStage {
    pub fn can_fail(self) -> bool {
        matches!(self, RunStage::Fetching | RunStage::Persisting)
    }
}

/// Outcome of one orchestrator pass. Logged, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scraped: usize,
    pub new_count: usize,
    pub skipped_links: usize,
    pub lookup_failures: usize,
    pub notify_attempts: usize,
    pub notify_failures: usize,
}

impl RunResult {
    pub fn started(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            scraped: 0,
            new_count: 0,
            skipped_links: 0,
            lookup_failures: 0,
            notify_attempts: 0,
            notify_failures: 0,
        }
    }
}
