//! HTTP fetch utilities and article/subscription store access for PAW.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use paw_core::{ArticleRecord, PushSubscription};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, Instrument};
use uuid::Uuid;

mod memory;
mod rest;

pub use memory::MemoryStore;
pub use rest::{RestStore, RestStoreConfig};

pub const CRATE_NAME: &str = "paw-storage";
pub const DEFAULT_USER_AGENT: &str = "rss-pwa-bot/1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            global_concurrency: 4,
        }
    }
}

/// Single-shot page fetcher. Retry policy belongs to the caller.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let _permit = self.global_limit.acquire().await.expect("semaphore not closed");
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.text().await?;
            tracing::debug!(bytes = body.len(), %status, "fetched page");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Source of listing-page HTML.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_text(run_id, url).await?.body)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed during {operation}: {source}")]
    Request {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("store rejected {operation} with http {status}: {body}")]
    Rejected {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("unexpected store response for {operation}: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
}

/// Article table access. Writes merge on `link`.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn upsert_articles(&self, articles: &[ArticleRecord]) -> Result<(), StoreError>;

    /// Returns the subset of `links` already present, compared by exact string equality.
    async fn existing_links(&self, links: &[String]) -> Result<Vec<String>, StoreError>;

    async fn recent_articles(&self, limit: usize) -> Result<Vec<ArticleRecord>, StoreError>;
}

/// Push subscription table access.
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    async fn list_subscriptions(&self) -> Result<Vec<PushSubscription>, StoreError>;

    async fn upsert_subscription(&self, subscription: &PushSubscription) -> Result<(), StoreError>;
}

/// Collapse repeated links so one upsert never touches the same row twice.
/// The last occurrence wins; first-seen order is kept.
pub fn collapse_by_link(articles: &[ArticleRecord]) -> Vec<ArticleRecord> {
    let mut order: Vec<&str> = Vec::with_capacity(articles.len());
    let mut latest: std::collections::HashMap<&str, &ArticleRecord> =
        std::collections::HashMap::with_capacity(articles.len());
    for article in articles {
        if latest.insert(article.link.as_str(), article).is_none() {
            order.push(article.link.as_str());
        }
    }
    order
        .into_iter()
        .filter_map(|link| latest.get(link).map(|a| (*a).clone()))
        .collect()
}
