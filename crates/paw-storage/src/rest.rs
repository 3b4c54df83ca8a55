//! PostgREST (Supabase REST) backed store.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paw_core::{ArticleRecord, PushSubscription, SubscriptionKeys};
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{collapse_by_link, ArticleStore, StoreError, SubscriptionDirectory};

const ARTICLES_TABLE: &str = "articles";
const SUBSCRIPTIONS_TABLE: &str = "push_subscriptions";
const UNDATED_COLUMNS: &str = "title,link,date";
const DATED_COLUMNS: &str = "title,link,date,published_at";

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    /// Project URL, e.g. `https://abc.supabase.co`. `/rest/v1` is appended.
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    rest_root: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ArticleRow {
    #[serde(default)]
    title: Option<String>,
    link: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct LinkRow {
    link: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionRow {
    endpoint: String,
    #[serde(default)]
    keys: Option<JsonValue>,
    #[serde(default)]
    subscription: Option<JsonValue>,
}

#[derive(Debug, Serialize)]
struct SubscriptionUpsertRow<'a> {
    endpoint: &'a str,
    keys: String,
    subscription: &'a JsonValue,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building store client")?;
        Ok(Self {
            client,
            rest_root: format!("{}/rest/v1", config.base_url.trim_end_matches('/')),
            api_key: config.api_key,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_root, table)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(
        &self,
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<Response, StoreError> {
        let resp = self
            .authorized(builder)
            .send()
            .await
            .map_err(|source| StoreError::Request { operation, source })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Rejected {
            operation,
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        operation: &'static str,
        resp: Response,
    ) -> Result<T, StoreError> {
        resp.json::<T>().await.map_err(|e| StoreError::Decode {
            operation,
            message: e.to_string(),
        })
    }
}

/// Builds a PostgREST `in.(...)` filter. Every value is double-quoted so
/// commas, dots and parentheses inside URLs are taken literally.
pub(crate) fn in_filter(values: &[String]) -> String {
    let quoted = values
        .iter()
        .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("in.({quoted})")
}

fn subscription_from_row(row: SubscriptionRow) -> Option<PushSubscription> {
    let keys = row
        .keys
        .as_ref()
        .and_then(keys_from_value)
        .or_else(|| {
            row.subscription
                .as_ref()
                .and_then(|s| s.get("keys"))
                .and_then(keys_from_value)
        })?;
    let raw = row.subscription.unwrap_or_else(|| {
        serde_json::json!({
            "endpoint": row.endpoint,
            "keys": { "p256dh": keys.p256dh, "auth": keys.auth },
        })
    });
    Some(PushSubscription {
        endpoint: row.endpoint,
        keys,
        raw,
    })
}

/// Keys are stored either as an object or as a JSON-encoded string.
fn keys_from_value(value: &JsonValue) -> Option<SubscriptionKeys> {
    match value {
        JsonValue::String(text) => serde_json::from_str(text).ok(),
        JsonValue::Object(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    }
}

#[async_trait]
impl ArticleStore for RestStore {
    async fn upsert_articles(&self, articles: &[ArticleRecord]) -> Result<(), StoreError> {
        let batch = collapse_by_link(articles);
        // A bulk insert takes its column list from the first object, so dated
        // and undated rows go out as separate requests with explicit columns.
        // Undated rows never name `published_at`: new rows get the column
        // default and existing rows keep their value.
        let (dated, undated): (Vec<_>, Vec<_>) = batch.into_iter().partition(|a| a.published_at.is_some());
        for (rows, columns) in [(undated, UNDATED_COLUMNS), (dated, DATED_COLUMNS)] {
            if rows.is_empty() {
                continue;
            }
            debug!(rows = rows.len(), columns, "upserting articles");
            let builder = self
                .client
                .post(self.table_url(ARTICLES_TABLE))
                .query(&[("on_conflict", "link"), ("columns", columns)])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&rows);
            self.send("upsert_articles", builder).await?;
        }
        Ok(())
    }

    async fn existing_links(&self, links: &[String]) -> Result<Vec<String>, StoreError> {
        if links.is_empty() {
            return Ok(Vec::new());
        }
        let builder = self
            .client
            .get(self.table_url(ARTICLES_TABLE))
            .query(&[("select", "link".to_string()), ("link", in_filter(links))]);
        let resp = self.send("existing_links", builder).await?;
        let rows: Vec<LinkRow> = Self::decode("existing_links", resp).await?;
        Ok(rows.into_iter().map(|r| r.link).collect())
    }

    async fn recent_articles(&self, limit: usize) -> Result<Vec<ArticleRecord>, StoreError> {
        let builder = self.client.get(self.table_url(ARTICLES_TABLE)).query(&[
            ("select", "title,link,date,published_at".to_string()),
            ("order", "published_at.desc.nullslast".to_string()),
            ("limit", limit.to_string()),
        ]);
        let resp = self.send("recent_articles", builder).await?;
        let rows: Vec<ArticleRow> = Self::decode("recent_articles", resp).await?;
        Ok(rows
            .into_iter()
            .map(|row| ArticleRecord {
                title: row.title.unwrap_or_default(),
                link: row.link,
                date: row.date.unwrap_or_default(),
                published_at: row.published_at,
            })
            .collect())
    }
}

#[async_trait]
impl SubscriptionDirectory for RestStore {
    async fn list_subscriptions(&self) -> Result<Vec<PushSubscription>, StoreError> {
        let builder = self
            .client
            .get(self.table_url(SUBSCRIPTIONS_TABLE))
            .query(&[("select", "endpoint,keys,subscription")]);
        let resp = self.send("list_subscriptions", builder).await?;
        let rows: Vec<SubscriptionRow> = Self::decode("list_subscriptions", resp).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let endpoint = row.endpoint.clone();
            match subscription_from_row(row) {
                Some(sub) => out.push(sub),
                None => warn!(%endpoint, "skipping subscription without usable keys"),
            }
        }
        Ok(out)
    }

    async fn upsert_subscription(&self, subscription: &PushSubscription) -> Result<(), StoreError> {
        let keys = serde_json::to_string(&subscription.keys).map_err(|e| StoreError::Decode {
            operation: "upsert_subscription",
            message: e.to_string(),
        })?;
        let row = SubscriptionUpsertRow {
            endpoint: &subscription.endpoint,
            keys,
            subscription: &subscription.raw,
        };
        let builder = self
            .client
            .post(self.table_url(SUBSCRIPTIONS_TABLE))
            .query(&[("on_conflict", "endpoint")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row]);
        self.send("upsert_subscription", builder).await?;
        Ok(())
    }
}
