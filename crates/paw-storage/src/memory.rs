//! In-process store with the same merge-on-link semantics as the REST store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use paw_core::{ArticleRecord, PushSubscription};
use tokio::sync::Mutex;

use crate::{collapse_by_link, ArticleStore, StoreError, SubscriptionDirectory};

#[derive(Debug, Default)]
pub struct MemoryStore {
    articles: Mutex<BTreeMap<String, ArticleRecord>>,
    subscriptions: Mutex<BTreeMap<String, PushSubscription>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriptions(subscriptions: impl IntoIterator<Item = PushSubscription>) -> Self {
        let by_endpoint = subscriptions
            .into_iter()
            .map(|sub| (sub.endpoint.clone(), sub))
            .collect();
        Self {
            articles: Mutex::default(),
            subscriptions: Mutex::new(by_endpoint),
        }
    }

    pub async fn article_count(&self) -> usize {
        self.articles.lock().await.len()
    }

    pub async fn article(&self, link: &str) -> Option<ArticleRecord> {
        self.articles.lock().await.get(link).cloned()
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn upsert_articles(&self, articles: &[ArticleRecord]) -> Result<(), StoreError> {
        let mut map = self.articles.lock().await;
        for mut article in collapse_by_link(articles) {
            // an undated write leaves a stored timestamp alone
            if article.published_at.is_none() {
                article.published_at = map.get(&article.link).and_then(|a| a.published_at);
            }
            map.insert(article.link.clone(), article);
        }
        Ok(())
    }

    async fn existing_links(&self, links: &[String]) -> Result<Vec<String>, StoreError> {
        let map = self.articles.lock().await;
        Ok(links
            .iter()
            .filter(|link| map.contains_key(link.as_str()))
            .cloned()
            .collect())
    }

    async fn recent_articles(&self, limit: usize) -> Result<Vec<ArticleRecord>, StoreError> {
        let map = self.articles.lock().await;
        let mut rows = map.values().cloned().collect::<Vec<_>>();
        // newest first, unknown timestamps last
        rows.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[async_trait]
impl SubscriptionDirectory for MemoryStore {
    async fn list_subscriptions(&self) -> Result<Vec<PushSubscription>, StoreError> {
        Ok(self.subscriptions.lock().await.values().cloned().collect())
    }

    async fn upsert_subscription(&self, subscription: &PushSubscription) -> Result<(), StoreError> {
        self.subscriptions
            .lock()
            .await
            .insert(subscription.endpoint.clone(), subscription.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn upserting_same_batch_twice_keeps_one_row_per_link() {
        let store = MemoryStore::new();
        let batch = vec![
            ArticleRecord::new("A", "https://x.jp/a", "1"),
            ArticleRecord::new("B", "https://x.jp/b", "1"),
        ];
        store.upsert_articles(&batch).await.unwrap();
        store.upsert_articles(&batch).await.unwrap();
        assert_eq!(store.article_count().await, 2);

        let renamed = vec![ArticleRecord::new("A (updated)", "https://x.jp/a", "2")];
        store.upsert_articles(&renamed).await.unwrap();
        assert_eq!(store.article_count().await, 2);
        let a = store.article("https://x.jp/a").await.unwrap();
        assert_eq!(a.title, "A (updated)");
        assert_eq!(a.date, "2");
    }

    #[tokio::test]
    async fn undated_rewrite_keeps_stored_timestamp() {
        let store = MemoryStore::new();
        let mut dated = ArticleRecord::new("A", "https://x.jp/a", "");
        dated.published_at = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).single();
        store.upsert_articles(&[dated.clone()]).await.unwrap();
        store
            .upsert_articles(&[ArticleRecord::new("A v2", "https://x.jp/a", "")])
            .await
            .unwrap();
        let a = store.article("https://x.jp/a").await.unwrap();
        assert_eq!(a.title, "A v2");
        assert_eq!(a.published_at, dated.published_at);
    }

    #[tokio::test]
    async fn recent_articles_are_newest_first() {
        let store = MemoryStore::new();
        let mut old = ArticleRecord::new("old", "https://x.jp/old", "");
        old.published_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single();
        let mut new = ArticleRecord::new("new", "https://x.jp/new", "");
        new.published_at = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single();
        let undated = ArticleRecord::new("undated", "https://x.jp/undated", "");
        store.upsert_articles(&[old, undated, new]).await.unwrap();

        let recent = store.recent_articles(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].title, "new");
        assert_eq!(recent[1].title, "old");
    }
}
