//! Web Push fan-out for newly detected articles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use paw_core::{ArticleRecord, NotificationPayload, PushSubscription};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use web_push::{
    ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushMessageBuilder, URL_SAFE_NO_PAD,
};

pub const CRATE_NAME: &str = "paw-notify";
pub const DEFAULT_PUSH_CONCURRENCY: usize = 8;
pub const DEFAULT_TTL_SECS: u32 = 24 * 60 * 60;

/// Sender identity for the push protocol. Keys are base64url without padding.
#[derive(Clone)]
pub struct VapidConfig {
    pub public_key: String,
    pub private_key: String,
    pub subject: String,
}

impl std::fmt::Debug for VapidConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VapidConfig")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .field("subject", &self.subject)
            .finish()
    }
}

impl VapidConfig {
    pub fn validate(&self) -> Result<(), NotifyError> {
        let mut problems = Vec::new();
        if self.public_key.trim().is_empty() {
            problems.push("VAPID public key is missing");
        }
        if self.private_key.trim().is_empty() {
            problems.push("VAPID private key is missing");
        }
        if !(self.subject.starts_with("mailto:") || self.subject.starts_with("https://")) {
            problems.push("VAPID subject must be a mailto: or https: URI");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(NotifyError::Config(problems.join("; ")))
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("push configuration error: {0}")]
    Config(String),
}

/// Failure of a single (article, subscription) delivery. Never fatal.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscription is gone (http {status})")]
    Gone { status: u16 },
    #[error("push service rejected message (http {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("push request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("could not build push message: {0}")]
    Build(String),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(
        &self,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError>;
}

/// Encrypts (aes128gcm), VAPID-signs and POSTs one message per delivery.
pub struct WebPushTransport {
    client: reqwest::Client,
    vapid: VapidConfig,
    ttl: u32,
}

impl WebPushTransport {
    pub fn new(vapid: VapidConfig, timeout: Duration) -> Result<Self, NotifyError> {
        vapid.validate()?;
        // Parse the private key once up front so a bad key is a config error,
        // not one failed delivery per subscriber.
        let placeholder = SubscriptionInfo::new("https://push.invalid/", "", "");
        VapidSignatureBuilder::from_base64(&vapid.private_key, URL_SAFE_NO_PAD, &placeholder)
            .map_err(|e| NotifyError::Config(format!("VAPID private key is unusable: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Config(format!("building push client: {e}")))?;
        Ok(Self {
            client,
            vapid,
            ttl: DEFAULT_TTL_SECS,
        })
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }
}

fn build_error(err: web_push::WebPushError) -> DeliveryError {
    DeliveryError::Build(err.to_string())
}

#[async_trait]
impl PushTransport for WebPushTransport {
    async fn deliver(
        &self,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError> {
        let info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.keys.p256dh,
            &subscription.keys.auth,
        );
        let mut signature = VapidSignatureBuilder::from_base64(&self.vapid.private_key, URL_SAFE_NO_PAD, &info)
            .map_err(build_error)?;
        signature.add_claim("sub", self.vapid.subject.as_str());
        let signature = signature.build().map_err(build_error)?;

        let content = serde_json::to_vec(payload).map_err(|e| DeliveryError::Build(e.to_string()))?;
        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, &content);
        builder.set_vapid_signature(signature);
        builder.set_ttl(self.ttl);
        let message = builder.build().map_err(build_error)?;

        let (parts, body) = web_push::request_builder::build_request::<Vec<u8>>(message).into_parts();
        let mut request = self.client.post(parts.uri.to_string()).body(body);
        for (name, value) in parts.headers.iter() {
            request = request.header(name.as_str(), value.as_bytes());
        }

        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::GONE || status == StatusCode::NOT_FOUND {
            return Err(DeliveryError::Gone {
                status: status.as_u16(),
            });
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationOutcome {
    pub attempts: usize,
    pub delivered: usize,
    pub failures: usize,
    pub failed_endpoints: Vec<String>,
}

pub struct Notifier {
    transport: Arc<dyn PushTransport>,
    concurrency: usize,
}

impl Notifier {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self {
            transport,
            concurrency: DEFAULT_PUSH_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// One delivery per (article, subscription) pair. A failed delivery is
    /// logged with its endpoint and counted; it never stops the others.
    pub async fn notify(
        &self,
        articles: &[ArticleRecord],
        subscriptions: &[PushSubscription],
    ) -> NotificationOutcome {
        self.notify_until(articles, subscriptions, None).await
    }

    /// Like `notify`, but deliveries still pending at `deadline` are dropped
    /// and counted as failures.
    #[instrument(level = "info", skip_all, fields(articles = articles.len(), subscriptions = subscriptions.len()))]
    pub async fn notify_until(
        &self,
        articles: &[ArticleRecord],
        subscriptions: &[PushSubscription],
        deadline: Option<Instant>,
    ) -> NotificationOutcome {
        let jobs = articles
            .iter()
            .flat_map(|article| {
                let payload = NotificationPayload::for_article(article);
                subscriptions
                    .iter()
                    .map(move |sub| (payload.clone(), sub.clone()))
            })
            .collect::<Vec<(NotificationPayload, PushSubscription)>>();

        let transport = self.transport.clone();
        let results: Vec<Result<(), String>> = stream::iter(jobs)
            .map(move |(payload, sub)| {
                let transport = transport.clone();
                async move {
                    let delivery = transport.deliver(&sub, &payload);
                    let result = match deadline {
                        Some(deadline) => match tokio::time::timeout_at(deadline, delivery).await {
                            Ok(result) => result.map_err(|e| e.to_string()),
                            Err(_) => Err("deadline reached before delivery finished".to_string()),
                        },
                        None => delivery.await.map_err(|e| e.to_string()),
                    };
                    result.map_err(|error| {
                        warn!(endpoint = %sub.endpoint, url = %payload.url, %error, "push delivery failed");
                        sub.endpoint
                    })
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut outcome = NotificationOutcome {
            attempts: results.len(),
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(()) => outcome.delivered += 1,
                Err(endpoint) => {
                    outcome.failures += 1;
                    outcome.failed_endpoints.push(endpoint);
                }
            }
        }
        info!(
            attempts = outcome.attempts,
            delivered = outcome.delivered,
            failures = outcome.failures,
            "notification fan-out finished"
        );
        outcome
    }

    pub async fn send_one(
        &self,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError> {
        self.transport.deliver(subscription, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paw_core::SubscriptionKeys;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        fail_endpoints: Vec<String>,
        delivered: Mutex<Vec<(String, NotificationPayload)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl PushTransport for RecordingTransport {
        async fn deliver(
            &self,
            subscription: &PushSubscription,
            payload: &NotificationPayload,
        ) -> Result<(), DeliveryError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_endpoints.contains(&subscription.endpoint) {
                return Err(DeliveryError::Gone { status: 410 });
            }
            self.delivered
                .lock()
                .unwrap()
                .push((subscription.endpoint.clone(), payload.clone()));
            Ok(())
        }
    }

    fn sub(endpoint: &str) -> PushSubscription {
        PushSubscription {
            endpoint: endpoint.to_string(),
            keys: SubscriptionKeys {
                p256dh: "p".into(),
                auth: "a".into(),
            },
            raw: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn failed_delivery_does_not_stop_the_others() {
        let transport = Arc::new(RecordingTransport {
            fail_endpoints: vec!["https://push.example/2".into()],
            ..Default::default()
        });
        let notifier = Notifier::new(transport.clone());
        let subs = vec![
            sub("https://push.example/1"),
            sub("https://push.example/2"),
            sub("https://push.example/3"),
        ];
        let article = ArticleRecord::new("A", "https://x.jp/a", "");

        let outcome = notifier.notify(&[article], &subs).await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.failed_endpoints, vec!["https://push.example/2".to_string()]);

        let mut endpoints = transport
            .delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(e, p)| {
                assert_eq!(p.url, "https://x.jp/a");
                e.clone()
            })
            .collect::<Vec<_>>();
        endpoints.sort();
        assert_eq!(endpoints, vec!["https://push.example/1", "https://push.example/3"]);
    }

    #[tokio::test]
    async fn every_article_reaches_every_subscription() {
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(transport.clone());
        let articles = vec![
            ArticleRecord::new("A", "https://x.jp/a", ""),
            ArticleRecord::new("B", "https://x.jp/b", ""),
        ];
        let subs = vec![sub("https://push.example/1"), sub("https://push.example/2")];
        let outcome = notifier.notify(&articles, &subs).await;
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.failures, 0);
        assert_eq!(transport.delivered.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn deliveries_respect_the_concurrency_cap() {
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(transport.clone()).with_concurrency(3);
        let subs = (0..12)
            .map(|i| sub(&format!("https://push.example/{i}")))
            .collect::<Vec<_>>();
        let outcome = notifier
            .notify(&[ArticleRecord::new("A", "https://x.jp/a", "")], &subs)
            .await;
        assert_eq!(outcome.delivered, 12);
        assert!(transport.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn nothing_is_sent_without_subscriptions() {
        let transport = Arc::new(RecordingTransport::default());
        let outcome = Notifier::new(transport)
            .notify(&[ArticleRecord::new("A", "https://x.jp/a", "")], &[])
            .await;
        assert_eq!(outcome, NotificationOutcome::default());
    }

    struct StalledTransport;

    #[async_trait]
    impl PushTransport for StalledTransport {
        async fn deliver(
            &self,
            subscription: &PushSubscription,
            _payload: &NotificationPayload,
        ) -> Result<(), DeliveryError> {
            if subscription.endpoint.ends_with("/slow") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn deliveries_pending_at_the_deadline_count_as_failures() {
        let notifier = Notifier::new(Arc::new(StalledTransport));
        let subs = vec![sub("https://push.example/fast"), sub("https://push.example/slow")];
        let deadline = Instant::now() + Duration::from_millis(50);
        let outcome = notifier
            .notify_until(&[ArticleRecord::new("A", "https://x.jp/a", "")], &subs, Some(deadline))
            .await;
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed_endpoints, vec!["https://push.example/slow".to_string()]);
    }

    #[tokio::test]
    async fn notify_future_is_send() {
        let notifier = Arc::new(Notifier::new(Arc::new(RecordingTransport::default())));
        let subs = vec![sub("https://push.example/1")];
        let handle = tokio::spawn(async move {
            notifier
                .notify(&[ArticleRecord::new("A", "https://x.jp/a", "")], &subs)
                .await
        });
        assert_eq!(handle.await.unwrap().delivered, 1);
    }

    #[test]
    fn missing_vapid_keys_are_a_configuration_error() {
        let vapid = VapidConfig {
            public_key: String::new(),
            private_key: " ".into(),
            subject: "admin@example.com".into(),
        };
        let err = vapid.validate().unwrap_err().to_string();
        assert!(err.contains("public key is missing"));
        assert!(err.contains("private key is missing"));
        assert!(err.contains("subject"));
        assert!(WebPushTransport::new(vapid, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn unparseable_private_key_is_rejected_at_construction() {
        let vapid = VapidConfig {
            public_key: "BPublicKeyPlaceholder".into(),
            private_key: "%%% not base64 %%%".into(),
            subject: "mailto:admin@example.com".into(),
        };
        match WebPushTransport::new(vapid, Duration::from_secs(5)) {
            Err(NotifyError::Config(msg)) => assert!(msg.contains("private key")),
            Ok(_) => panic!("expected config error"),
        }
    }
}
