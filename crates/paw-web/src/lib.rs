//! Axum + Askama surface: article listing, selector preview and push
//! subscription management for the browser app.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use paw_core::{ArticleRecord, ExtractionRule, FieldSelectors, NotificationPayload, PushSubscription};
use paw_extract::{parse_base_url, CompiledRule, DEFAULT_SNIPPET_ITEMS};
use paw_notify::{Notifier, WebPushTransport};
use paw_storage::{
    ArticleStore, HttpClientConfig, HttpFetcher, PageFetcher, RestStore, RestStoreConfig, SubscriptionDirectory,
};
use paw_sync::PawConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "paw-web";
pub const DEFAULT_ARTICLE_LIMIT: usize = 50;
pub const MAX_ARTICLE_LIMIT: usize = 200;

pub struct AppState {
    articles: Arc<dyn ArticleStore>,
    directory: Arc<dyn SubscriptionDirectory>,
    pages: Arc<dyn PageFetcher>,
    notifier: Option<Notifier>,
}

impl AppState {
    pub fn new(
        articles: Arc<dyn ArticleStore>,
        directory: Arc<dyn SubscriptionDirectory>,
        pages: Arc<dyn PageFetcher>,
    ) -> Self {
        Self {
            articles,
            directory,
            pages,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Article reads go through the anon key when one is configured; writes
    /// to the subscription table always use the service key. Push is left
    /// disabled when the VAPID pair is missing or unusable.
    pub fn from_config(config: &PawConfig) -> anyhow::Result<Self> {
        let store = config.store_settings()?;
        let service = Arc::new(RestStore::new(RestStoreConfig {
            base_url: store.url.clone(),
            api_key: store.service_key,
            timeout: config.http_timeout,
        })?);
        let articles: Arc<dyn ArticleStore> = match store.anon_key {
            Some(anon_key) => Arc::new(RestStore::new(RestStoreConfig {
                base_url: store.url,
                api_key: anon_key,
                timeout: config.http_timeout,
            })?),
            None => service.clone(),
        };
        let pages = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;

        let mut state = Self::new(articles, service, Arc::new(pages));
        let transport = config
            .vapid()
            .map_err(|e| e.to_string())
            .and_then(|vapid| WebPushTransport::new(vapid, config.http_timeout).map_err(|e| e.to_string()));
        match transport {
            Ok(transport) => state = state.with_notifier(Notifier::new(Arc::new(transport))),
            Err(reason) => warn!(%reason, "push disabled; /push/test will answer 500"),
        }
        Ok(state)
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    articles: Vec<IndexRow>,
    generated_at: String,
}

/// One listed article. `href` is empty unless the scraped link is http(s),
/// so `javascript:` and other schemes render as plain text.
struct IndexRow {
    title: String,
    href: String,
    date: String,
}

impl From<ArticleRecord> for IndexRow {
    fn from(article: ArticleRecord) -> Self {
        let lower = article.link.to_ascii_lowercase();
        let href = if lower.starts_with("http://") || lower.starts_with("https://") {
            article.link
        } else {
            String::new()
        };
        Self {
            title: article.title,
            href,
            date: article.date,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/articles", get(articles_handler))
        .route("/preview", post(preview_handler))
        .route("/subscriptions", post(subscribe_handler))
        .route("/push/test", post(push_test_handler))
        .layer(CorsLayer::very_permissive())
        .with_state(Arc::new(state))
}

pub async fn serve(config: &PawConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.articles.recent_articles(DEFAULT_ARTICLE_LIMIT).await {
        Ok(articles) => render_html(IndexTemplate {
            articles: articles.into_iter().map(IndexRow::from).collect(),
            generated_at: Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
        }),
        Err(err) => server_error(anyhow::anyhow!(err)),
    }
}

#[derive(Debug, Deserialize)]
struct ArticlesQuery {
    limit: Option<usize>,
}

async fn articles_handler(State(state): State<Arc<AppState>>, Query(query): Query<ArticlesQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_ARTICLE_LIMIT).clamp(1, MAX_ARTICLE_LIMIT);
    match state.articles.recent_articles(limit).await {
        Ok(articles) => Json(articles).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewRequest {
    url: String,
    list_selector: String,
    #[serde(default)]
    mapping: FieldSelectors,
}

async fn preview_handler(State(state): State<Arc<AppState>>, Json(req): Json<PreviewRequest>) -> Response {
    let rule = ExtractionRule {
        list_selector: req.list_selector,
        fields: req.mapping,
    };
    let compiled = match CompiledRule::compile(&rule) {
        Ok(compiled) => compiled,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let base = match parse_base_url(&req.url) {
        Ok(base) => base,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let html = match state.pages.fetch_page(Uuid::new_v4(), base.as_str()).await {
        Ok(html) => html,
        Err(err) => {
            warn!(url = %base, error = %err, "preview fetch failed");
            return json_error(StatusCode::BAD_GATEWAY, err.to_string());
        }
    };
    Json(paw_extract::preview(&html, &base, &compiled, DEFAULT_SNIPPET_ITEMS)).into_response()
}

async fn subscribe_handler(State(state): State<Arc<AppState>>, Json(raw): Json<Value>) -> Response {
    let Some(subscription) = PushSubscription::from_browser_json(raw) else {
        return json_error(StatusCode::BAD_REQUEST, "subscription needs endpoint and keys");
    };
    match state.directory.upsert_subscription(&subscription).await {
        Ok(()) => {
            info!(endpoint = %subscription.endpoint, "subscription saved");
            Json(json!({ "ok": true })).into_response()
        }
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct PushTestRequest {
    subscription: Option<Value>,
    payload: Option<NotificationPayload>,
}

fn test_payload() -> NotificationPayload {
    NotificationPayload {
        title: "テスト通知".to_string(),
        body: "通知のテストです".to_string(),
        url: "/".to_string(),
    }
}

async fn push_test_handler(State(state): State<Arc<AppState>>, Json(req): Json<PushTestRequest>) -> Response {
    let Some(raw) = req.subscription else {
        return json_error(StatusCode::BAD_REQUEST, "missing subscription");
    };
    let Some(subscription) = PushSubscription::from_browser_json(raw) else {
        return json_error(StatusCode::BAD_REQUEST, "subscription needs endpoint and keys");
    };
    let Some(notifier) = state.notifier.as_ref() else {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "push is not configured");
    };
    let payload = req.payload.unwrap_or_else(test_payload);
    match notifier.send_one(&subscription, &payload).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => {
            warn!(endpoint = %subscription.endpoint, error = %err, "test push failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use paw_notify::{DeliveryError, PushTransport};
    use paw_storage::{FetchError, MemoryStore};
    use std::sync::Mutex;
    use tower::ServiceExt;

    const PAGE: &str = r#"<html><body>
        <div class="post"><h3>First</h3><a href="/p/1">more</a><span class="d">2024-05-01</span></div>
        <div class="post"><h3>Second</h3><a href="https://other.jp/2">more</a></div>
    </body></html>"#;

    struct FixedPage;

    #[async_trait]
    impl PageFetcher for FixedPage {
        async fn fetch_page(&self, _run_id: Uuid, url: &str) -> Result<String, FetchError> {
            if url.contains("missing") {
                return Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                });
            }
            Ok(PAGE.to_string())
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        fail: bool,
        sent: Mutex<Vec<(String, NotificationPayload)>>,
    }

    #[async_trait]
    impl PushTransport for RecordingTransport {
        async fn deliver(
            &self,
            subscription: &PushSubscription,
            payload: &NotificationPayload,
        ) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Gone { status: 410 });
            }
            self.sent
                .lock()
                .unwrap()
                .push((subscription.endpoint.clone(), payload.clone()));
            Ok(())
        }
    }

    fn state(store: Arc<MemoryStore>) -> AppState {
        AppState::new(store.clone(), store, Arc::new(FixedPage))
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn browser_subscription(endpoint: &str) -> Value {
        json!({
            "endpoint": endpoint,
            "expirationTime": null,
            "keys": { "p256dh": "BPk", "auth": "s3cr3t" }
        })
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut older = ArticleRecord::new("Older", "https://x.jp/old", "2024/04/30");
        older.published_at = paw_extract::parse_published_at("2024-04-30");
        let mut newer = ArticleRecord::new("Newer <b>", "https://x.jp/new", "2024/05/01");
        newer.published_at = paw_extract::parse_published_at("2024-05-01");
        store.upsert_articles(&[older, newer]).await.unwrap();
        store
    }

    #[tokio::test]
    async fn health_reports_ok_and_time() {
        let resp = app(state(Arc::new(MemoryStore::new())))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["ok"], true);
        assert!(body["now"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn articles_are_newest_first_and_limited() {
        let app = app(state(seeded_store().await));
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/articles").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body[0]["link"], "https://x.jp/new");
        assert_eq!(body[1]["link"], "https://x.jp/old");

        let resp = app
            .oneshot(Request::builder().uri("/articles?limit=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn index_renders_escaped_titles() {
        let resp = app(state(seeded_store().await))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("Push Article Watcher"));
        assert!(text.contains("Older"));
        assert!(text.contains("Newer &lt;b&gt;"));
    }

    #[tokio::test]
    async fn index_links_only_http_urls() {
        let store = seeded_store().await;
        store
            .upsert_articles(&[ArticleRecord::new("Scripted", "javascript:alert(1)", "")])
            .await
            .unwrap();
        let resp = app(state(store))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("Scripted"));
        assert!(!text.contains("javascript:"));
        assert!(text.contains("<a href="));
    }

    #[tokio::test]
    async fn preview_returns_items_and_snippet() {
        let resp = app(state(Arc::new(MemoryStore::new())))
            .oneshot(json_request(
                "POST",
                "/preview",
                json!({
                    "url": "https://blog.example.jp/list",
                    "listSelector": ".post",
                    "mapping": { "title": "h3", "link": "a", "date": ".d" }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["items"][0]["title"], "First");
        assert_eq!(body["items"][0]["link"], "https://blog.example.jp/p/1");
        assert_eq!(body["items"][0]["date"], "2024-05-01");
        assert_eq!(body["items"][1]["link"], "https://other.jp/2");
        assert!(body["htmlSnippet"].as_str().unwrap().contains("class=\"post\""));
    }

    #[tokio::test]
    async fn preview_rejects_bad_selector_and_reports_fetch_failure() {
        let app = app(state(Arc::new(MemoryStore::new())));
        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/preview",
                json!({ "url": "https://blog.example.jp/", "listSelector": "div[[" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());

        let resp = app
            .oneshot(json_request(
                "POST",
                "/preview",
                json!({ "url": "https://blog.example.jp/missing", "listSelector": "article" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn subscribing_twice_keeps_one_entry() {
        let store = Arc::new(MemoryStore::new());
        let app = app(state(store.clone()));
        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(json_request("POST", "/subscriptions", browser_subscription("https://push.example/a")))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        assert_eq!(store.list_subscriptions().await.unwrap().len(), 1);

        let resp = app
            .oneshot(json_request("POST", "/subscriptions", json!({ "endpoint": "https://push.example/b" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn push_test_uses_default_payload() {
        let transport = Arc::new(RecordingTransport::default());
        let state = state(Arc::new(MemoryStore::new())).with_notifier(Notifier::new(transport.clone()));
        let resp = app(state)
            .oneshot(json_request(
                "POST",
                "/push/test",
                json!({ "subscription": browser_subscription("https://push.example/a") }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({ "ok": true }));

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "https://push.example/a");
        assert_eq!(sent[0].1, test_payload());
    }

    #[tokio::test]
    async fn push_test_error_statuses() {
        let failing = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let app = app(state(Arc::new(MemoryStore::new())).with_notifier(Notifier::new(failing)));

        let resp = app
            .clone()
            .oneshot(json_request("POST", "/push/test", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "missing subscription");

        let resp = app
            .oneshot(json_request(
                "POST",
                "/push/test",
                json!({
                    "subscription": browser_subscription("https://push.example/a"),
                    "payload": { "title": "t", "body": "b", "url": "/x" }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("410"));
    }

    #[tokio::test]
    async fn push_test_without_vapid_is_a_server_error() {
        let resp = app(state(Arc::new(MemoryStore::new())))
            .oneshot(json_request(
                "POST",
                "/push/test",
                json!({ "subscription": browser_subscription("https://push.example/a") }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
