//! Scrape -> classify -> persist -> notify orchestration.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use paw_core::{ArticleRecord, RunResult, RunStage};
use paw_extract::{parse_base_url, CompiledRule};
use paw_notify::{Notifier, WebPushTransport};
use paw_storage::{
    ArticleStore, BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, PageFetcher, RestStore,
    RestStoreConfig, RetryDisposition, StoreError, SubscriptionDirectory,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub mod config;
pub mod dedup;
pub mod scheduler;

pub use config::{ConfigError, PawConfig, RuleFile, StoreSettings};
pub use dedup::{classify, new_records, Classification};
pub use scheduler::{build_scheduler, maybe_build_scheduler};

pub const CRATE_NAME: &str = "paw-sync";

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fetching {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("persisting {count} articles failed: {source}")]
    Persist {
        count: usize,
        #[source]
        source: StoreError,
    },
    #[error("run exceeded its {0:?} time limit")]
    Timeout(Duration),
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

impl RunError {
    /// Exit status handed to the scheduler that invoked the process.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Fetch { .. } => 2,
            RunError::Persist { .. } => 3,
            RunError::Config(_) => 4,
            RunError::Timeout(_) => 5,
            RunError::Setup(_) => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub fetch_backoff: BackoffPolicy,
    pub run_timeout: Duration,
    pub lookup_batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fetch_backoff: BackoffPolicy::default(),
            run_timeout: Duration::from_secs(120),
            lookup_batch_size: config::DEFAULT_LOOKUP_BATCH_SIZE,
        }
    }
}

/// Collaborators of one pipeline, all injected.
pub struct PipelineParts {
    pub target_url: String,
    pub rule: CompiledRule,
    pub fetcher: Arc<dyn PageFetcher>,
    pub articles: Arc<dyn ArticleStore>,
    pub directory: Arc<dyn SubscriptionDirectory>,
    pub notifier: Notifier,
}

pub struct SyncPipeline {
    target_url: String,
    base_url: Url,
    rule: CompiledRule,
    fetcher: Arc<dyn PageFetcher>,
    articles: Arc<dyn ArticleStore>,
    directory: Arc<dyn SubscriptionDirectory>,
    notifier: Notifier,
    settings: PipelineSettings,
}

impl SyncPipeline {
    pub fn new(parts: PipelineParts) -> Result<Self, RunError> {
        let base_url = parse_base_url(&parts.target_url)
            .map_err(|e| ConfigError::Invalid(vec![e.to_string()]))?;
        Ok(Self {
            target_url: parts.target_url,
            base_url,
            rule: parts.rule,
            fetcher: parts.fetcher,
            articles: parts.articles,
            directory: parts.directory,
            notifier: parts.notifier,
            settings: PipelineSettings::default(),
        })
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Validates the whole config before anything touches the network.
    pub fn from_config(config: &PawConfig) -> Result<Self, RunError> {
        config.validate_for_pipeline()?;
        let store = config.store_settings()?;
        let vapid = config.vapid()?;
        let rules = config.load_rule_file()?;
        let rule = CompiledRule::compile(&rules.rule)
            .map_err(|e| ConfigError::Invalid(vec![e.to_string()]))?;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        let rest = Arc::new(RestStore::new(RestStoreConfig {
            base_url: store.url,
            api_key: store.service_key,
            timeout: config.http_timeout,
        })?);
        let transport = WebPushTransport::new(vapid, config.http_timeout)
            .map_err(|e| ConfigError::Invalid(vec![e.to_string()]))?;
        let notifier = Notifier::new(Arc::new(transport)).with_concurrency(config.push_concurrency);

        Ok(Self::new(PipelineParts {
            target_url: config.resolve_target_url(&rules),
            rule,
            fetcher: Arc::new(fetcher),
            articles: rest.clone(),
            directory: rest,
            notifier,
        })?
        .with_settings(PipelineSettings {
            fetch_backoff: config.fetch_backoff,
            run_timeout: config.run_timeout,
            lookup_batch_size: config.lookup_batch_size,
        }))
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    /// One full pass. The run timeout is fatal up to the end of persistence;
    /// notifications get whatever budget is left and never fail the run.
    pub async fn run_once(&self) -> Result<RunResult, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, target = %self.target_url);
        let limit = self.settings.run_timeout;
        let deadline = Instant::now() + limit;

        async move {
            let mut stage = RunStage::Idle;
            let persisted = tokio::time::timeout_at(deadline, self.collect_and_persist(run_id, &mut stage)).await;
            let (mut result, fresh) = match persisted {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    error!(limit_ms = limit.as_millis() as u64, ?stage, "run timed out before persisting");
                    return Err(RunError::Timeout(limit));
                }
            };

            if result.scraped > 0 {
                advance(&mut stage, RunStage::Notifying);
                if fresh.is_empty() {
                    info!("no new articles; skipping notifications");
                } else {
                    self.notify(&fresh, &mut result, deadline).await;
                }
            }

            advance(&mut stage, RunStage::Done);
            Ok(finish(result))
        }
        .instrument(span)
        .await
    }

    /// Fetch through persistence. Returns the run counters and the new records.
    async fn collect_and_persist(
        &self,
        run_id: Uuid,
        stage: &mut RunStage,
    ) -> Result<(RunResult, Vec<ArticleRecord>), RunError> {
        let mut result = RunResult::started(run_id, Utc::now());

        advance(stage, RunStage::Fetching);
        let html = match self.fetch_with_retry(run_id).await {
            Ok(html) => html,
            Err(err) => {
                advance(stage, RunStage::Failed);
                error!(error = %err, "fetch failed; aborting run");
                return Err(err);
            }
        };

        advance(stage, RunStage::Extracting);
        let records = paw_extract::extract(&html, &self.base_url, &self.rule);
        result.scraped = records.len();
        info!(count = records.len(), "extracted articles");
        if records.is_empty() {
            info!("listing produced no articles; nothing to persist");
            return Ok((result, Vec::new()));
        }

        advance(stage, RunStage::Classifying);
        let links = records.iter().map(|r| r.link.clone()).collect::<Vec<_>>();
        let classification = classify(self.articles.as_ref(), &links, self.settings.lookup_batch_size).await;
        let fresh = new_records(&records, &classification);
        result.new_count = fresh.len();
        result.skipped_links = classification.skipped;
        result.lookup_failures = classification.unresolved.len();
        info!(
            new = fresh.len(),
            known = classification.known.len(),
            unresolved = classification.unresolved.len(),
            skipped = classification.skipped,
            "classified links"
        );

        advance(stage, RunStage::Persisting);
        if let Err(source) = self.articles.upsert_articles(&records).await {
            advance(stage, RunStage::Failed);
            error!(error = %source, "upsert failed; no notifications will be sent");
            return Err(RunError::Persist {
                count: records.len(),
                source,
            });
        }
        info!(count = records.len(), "upserted articles");
        Ok((result, fresh))
    }

    async fn fetch_with_retry(&self, run_id: Uuid) -> Result<String, RunError> {
        let policy = self.settings.fetch_backoff;
        let mut attempt = 0usize;
        loop {
            match self.fetcher.fetch_page(run_id, &self.target_url).await {
                Ok(html) => return Ok(html),
                Err(err) if err.disposition() == RetryDisposition::Retryable && attempt < policy.max_retries => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "fetch failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(RunError::Fetch {
                        url: self.target_url.clone(),
                        source,
                    })
                }
            }
        }
    }

    /// Directory or delivery trouble, including running out of time, is
    /// logged and never fails the run.
    async fn notify(&self, fresh: &[ArticleRecord], result: &mut RunResult, deadline: Instant) {
        let subscriptions = match tokio::time::timeout_at(deadline, self.directory.list_subscriptions()).await {
            Ok(Ok(subs)) => subs,
            Ok(Err(err)) => {
                warn!(error = %err, "could not list subscriptions; skipping notifications");
                return;
            }
            Err(_) => {
                warn!("run deadline reached while listing subscriptions; skipping notifications");
                return;
            }
        };
        if subscriptions.is_empty() {
            info!("no subscriptions registered");
            return;
        }
        let outcome = self
            .notifier
            .notify_until(fresh, &subscriptions, Some(deadline))
            .await;
        result.notify_attempts = outcome.attempts;
        result.notify_failures = outcome.failures;
    }
}

fn advance(stage: &mut RunStage, next: RunStage) {
    if next == RunStage::Failed {
        debug_assert!(stage.can_fail(), "{stage:?} has no failure edge");
    }
    tracing::debug!(from = ?stage, to = ?next, "stage transition");
    *stage = next;
}

fn finish(mut result: RunResult) -> RunResult {
    result.finished_at = Utc::now();
    info!(
        scraped = result.scraped,
        new = result.new_count,
        notify_attempts = result.notify_attempts,
        notify_failures = result.notify_failures,
        "run finished"
    );
    result
}

pub async fn run_sync_once_from_env() -> Result<RunResult, RunError> {
    let config = PawConfig::from_env()?;
    SyncPipeline::from_config(&config)?.run_once().await
}
