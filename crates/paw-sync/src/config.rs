//! Process configuration, read once from the environment and validated up front.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use paw_core::ExtractionRule;
use paw_notify::{VapidConfig, DEFAULT_PUSH_CONCURRENCY};
use paw_storage::{BackoffPolicy, DEFAULT_USER_AGENT};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_TARGET_URL: &str = "https://iphone-mania.jp/";
pub const DEFAULT_RULES_FILE: &str = "rules.yaml";
pub const DEFAULT_VAPID_SUBJECT: &str = "mailto:admin@example.com";
pub const DEFAULT_SYNC_CRON: &str = "0 */15 * * * *";
pub const DEFAULT_LOOKUP_BATCH_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("rules file {path}: {message}")]
    Rules { path: String, message: String },
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub url: String,
    pub service_key: String,
    pub anon_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PawConfig {
    pub target_url: Option<String>,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub fetch_backoff: BackoffPolicy,
    pub run_timeout: Duration,
    pub rules_path: Option<PathBuf>,
    pub store_url: Option<String>,
    pub service_key: Option<String>,
    pub anon_key: Option<String>,
    pub vapid_public_key: Option<String>,
    pub vapid_private_key: Option<String>,
    pub vapid_subject: String,
    pub push_concurrency: usize,
    pub lookup_batch_size: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

/// Rule file as written by operators. `url` is optional; `PAW_TARGET_URL` wins over it.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(flatten)]
    pub rule: ExtractionRule,
}

impl PawConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; numeric parse failures are
    /// collected instead of silently falling back.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut problems = Vec::new();

        let http_timeout_secs: u64 = parse_or(&var, "PAW_HTTP_TIMEOUT_SECS", 20, &mut problems);
        let fetch_retries: usize = parse_or(&var, "PAW_FETCH_RETRIES", 2, &mut problems);
        let run_timeout_secs: u64 = parse_or(&var, "PAW_RUN_TIMEOUT_SECS", 120, &mut problems);
        let push_concurrency: usize =
            parse_or(&var, "PAW_PUSH_CONCURRENCY", DEFAULT_PUSH_CONCURRENCY, &mut problems);
        let lookup_batch_size: usize =
            parse_or(&var, "PAW_LOOKUP_BATCH_SIZE", DEFAULT_LOOKUP_BATCH_SIZE, &mut problems);
        let web_port: u16 = parse_or(&var, "PAW_WEB_PORT", 8000, &mut problems);

        if push_concurrency == 0 {
            problems.push("PAW_PUSH_CONCURRENCY must be at least 1".to_string());
        }
        if lookup_batch_size == 0 {
            problems.push("PAW_LOOKUP_BATCH_SIZE must be at least 1".to_string());
        }
        if run_timeout_secs == 0 {
            problems.push("PAW_RUN_TIMEOUT_SECS must be at least 1".to_string());
        }

        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        Ok(Self {
            target_url: var("PAW_TARGET_URL"),
            user_agent: var("PAW_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout: Duration::from_secs(http_timeout_secs),
            fetch_backoff: BackoffPolicy {
                max_retries: fetch_retries,
                ..Default::default()
            },
            run_timeout: Duration::from_secs(run_timeout_secs),
            rules_path: var("PAW_RULES_PATH").map(PathBuf::from),
            store_url: var("SUPABASE_URL"),
            service_key: var("SUPABASE_SERVICE_ROLE_KEY"),
            anon_key: var("SUPABASE_ANON_KEY"),
            vapid_public_key: var("VAPID_PUBLIC_KEY"),
            vapid_private_key: var("VAPID_PRIVATE_KEY"),
            vapid_subject: var("VAPID_SUBJECT").unwrap_or_else(|| DEFAULT_VAPID_SUBJECT.to_string()),
            push_concurrency,
            lookup_batch_size,
            scheduler_enabled: var("PAW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("PAW_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            web_port,
        })
    }

    pub fn store_settings(&self) -> Result<StoreSettings, ConfigError> {
        let mut problems = Vec::new();
        self.collect_store_problems(&mut problems);
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }
        Ok(StoreSettings {
            url: self.store_url.clone().unwrap_or_default(),
            service_key: self.service_key.clone().unwrap_or_default(),
            anon_key: self.anon_key.clone(),
        })
    }

    pub fn vapid(&self) -> Result<VapidConfig, ConfigError> {
        let mut problems = Vec::new();
        self.collect_vapid_problems(&mut problems);
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }
        Ok(self.vapid_unchecked())
    }

    /// Everything a scrape run needs, reported in one error.
    pub fn validate_for_pipeline(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        self.collect_store_problems(&mut problems);
        self.collect_vapid_problems(&mut problems);
        if let Some(url) = &self.target_url {
            if url::Url::parse(url).is_err() {
                problems.push(format!("PAW_TARGET_URL is not a valid URL: {url}"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    fn collect_store_problems(&self, problems: &mut Vec<String>) {
        match &self.store_url {
            None => problems.push("SUPABASE_URL is missing".to_string()),
            Some(url) if url::Url::parse(url).is_err() => {
                problems.push(format!("SUPABASE_URL is not a valid URL: {url}"))
            }
            Some(_) => {}
        }
        if self.service_key.is_none() {
            problems.push("SUPABASE_SERVICE_ROLE_KEY is missing".to_string());
        }
    }

    fn collect_vapid_problems(&self, problems: &mut Vec<String>) {
        if self.vapid_public_key.is_none() {
            problems.push("VAPID_PUBLIC_KEY is missing".to_string());
        }
        if self.vapid_private_key.is_none() {
            problems.push("VAPID_PRIVATE_KEY is missing".to_string());
        }
        if let Err(err) = self.vapid_unchecked().validate() {
            if self.vapid_public_key.is_some() && self.vapid_private_key.is_some() {
                problems.push(err.to_string());
            }
        }
    }

    fn vapid_unchecked(&self) -> VapidConfig {
        VapidConfig {
            public_key: self.vapid_public_key.clone().unwrap_or_default(),
            private_key: self.vapid_private_key.clone().unwrap_or_default(),
            subject: self.vapid_subject.clone(),
        }
    }

    /// Explicit `PAW_RULES_PATH` must exist; otherwise `rules.yaml` in the
    /// working directory is used when present, else the built-in rule.
    pub fn load_rule_file(&self) -> Result<RuleFile, ConfigError> {
        match &self.rules_path {
            Some(path) => load_rule_file(path),
            None => {
                let fallback = Path::new(DEFAULT_RULES_FILE);
                if fallback.exists() {
                    load_rule_file(fallback)
                } else {
                    Ok(RuleFile {
                        url: None,
                        rule: ExtractionRule::default(),
                    })
                }
            }
        }
    }

    pub fn resolve_target_url(&self, rules: &RuleFile) -> String {
        self.target_url
            .clone()
            .or_else(|| rules.url.clone())
            .unwrap_or_else(|| DEFAULT_TARGET_URL.to_string())
    }
}

fn parse_or<T, V>(var: &V, key: &str, default: T, problems: &mut Vec<String>) -> T
where
    T: FromStr,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => default,
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                problems.push(format!("{key} is not a valid number: {raw}"));
                default
            }
        },
    }
}

pub fn load_rule_file(path: &Path) -> Result<RuleFile, ConfigError> {
    let rules_error = |message: String| ConfigError::Rules {
        path: path.display().to_string(),
        message,
    };
    let text = std::fs::read_to_string(path).map_err(|e| rules_error(e.to_string()))?;
    let parsed: RuleFile = serde_yaml::from_str(&text).map_err(|e| rules_error(e.to_string()))?;
    paw_extract::CompiledRule::compile(&parsed.rule).map_err(|e| rules_error(e.to_string()))?;
    Ok(parsed)
}
