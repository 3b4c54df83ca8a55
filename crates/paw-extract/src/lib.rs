//! Selector-driven article extraction from listing pages.

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use paw_core::{ArticleRecord, ExtractionRule};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "paw-extract";

pub const DEFAULT_SNIPPET_ITEMS: usize = 5;
pub const MAX_SNIPPET_CHARS: usize = 20_000;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid {field} selector `{selector}`: {message}")]
    Selector {
        field: &'static str,
        selector: String,
        message: String,
    },
    #[error("invalid page url `{url}`: {source}")]
    BaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// An [`ExtractionRule`] whose selectors have all been parsed.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: ExtractionRule,
    list: Selector,
    title: Selector,
    link: Selector,
    date: Selector,
}

impl CompiledRule {
    pub fn compile(rule: &ExtractionRule) -> Result<Self, ExtractError> {
        Ok(Self {
            list: parse_selector("list", &rule.list_selector)?,
            title: parse_selector("title", &rule.fields.title)?,
            link: parse_selector("link", &rule.fields.link)?,
            date: parse_selector("date", &rule.fields.date)?,
            rule: rule.clone(),
        })
    }

    pub fn rule(&self) -> &ExtractionRule {
        &self.rule
    }
}

fn parse_selector(field: &'static str, selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        field,
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

pub fn parse_base_url(url: &str) -> Result<Url, ExtractError> {
    Url::parse(url).map_err(|source| ExtractError::BaseUrl {
        url: url.to_string(),
        source,
    })
}

/// Extracts one record per list match, in document order.
///
/// Field selectors only ever see the descendants of their own list item.
/// Items where both title and link come out empty are dropped.
pub fn extract(html: &str, base_url: &Url, rule: &CompiledRule) -> Vec<ArticleRecord> {
    let document = Html::parse_document(html);
    let records = document
        .select(&rule.list)
        .filter_map(|item| record_from_item(item, base_url, rule))
        .collect::<Vec<_>>();
    tracing::debug!(count = records.len(), list = %rule.rule.list_selector, "extracted records");
    records
}

/// Compiles `rule` and extracts in one go.
pub fn extract_with_rule(
    html: &str,
    page_url: &str,
    rule: &ExtractionRule,
) -> Result<Vec<ArticleRecord>, ExtractError> {
    let compiled = CompiledRule::compile(rule)?;
    let base = parse_base_url(page_url)?;
    Ok(extract(html, &base, &compiled))
}

fn record_from_item(item: ElementRef<'_>, base_url: &Url, rule: &CompiledRule) -> Option<ArticleRecord> {
    let title = item
        .select(&rule.title)
        .next()
        .map(element_text)
        .unwrap_or_default();
    let link = item
        .select(&rule.link)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|href| normalize_link(base_url, href.trim()))
        .unwrap_or_default();
    let date_el = item.select(&rule.date).next();
    let date = date_el.map(element_text).unwrap_or_default();

    if title.is_empty() && link.is_empty() {
        return None;
    }

    let published_at = date_el
        .and_then(|el| el.value().attr("datetime"))
        .and_then(parse_published_at)
        .or_else(|| parse_published_at(&date));

    Some(ArticleRecord {
        title,
        link,
        date,
        published_at,
    })
}

/// Concatenates the text nodes, then collapses whitespace runs to one space.
fn element_text(el: ElementRef<'_>) -> String {
    let raw: String = el.text().collect();
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolves root-relative links against the page URL. Everything else is
/// returned unchanged.
pub fn normalize_link(base_url: &Url, link: &str) -> String {
    if link.starts_with('/') {
        if let Ok(resolved) = base_url.join(link) {
            return resolved.to_string();
        }
    }
    link.to_string()
}

static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4})\s*[-/.年]\s*(\d{1,2})\s*[-/.月]\s*(\d{1,2})").expect("valid date regex")
});

/// Best-effort timestamp from a `datetime` attribute or visible date text.
/// Date-only values are taken as midnight UTC.
pub fn parse_published_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let caps = DATE_RE.captures(raw)?;
    let year = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    let day = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

/// What the selector-preview endpoint returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    pub items: Vec<ArticleRecord>,
    pub html_snippet: String,
}

/// Extraction plus the outer HTML of the first `snippet_items` list matches,
/// so an operator can see what the list selector actually hit.
pub fn preview(html: &str, base_url: &Url, rule: &CompiledRule, snippet_items: usize) -> Preview {
    let document = Html::parse_document(html);
    let mut snippet = String::new();
    for item in document.select(&rule.list).take(snippet_items) {
        if !snippet.is_empty() {
            snippet.push('\n');
        }
        snippet.push_str(&item.html());
    }
    if snippet.chars().count() > MAX_SNIPPET_CHARS {
        snippet = snippet.chars().take(MAX_SNIPPET_CHARS).collect();
    }
    let items = document
        .select(&rule.list)
        .filter_map(|item| record_from_item(item, base_url, rule))
        .collect();
    Preview {
        items,
        html_snippet: snippet,
    }
}
