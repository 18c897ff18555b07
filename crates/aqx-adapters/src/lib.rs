//! Search source contracts, the DuckDuckGo HTML adapter, and fixture-first offline sources.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use aqx_core::{canonicalize, ScrapedItem};
use aqx_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::stream::{self, StreamExt};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "aqx-adapters";

pub const DUCKDUCKGO_HTML_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

/// Anchors with shorter text are navigation chrome, not results.
pub const MIN_TITLE_CHARS: usize = 25;
pub const MAX_TITLE_CHARS: usize = 300;
pub const MAX_BODY_CHARS: usize = 600;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// A search hit before its detail page has been fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLink {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailExtract {
    pub body: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SearchSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Items for `keyword` in discovery order, at most `limit` of them.
    async fn discover(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<ScrapedItem>, AdapterError>;
}

pub fn search_url_for(keyword: &str) -> String {
    let query: String = url::form_urlencoded::byte_serialize(keyword.trim().as_bytes()).collect();
    format!("{DUCKDUCKGO_HTML_ENDPOINT}?q={query}")
}

#[derive(Debug, Clone, Copy)]
pub struct DuckDuckGoSource {
    detail_concurrency: usize,
}

impl DuckDuckGoSource {
    pub fn new(detail_concurrency: usize) -> Self {
        Self {
            detail_concurrency: detail_concurrency.max(1),
        }
    }
}

impl Default for DuckDuckGoSource {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl SearchSource for DuckDuckGoSource {
    fn source_id(&self) -> &'static str {
        "duckduckgo"
    }

    async fn discover(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<ScrapedItem>, AdapterError> {
        let search_url = search_url_for(keyword);
        let page = http.fetch_text(ctx.run_id, &search_url).await?;
        let links = parse_result_links(&page.body, &page.final_url, limit)?;
        debug!(keyword, links = links.len(), "parsed search results");

        // `buffered` keeps discovery order while detail fetches overlap.
        let items = stream::iter(links)
            .map(move |link| async move {
                let detail = match http.fetch_text(ctx.run_id, &link.url).await {
                    Ok(detail_page) => extract_detail(&detail_page.body),
                    Err(err) => {
                        warn!(
                            url = %link.url,
                            error = %err,
                            "detail fetch failed; keeping title only"
                        );
                        DetailExtract::default()
                    }
                };
                ScrapedItem {
                    keyword: keyword.to_string(),
                    title: link.title,
                    url: link.url,
                    body: detail.body,
                    published_at: detail.published_at,
                }
            })
            .buffered(self.detail_concurrency)
            .collect::<Vec<_>>()
            .await;

        Ok(items)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Follows DuckDuckGo's `/l/?uddg=` redirect wrapper to the real target.
pub fn unwrap_redirect(link: Url) -> Url {
    let is_ddg = link
        .host_str()
        .map(|h| h == "duckduckgo.com" || h.ends_with(".duckduckgo.com"))
        .unwrap_or(false);
    if !is_ddg || link.path() != "/l/" {
        return link;
    }
    link.query_pairs()
        .find(|(k, _)| k == "uddg")
        .and_then(|(_, target)| Url::parse(&target).ok())
        .unwrap_or(link)
}

/// Result anchors from a search page: long enough text, absolute http(s) target, unique url.
pub fn parse_result_links(
    html: &str,
    page_url: &str,
    limit: usize,
) -> Result<Vec<ResultLink>, AdapterError> {
    let base = Url::parse(page_url)
        .map_err(|e| AdapterError::Message(format!("invalid page url {page_url}: {e}")))?;
    let document = Html::parse_document(html);
    let anchors = selector("a[href]")?;

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for anchor in document.select(&anchors) {
        if out.len() >= limit {
            break;
        }
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let title = collapse_whitespace(&anchor.text().collect::<String>());
        if title.chars().count() < MIN_TITLE_CHARS {
            continue;
        }
        let Ok(resolved) = base.join(href.trim()) else {
            continue;
        };
        let resolved = unwrap_redirect(resolved);
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        let url = resolved.to_string();
        if !seen.insert(url.clone()) {
            continue;
        }
        out.push(ResultLink {
            title: truncate_chars(&title, MAX_TITLE_CHARS),
            url,
        });
    }
    Ok(out)
}

fn visible_text(root: ElementRef<'_>) -> String {
    let mut out = String::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element())
            .map(|el| matches!(el.name(), "script" | "style" | "noscript" | "template"))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        out.push_str(text);
        out.push(' ');
    }
    collapse_whitespace(&out)
}

/// Body snippet and publication time from a detail page.
pub fn extract_detail(html: &str) -> DetailExtract {
    let document = Html::parse_document(html);
    let root = Selector::parse("body")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .unwrap_or_else(|| document.root_element());

    let text = visible_text(root);
    let body = if text.is_empty() {
        None
    } else {
        Some(truncate_chars(&text, MAX_BODY_CHARS))
    };

    let published_at = Selector::parse("time[datetime]")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .and_then(|el| el.value().attr("datetime"))
        .and_then(parse_published_at);

    DetailExtract { body, published_at }
}

/// Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM:SS` (taken as UTC), or a bare date.
pub fn parse_published_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Recorded search output for offline runs and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub items: Vec<ScrapedItem>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixtureSource {
    bundle: FixtureBundle,
}

impl FixtureSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }
}

#[async_trait]
impl SearchSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn discover(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<ScrapedItem>, AdapterError> {
        let wanted = canonicalize(keyword);
        Ok(self
            .bundle
            .items
            .iter()
            .filter(|item| canonicalize(&item.keyword) == wanted)
            .take(limit)
            .cloned()
            .collect())
    }
}
