//! Candidate discovery and redirect decoding.
//!
//! - [`UrlDecoder`]: turns an aggregator redirect link into the article URL
//! - [`AggregatorSearch`]: news aggregator search (Google News RSS)
//! - [`ExternalSearch`]: paid web news search (Serper)
//!
//! All three are collaborators of the pipeline; failures come back as empty
//! results and are logged here.

use crate::config::ExternalSearchSettings;
use crate::meta::extract_meta;
use crate::models::{Candidate, CandidateOrigin, OriginalContext};
use crate::utils::{
    clamp_chars, is_aggregator_url, is_blank, normalize_title_for_search, parse_url, search_terms_from_url,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use quick_xml::de::from_str;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::cell::Cell;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(600);
const MAX_QUERY_CHARS: usize = 200;

#[async_trait(?Send)]
pub trait UrlDecoder {
    /// Article URL behind `redirect_url`, or an empty string.
    async fn decode(&self, redirect_url: &str) -> String;
    /// How long the decoder wants callers to back off.
    fn cooldown(&self) -> Duration;
}

#[async_trait(?Send)]
pub trait AggregatorSearch {
    async fn search(&self, query: &str) -> Vec<Candidate>;
}

#[async_trait(?Send)]
pub trait ExternalSearch {
    fn enabled(&self) -> bool;
    async fn search(&self, query: &str) -> Vec<Candidate>;
}

/// Follows the aggregator's redirect chain with a plain HTTP client and
/// falls back to the canonical link of the landing page.
#[derive(Debug)]
pub struct RedirectDecoder {
    client: Client,
    blocked_until: Cell<Option<Instant>>,
}

impl RedirectDecoder {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            blocked_until: Cell::new(None),
        }
    }
}

#[async_trait(?Send)]
impl UrlDecoder for RedirectDecoder {
    #[instrument(level = "info", skip_all, fields(url = %redirect_url))]
    async fn decode(&self, redirect_url: &str) -> String {
        if parse_url(redirect_url).is_none() {
            return String::new();
        }
        let response = match self.client.get(redirect_url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Redirect decode request failed");
                return String::new();
            }
        };
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            warn!("Aggregator rate limited decoding; cooling down");
            self.blocked_until.set(Some(Instant::now() + RATE_LIMIT_COOLDOWN));
            return String::new();
        }
        let landed = response.url().to_string();
        if !is_aggregator_url(&landed) {
            info!(%landed, "Decoded redirect");
            return landed;
        }
        let body = response.text().await.unwrap_or_default();
        let meta = extract_meta(&body);
        if !is_blank(&meta.canonical_url) && !is_aggregator_url(&meta.canonical_url) {
            info!(landed = %meta.canonical_url, "Decoded redirect from landing page");
            return meta.canonical_url;
        }
        debug!("Redirect did not leave the aggregator");
        String::new()
    }

    fn cooldown(&self) -> Duration {
        self.blocked_until
            .get()
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    source: Option<ItemSource>,
}

#[derive(Debug, Deserialize)]
struct ItemSource {
    #[serde(rename = "@url", default)]
    url: String,
    #[serde(rename = "$text", default)]
    name: String,
}

/// Parse a Google News RSS feed into aggregator candidates.
pub fn parse_news_rss(xml: &str) -> Result<Vec<Candidate>, quick_xml::DeError> {
    let rss: Rss = from_str(xml)?;
    let candidates = rss
        .channel
        .item
        .into_iter()
        .enumerate()
        .filter_map(|(i, it)| {
            let link = it.link?.trim().to_string();
            let source = it.source.unwrap_or(ItemSource {
                url: String::new(),
                name: String::new(),
            });
            let name = if is_blank(&source.name) { source.url } else { source.name };
            Some(Candidate {
                source: name.trim().to_string(),
                url: String::new(),
                gn_url: link,
                title: normalize_title_for_search(it.title.as_deref().unwrap_or_default()),
                date: it.pub_date.unwrap_or_default(),
                origin: CandidateOrigin::Aggregator,
                rank: Some(i as u32 + 1),
            })
        })
        .collect();
    Ok(candidates)
}

#[derive(Debug, Clone)]
pub struct GoogleNewsRss {
    client: Client,
    base: String,
}

impl GoogleNewsRss {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base: "https://news.google.com/rss/search".to_string(),
        }
    }

    fn feed_url(&self, query: &str) -> String {
        format!(
            "{}?q={}&hl=en-US&gl=US&ceid=US:en",
            self.base,
            urlencoding::encode(query)
        )
    }
}

#[async_trait(?Send)]
impl AggregatorSearch for GoogleNewsRss {
    #[instrument(level = "info", skip_all, fields(%query))]
    async fn search(&self, query: &str) -> Vec<Candidate> {
        let url = self.feed_url(query);
        let xml = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r.text().await.unwrap_or_default(),
            Ok(r) => {
                warn!(status = r.status().as_u16(), "Aggregator search failed");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "Aggregator search request failed");
                return Vec::new();
            }
        };
        match parse_news_rss(&xml) {
            Ok(found) => {
                info!(count = found.len(), "Aggregator search results");
                found
            }
            Err(e) => {
                warn!(error = %e, "Aggregator feed unparseable");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    news: Vec<SerperItem>,
}

#[derive(Debug, Deserialize)]
struct SerperItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    date: String,
    #[serde(default)]
    source: String,
    position: Option<u32>,
}

/// Parse a Serper news response into external candidates.
pub fn parse_serper(raw: &str) -> Result<Vec<Candidate>, serde_json::Error> {
    let parsed: SerperResponse = serde_json::from_str(raw)?;
    Ok(parsed
        .news
        .into_iter()
        .enumerate()
        .map(|(i, item)| Candidate {
            source: item.source,
            url: item.link,
            gn_url: String::new(),
            title: item.title,
            date: item.date,
            origin: CandidateOrigin::External("serper".to_string()),
            rank: Some(item.position.unwrap_or(i as u32 + 1)),
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct SerperSearch {
    client: Client,
    api_key: Option<String>,
    settings: ExternalSearchSettings,
}

impl SerperSearch {
    pub fn new(client: Client, api_key: Option<String>, settings: ExternalSearchSettings) -> Self {
        Self {
            client,
            api_key,
            settings,
        }
    }
}

#[async_trait(?Send)]
impl ExternalSearch for SerperSearch {
    fn enabled(&self) -> bool {
        self.settings.enabled && self.api_key.as_deref().is_some_and(|k| !is_blank(k))
    }

    #[instrument(level = "info", skip_all, fields(%query))]
    async fn search(&self, query: &str) -> Vec<Candidate> {
        let Some(key) = self.api_key.as_deref() else {
            return Vec::new();
        };
        let response = self
            .client
            .post(&self.settings.endpoint)
            .header("X-API-KEY", key)
            .json(&json!({ "q": query, "num": self.settings.max_results }))
            .send()
            .await;
        let raw = match response {
            Ok(r) if r.status().is_success() => r.text().await.unwrap_or_default(),
            Ok(r) => {
                warn!(status = r.status().as_u16(), "External search failed");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "External search request failed");
                return Vec::new();
            }
        };
        match parse_serper(&raw) {
            Ok(found) => {
                info!(count = found.len(), "External search results");
                found
            }
            Err(e) => {
                warn!(error = %e, "External search response unparseable");
                Vec::new()
            }
        }
    }
}

/// Queries for external search: the cleaned original headline, then the
/// words of the original URL slug.
pub fn external_queries(original: &OriginalContext, max_queries: usize) -> Vec<String> {
    let title = normalize_title_for_search(original.title());
    let slug = search_terms_from_url(&original.url);
    [title, slug]
        .into_iter()
        .map(|q| clamp_chars(q.trim(), MAX_QUERY_CHARS))
        .filter(|q| !q.is_empty())
        .unique_by(|q| q.to_lowercase())
        .take(max_queries)
        .collect()
}

/// Run queries one after another and concatenate the results in order.
pub async fn search_all(search: &dyn ExternalSearch, queries: Vec<String>) -> Vec<Candidate> {
    let batches: Vec<Vec<Candidate>> = stream::iter(queries)
        .then(|query| async move { search.search(&query).await })
        .collect()
        .await;
    batches.into_iter().flatten().collect()
}
