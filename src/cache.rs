//! On-disk content cache keyed by canonical URL.
//!
//! Each cached article is a pair of files named by the SHA-256 of the cleaned
//! URL:
//!
//! - `{key}.html`: `<!--\n{url}\n-->\n` followed by the raw HTML
//! - `{key}.txt`: `{title}\n\n{body}`
//!
//! The URL inside the leading comment is what the alias index reads, so a
//! cache directory can be re-indexed without knowing how keys were computed.

use crate::meta::extract_title;
use crate::models::Event;
use crate::utils::{clamp_chars, host_of, is_aggregator_url, is_blank, last_path_segment, parse_url, source_from_url};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

const TRACKING_PREFIXES: &[&str] = &["utm_", "gaa_", "ga_"];
const TRACKING_KEYS: &[&str] = &[
    "gclid", "fbclid", "yclid", "mc_cid", "mc_eid", "igshid", "cmpid", "ref", "refsrc", "mkt_tok",
];
/// Bytes read from each HTML file when building the alias index.
const ANCHOR_PROBE_BYTES: usize = 2048;

static ANCHOR_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<!--\s*([\s\S]*?)\s*-->").unwrap());

/// Content address of a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// Lowercase hex SHA-256 of `url`.
    pub key: String,
    /// URL with scheme added and tracking parameters removed.
    pub url: String,
}

fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    TRACKING_PREFIXES.iter().any(|p| lower.starts_with(p)) || TRACKING_KEYS.contains(&lower.as_str())
}

/// Canonical form of an article URL: scheme defaulted to https, tracking
/// parameters and fragment removed. `None` for blank or unparseable input.
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut parsed = parse_url(raw)?;
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    parsed.set_query(None);
    if !kept.is_empty() {
        parsed.query_pairs_mut().extend_pairs(kept.iter());
    }
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

pub fn cache_key(raw: &str) -> Option<CacheKey> {
    let url = canonical_url(raw)?;
    let key = format!("{:x}", Sha256::digest(url.as_bytes()));
    Some(CacheKey { key, url })
}

/// `host/last-path-segment`, the slug shared by near-duplicate URLs.
pub fn host_slug(raw: &str) -> Option<String> {
    let parsed = parse_url(raw)?;
    let host = host_of(raw)?;
    let slug = last_path_segment(&parsed)?;
    Some(format!("{host}/{slug}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReason {
    NoUrl,
    Missing,
    Found,
}

impl ProbeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeReason::NoUrl => "no_url",
            ProbeReason::Missing => "no_files",
            ProbeReason::Found => "found",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Probe {
    pub available: bool,
    pub reason: ProbeReason,
    pub key: Option<CacheKey>,
    pub html_path: Option<PathBuf>,
    pub txt_path: Option<PathBuf>,
    pub has_html: bool,
    pub has_txt: bool,
}

impl Probe {
    fn no_url() -> Self {
        Self {
            available: false,
            reason: ProbeReason::NoUrl,
            key: None,
            html_path: None,
            txt_path: None,
            has_html: false,
            has_txt: false,
        }
    }
}

/// The cache directory plus the alias index built over it.
#[derive(Debug)]
pub struct ContentCache {
    dir: PathBuf,
    min_text_length: usize,
    max_text_chars: usize,
    aliases: HashMap<String, String>,
}

impl ContentCache {
    pub fn new(dir: impl Into<PathBuf>, min_text_length: usize, max_text_chars: usize) -> Self {
        Self {
            dir: dir.into(),
            min_text_length,
            max_text_chars,
            aliases: HashMap::new(),
        }
    }

    fn paths(&self, key: &CacheKey) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{}.html", key.key)),
            self.dir.join(format!("{}.txt", key.key)),
        )
    }

    /// Report which artifacts exist for a URL. Never fails: an unusable URL
    /// yields `available = false, reason = NoUrl`.
    pub async fn probe(&self, url: &str) -> Probe {
        let Some(key) = cache_key(url) else {
            return Probe::no_url();
        };
        let (html_path, txt_path) = self.paths(&key);
        let has_html = fs::try_exists(&html_path).await.unwrap_or(false);
        let has_txt = fs::try_exists(&txt_path).await.unwrap_or(false);
        let available = has_html || has_txt;
        Probe {
            available,
            reason: if available { ProbeReason::Found } else { ProbeReason::Missing },
            key: Some(key),
            html_path: Some(html_path),
            txt_path: Some(txt_path),
            has_html,
            has_txt,
        }
    }

    async fn read_raw_html(&self, url: &str) -> Option<String> {
        let key = cache_key(url)?;
        let (html_path, _) = self.paths(&key);
        fs::read_to_string(&html_path).await.ok().filter(|s| !s.is_empty())
    }

    /// Cached HTML with the leading anchor comment removed.
    pub async fn read_html(&self, url: &str) -> Option<String> {
        let raw = self.read_raw_html(url).await?;
        Some(strip_anchor(&raw).to_string())
    }

    /// Fill a blank url, title and source from the cached HTML. Text is untouched.
    pub async fn backfill_meta(&self, event: &mut Event, url: &str) -> bool {
        let before = (event.url.clone(), event.title_en.clone(), event.source.clone());
        if let Some(raw) = self.read_raw_html(url).await {
            if is_blank(&event.url) {
                if let Some(anchor) = anchor_url(&raw) {
                    event.url = anchor;
                }
            }
            if is_blank(&event.title_en) {
                let title = extract_title(strip_anchor(&raw));
                if !title.is_empty() {
                    event.title_en = title;
                }
            }
        }
        infer_source(event);
        (event.url.clone(), event.title_en.clone(), event.source.clone()) != before
    }

    /// Fill `event.text` from the cached text artifact.
    ///
    /// Only applies when the event has no text. Cached text at or below the
    /// minimum length is not a hit: returns false and leaves the text empty.
    pub async fn backfill_text(&self, event: &mut Event, url: &str) -> bool {
        if !event.text.is_empty() {
            return false;
        }
        let Some(key) = cache_key(url) else {
            return false;
        };
        let (_, txt_path) = self.paths(&key);
        let Ok(raw) = fs::read_to_string(&txt_path).await else {
            return false;
        };
        let body = match raw.split_once("\n\n") {
            Some((_, body)) => body,
            None => raw.as_str(),
        }
        .trim();
        if body.chars().count() <= self.min_text_length {
            debug!(key = %key.key, len = body.len(), "Cached text too short");
            return false;
        }
        event.text = clamp_chars(body, self.max_text_chars);
        true
    }

    /// Rewrite only the text artifact.
    pub async fn write_text(&self, event: &Event, text: &str, url: &str) -> io::Result<bool> {
        let Some(key) = cache_key(url) else {
            return Ok(false);
        };
        let (_, txt_path) = self.paths(&key);
        fs::write(&txt_path, format!("{}\n\n{}", event.title(), text)).await?;
        Ok(true)
    }

    /// Store a successful retrieval and copy its text onto the event.
    ///
    /// Blank title and source are filled from the HTML and URL first so the
    /// text artifact carries the headline.
    #[instrument(level = "info", skip_all, fields(id = %event.id))]
    pub async fn write(&self, event: &mut Event, html: &str, text: &str, url: &str) -> io::Result<()> {
        if is_blank(&event.title_en) && !html.is_empty() {
            let title = extract_title(html);
            if !title.is_empty() {
                event.title_en = title;
            }
        }
        infer_source(event);
        event.text = clamp_chars(text, self.max_text_chars);

        let Some(key) = cache_key(url) else {
            warn!(%url, "No cache key; article not cached");
            return Ok(());
        };
        let (html_path, txt_path) = self.paths(&key);
        fs::write(&html_path, format!("<!--\n{}\n-->\n{}", key.url, html)).await?;
        fs::write(&txt_path, format!("{}\n\n{}", event.title(), event.text)).await?;
        debug!(key = %key.key, url = %key.url, "Cached article");
        Ok(())
    }

    /// Scan the cache directory and map `host/slug` to the anchor URL of
    /// each cached page. The longest URL wins for a shared slug.
    #[instrument(level = "info", skip_all, fields(dir = %self.dir.display()))]
    pub async fn build_alias_index(&mut self) -> usize {
        self.aliases.clear();
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("html") {
                continue;
            }
            let Some(head) = read_head(&path).await else {
                continue;
            };
            let Some(url) = anchor_url(&head) else {
                continue;
            };
            let Some(slug) = host_slug(&url) else {
                continue;
            };
            match self.aliases.get(&slug) {
                Some(existing) if existing.len() >= url.len() => {}
                _ => {
                    self.aliases.insert(slug, url);
                }
            }
        }
        info!(aliases = self.aliases.len(), "Built cache alias index");
        self.aliases.len()
    }

    /// Already-cached URL sharing this URL's `host/slug`, if different from it.
    pub fn resolve_alias(&self, url: &str) -> Option<&str> {
        let slug = host_slug(url)?;
        self.aliases
            .get(&slug)
            .map(String::as_str)
            .filter(|alias| *alias != url)
    }
}

async fn read_head(path: &Path) -> Option<String> {
    let mut file = fs::File::open(path).await.ok()?;
    let mut buf = vec![0u8; ANCHOR_PROBE_BYTES];
    let n = file.read(&mut buf).await.ok()?;
    if n == 0 {
        return None;
    }
    buf.truncate(n);
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn anchor_url(html: &str) -> Option<String> {
    let caps = ANCHOR_COMMENT.captures(html)?;
    let url = caps.get(1)?.as_str().trim();
    (!url.is_empty()).then(|| url.to_string())
}

fn strip_anchor(html: &str) -> &str {
    if html.starts_with("<!--") {
        if let Some(end) = html.find("-->") {
            return &html[end + 3..];
        }
    }
    html
}

fn infer_source(event: &mut Event) {
    if is_blank(&event.source) && !is_blank(&event.url) && !is_aggregator_url(&event.url) {
        if let Some(source) = source_from_url(&event.url) {
            event.source = source;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cache_in(dir: &Path) -> ContentCache {
        ContentCache::new(dir, 400, 30_000)
    }

    #[test]
    fn test_cache_key_ignores_tracking_params() {
        let plain = cache_key("a.com?x=1").unwrap();
        let tracked = cache_key("a.com?x=1&utm_source=y").unwrap();
        let reordered = cache_key("https://a.com/?utm_medium=z&x=1&fbclid=abc&utm_source=y").unwrap();
        assert_eq!(plain, tracked);
        assert_eq!(plain, reordered);
        assert_eq!(plain.url, "https://a.com/?x=1");
        assert_eq!(plain.key.len(), 64);
    }

    #[test]
    fn test_cache_key_rejects_blank() {
        assert!(cache_key("").is_none());
        assert!(cache_key("   ").is_none());
    }

    #[test]
    fn test_tracking_param_matching_is_case_insensitive() {
        assert!(is_tracking_param("UTM_Campaign"));
        assert!(is_tracking_param("gaa_at"));
        assert!(is_tracking_param("Ref"));
        assert!(!is_tracking_param("id"));
        assert!(!is_tracking_param("reference"));
    }

    #[tokio::test]
    async fn test_probe_reports_no_url_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        let probe = cache.probe("").await;
        assert!(!probe.available);
        assert_eq!(probe.reason, ProbeReason::NoUrl);

        let probe = cache.probe("https://a.com/story").await;
        assert!(!probe.available);
        assert_eq!(probe.reason, ProbeReason::Missing);
    }

    #[tokio::test]
    async fn test_write_then_probe_and_read() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        let mut event = Event {
            url: "https://www.example.com/world/quake-story?utm_source=x".into(),
            ..Default::default()
        };
        let html = "<html><head><title>Quake story</title></head><body>x</body></html>";
        let text = "t".repeat(600);
        let url = event.url.clone();
        cache.write(&mut event, html, &text, &url).await.unwrap();

        assert_eq!(event.title_en, "Quake story");
        assert_eq!(event.source, "example");
        assert_eq!(event.text.len(), 600);

        let probe = cache.probe("https://www.example.com/world/quake-story").await;
        assert!(probe.available);
        assert!(probe.has_html && probe.has_txt);

        let raw = std::fs::read_to_string(probe.html_path.unwrap()).unwrap();
        assert!(raw.starts_with("<!--\nhttps://www.example.com/world/quake-story\n-->\n<html>"));
        assert_eq!(cache.read_html(&url).await.unwrap().trim_start(), html);
        let txt = std::fs::read_to_string(probe.txt_path.unwrap()).unwrap();
        assert!(txt.starts_with("Quake story\n\nttt"));
    }

    #[tokio::test]
    async fn test_short_cached_text_is_not_a_hit() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        let key = cache_key("https://a.com/short").unwrap();
        std::fs::write(tmp.path().join(format!("{}.txt", key.key)), format!("Title\n\n{}", "s".repeat(399))).unwrap();

        let mut event = Event::default();
        assert!(!cache.backfill_text(&mut event, "https://a.com/short").await);
        assert!(event.text.is_empty());
    }

    #[tokio::test]
    async fn test_long_cached_text_is_truncated() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(tmp.path(), 400, 1_000);
        let key = cache_key("https://a.com/long").unwrap();
        std::fs::write(tmp.path().join(format!("{}.txt", key.key)), format!("Title\n\n{}", "l".repeat(5_000))).unwrap();

        let mut event = Event::default();
        assert!(cache.backfill_text(&mut event, "https://a.com/long").await);
        assert_eq!(event.text.len(), 1_000);

        // existing text is never overwritten
        let mut event = Event {
            text: "already".into(),
            ..Default::default()
        };
        assert!(!cache.backfill_text(&mut event, "https://a.com/long").await);
        assert_eq!(event.text, "already");
    }

    #[tokio::test]
    async fn test_backfill_meta_restores_url_title_and_source() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        let key = cache_key("https://www.bbc.co.uk/news/flood").unwrap();
        let html = "<!--\nhttps://www.bbc.co.uk/news/flood\n-->\n<html><head><meta property=\"og:title\" content=\"Flood rescue\"></head></html>";
        std::fs::write(tmp.path().join(format!("{}.html", key.key)), html).unwrap();

        let mut event = Event::default();
        assert!(cache.backfill_meta(&mut event, "https://www.bbc.co.uk/news/flood").await);
        assert_eq!(event.url, "https://www.bbc.co.uk/news/flood");
        assert_eq!(event.title_en, "Flood rescue");
        assert_eq!(event.source, "bbc");
        assert!(event.text.is_empty());
    }

    #[tokio::test]
    async fn test_alias_index_resolves_host_slug() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cache = cache_in(tmp.path());
        let canonical = "https://www.reuters.com/world/asia/quake-hits-coast-2025-01-02/";
        let mut event = Event::default();
        cache.write(&mut event, "<html></html>", &"x".repeat(500), canonical).await.unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(cache.build_alias_index().await, 1);
        assert_eq!(
            cache.resolve_alias("reuters.com/world/quake-hits-coast-2025-01-02?ref=rss"),
            Some(canonical)
        );
        assert_eq!(cache.resolve_alias(canonical), None);
        assert_eq!(cache.resolve_alias("https://other.com/quake-hits-coast-2025-01-02"), None);
    }
}
