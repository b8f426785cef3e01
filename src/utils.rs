//! Small helpers shared across the pipeline.
//!
//! - Blank-field predicate used for every row column
//! - URL normalisation, host and slug helpers
//! - Title normalisation for search and for title-key comparison
//! - String truncation for logs and payload budgets
//! - File system validation for the cache directory

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, instrument};
use url::Url;

/// Hosts whose URLs are redirect wrappers rather than articles.
pub const AGGREGATOR_HOSTS: &[&str] = &["news.google.com"];

/// Two-label public suffixes where the registrable name sits one label further left.
const SECOND_LEVEL_SUFFIXES: &[&str] = &["co", "com", "org", "net", "gov", "ac", "edu"];

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").unwrap());
static SOURCE_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+[-|–—]\s+[^-|–—]{2,60}$").unwrap());
static SLUG_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$|^id[A-Z]{2}[A-Z0-9]+$").unwrap());

/// Empty string and whitespace-only string are the same as a missing field.
pub fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Truncate a string for logging purposes.
///
/// Long strings are cut at a character boundary near `max` bytes with an
/// ellipsis and byte count appended.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
    }
}

/// Keep at most `max` characters.
pub fn clamp_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Detect if a serde_json error indicates truncated/incomplete JSON.
///
/// A model response cut off by its token limit fails with an EOF error.
pub fn looks_truncated(e: &serde_json::Error) -> bool {
    use serde_json::error::Category;
    matches!(e.classify(), Category::Eof)
}

/// Parse a URL, adding `https://` when the scheme is missing.
///
/// Inputs that already carry another scheme (`mailto:`, `javascript:`) are
/// rejected; a bare `host:port` is not a scheme.
pub fn parse_url(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = Url::parse(trimmed) {
        let host_port = parsed.path().starts_with(|c: char| c.is_ascii_digit());
        if !matches!(parsed.scheme(), "http" | "https") && !host_port {
            return None;
        }
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed.trim_start_matches('/'))
    };
    let parsed = Url::parse(&candidate).ok()?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Some(parsed),
        _ => None,
    }
}

/// Lowercased host without a leading `www.`.
pub fn host_of(raw: &str) -> Option<String> {
    let parsed = parse_url(raw)?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(host.trim_start_matches("www.").to_string())
}

pub fn is_aggregator_url(raw: &str) -> bool {
    host_of(raw)
        .map(|h| AGGREGATOR_HOSTS.iter().any(|agg| h == *agg || h.ends_with(&format!(".{agg}"))))
        .unwrap_or(false)
}

/// Registrable name of the URL's host, e.g. `lite.cnn.com` -> `cnn`, `bbc.co.uk` -> `bbc`.
pub fn source_from_url(raw: &str) -> Option<String> {
    let host = host_of(raw)?;
    let parts: Vec<&str> = host.split('.').filter(|p| !p.is_empty()).collect();
    if parts.len() < 2 {
        return None;
    }
    let second_to_last = parts[parts.len() - 2];
    let name = if parts.len() >= 3
        && parts[parts.len() - 1].len() == 2
        && SECOND_LEVEL_SUFFIXES.contains(&second_to_last)
    {
        parts[parts.len() - 3]
    } else {
        second_to_last
    };
    Some(name.to_string())
}

/// Comparable outlet key: lowercase alphanumerics only, domain suffix dropped.
///
/// `"Reuters"`, `"reuters.com"` and `"www.Reuters.com"` all map to `reuters`.
pub fn normalize_source(source: &str) -> String {
    let trimmed = source.trim().to_lowercase();
    if trimmed.is_empty() {
        return String::new();
    }
    let base = if !trimmed.contains(' ') && trimmed.contains('.') {
        source_from_url(&trimmed).unwrap_or(trimmed)
    } else {
        trimmed
    };
    base.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Last non-empty path segment of a URL.
pub fn last_path_segment(url: &Url) -> Option<String> {
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(|s| s.to_string())
}

/// Words from the URL slug, e.g. `/world/quake-hits-coast-2025-01-02/` -> `quake hits coast`.
pub fn search_terms_from_url(raw: &str) -> String {
    let Some(parsed) = parse_url(raw) else {
        return String::new();
    };
    if is_aggregator_url(raw) {
        return String::new();
    }
    let Some(segment) = last_path_segment(&parsed) else {
        return String::new();
    };
    let segment = segment
        .trim_end_matches(".html")
        .trim_end_matches(".htm")
        .to_string();
    let decoded = urlencoding::decode(&segment)
        .map(|s| s.into_owned())
        .unwrap_or(segment);
    decoded
        .split(['-', '_', '+', '.'])
        .filter(|w| !w.is_empty())
        .filter(|w| !SLUG_ID.is_match(w) && !looks_like_hash(w))
        .filter(|w| w.chars().any(|c| c.is_alphabetic()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn looks_like_hash(word: &str) -> bool {
    word.len() >= 6
        && word.chars().all(|c| c.is_ascii_hexdigit())
        && word.chars().any(|c| c.is_ascii_digit())
}

/// Headline cleaned up for use as a search query: entities decoded,
/// trailing `" - Outlet"` suffix dropped, whitespace collapsed.
pub fn normalize_title_for_search(title: &str) -> String {
    let decoded = decode_html_entities(title);
    let without_suffix = SOURCE_SUFFIX.replace(decoded.trim(), "");
    WHITESPACE.replace_all(without_suffix.trim(), " ").to_string()
}

/// Comparable title key: lowercase words without punctuation.
pub fn normalize_title_key(title: &str) -> String {
    let cleaned = normalize_title_for_search(title).to_lowercase();
    let words = NON_WORD.replace_all(&cleaned, " ");
    WHITESPACE.replace_all(words.trim(), " ").to_string()
}

/// Decode the handful of entities that show up in headlines and meta tags.
pub fn decode_html_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&rsquo;", "\u{2019}")
        .replace("&lsquo;", "\u{2018}")
        .replace("&ldquo;", "\u{201c}")
        .replace("&rdquo;", "\u{201d}")
        .replace("&mdash;", "\u{2014}")
        .replace("&ndash;", "\u{2013}")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Lenient date parsing for row and feed dates.
///
/// Accepts RFC 3339, RFC 2822 (RSS `pubDate`), `YYYY-MM-DD` and
/// `YYYY-MM-DD HH:MM[:SS]`.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(v) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(v) {
        return Some(dt.date_naive());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(v, fmt) {
            return Some(dt.date());
        }
    }
    let head = v.get(..10).unwrap_or(v);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// `1m 05s` style rendering for waits and timings in logs.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then writes and removes a probe file.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> Result<(), io::Error> {
    fs::create_dir_all(path).await?;
    let probe_path = path.join("..__probe_write__");
    fs::write(&probe_path, b"").await?;
    let _ = fs::remove_file(&probe_path).await;
    info!("Cache directory is writable");
    Ok(())
}
