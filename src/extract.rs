//! Article body extraction from raw HTML.
//!
//! Strategies run in order and the first one producing more than
//! `min_text_length` characters wins:
//!
//! 1. input without tags is taken as plain text
//! 2. JSON-LD `articleBody`, then `text`, then `description`
//! 3. the longest of the known article-container selectors
//! 4. the whole document flattened to text
//!
//! Anything at or below the minimum length is reported as `None`.

use crate::config::PipelineSettings;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use std::fmt;
use std::io::Cursor;
use tracing::{debug, warn};

/// Column width handed to html2text; wide enough that paragraphs are not re-wrapped.
const TEXT_WIDTH: usize = 10_000;

static STYLE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap());
static SCRIPT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>|<noscript[^>]*>.*?</noscript>").unwrap());
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<[a-z!/][^>]*>").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static LD_JSON: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());
static CONTENT_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        r#"[itemprop="articleBody"]"#,
        "article",
        "main",
        ".article-body",
        ".article-body__content",
        ".story-body",
        ".content__article-body",
        ".ArticleBody",
        ".ArticleBody-articleBody",
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});

/// Length limits for extraction.
#[derive(Debug, Clone, Copy)]
pub struct ExtractSettings {
    pub min_text_length: usize,
    pub max_html_to_text_chars: usize,
}

impl From<&PipelineSettings> for ExtractSettings {
    fn from(p: &PipelineSettings) -> Self {
        Self {
            min_text_length: p.min_text_length,
            max_html_to_text_chars: p.max_html_to_text_chars,
        }
    }
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self::from(&PipelineSettings::default())
    }
}

fn long_enough(text: &str, settings: &ExtractSettings) -> bool {
    text.chars().count() > settings.min_text_length
}

/// Extract the article body from `html`, or `None` if nothing usable is found.
pub fn extract_text(html: &str, settings: &ExtractSettings) -> Option<String> {
    if html.trim().is_empty() {
        return None;
    }
    let cleaned = STYLE_BLOCK.replace_all(html, "");
    if !ANY_TAG.is_match(&cleaned) {
        let plain = cleaned.trim();
        return long_enough(plain, settings).then(|| plain.to_string());
    }

    let doc = Html::parse_document(&cleaned);
    if let Some(text) = json_ld_text(&doc, settings) {
        debug!(len = text.len(), "Extracted text from JSON-LD");
        return Some(text);
    }
    if let Some(text) = dom_text(&doc, settings) {
        debug!(len = text.len(), "Extracted text from content container");
        return Some(text);
    }

    let text = html_to_text(&cleaned, settings);
    long_enough(&text, settings).then_some(text)
}

#[derive(Default)]
struct LdBuckets {
    body: Vec<String>,
    text: Vec<String>,
    description: Vec<String>,
}

impl LdBuckets {
    fn collect(&mut self, node: &Value) {
        match node {
            Value::Array(items) => items.iter().for_each(|i| self.collect(i)),
            Value::Object(map) => {
                if let Some(Value::String(s)) = map.get("articleBody") {
                    self.body.push(s.clone());
                }
                if let Some(Value::String(s)) = map.get("text") {
                    self.text.push(s.clone());
                }
                if let Some(Value::String(s)) = map.get("description") {
                    self.description.push(s.clone());
                }
                map.values().for_each(|v| self.collect(v));
            }
            _ => {}
        }
    }
}

fn longest(items: &[String]) -> Option<&String> {
    items.iter().max_by_key(|s| s.chars().count())
}

fn json_ld_text(doc: &Html, settings: &ExtractSettings) -> Option<String> {
    let mut buckets = LdBuckets::default();
    for script in doc.select(&LD_JSON) {
        let raw = script.text().collect::<String>();
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => buckets.collect(&value),
            Err(e) => debug!(error = %e, "Skipping unparseable JSON-LD block"),
        }
    }
    [&buckets.body, &buckets.text, &buckets.description]
        .into_iter()
        .filter_map(|bucket| longest(bucket))
        .map(|s| s.trim())
        .find(|s| long_enough(s, settings))
        .map(str::to_string)
}

fn dom_text(doc: &Html, settings: &ExtractSettings) -> Option<String> {
    let mut best = String::new();
    for selector in CONTENT_SELECTORS.iter() {
        for node in doc.select(selector) {
            let text = html_to_text(&node.inner_html(), settings);
            if text.chars().count() > best.chars().count() {
                best = text;
            }
        }
    }
    long_enough(&best, settings).then_some(best)
}

/// Flatten HTML to text, falling back to the regex stripper for oversized
/// input or when the converter fails.
pub fn html_to_text(html: &str, settings: &ExtractSettings) -> String {
    if html.is_empty() {
        return String::new();
    }
    if html.len() > settings.max_html_to_text_chars {
        warn!(chars = html.len(), "HTML too large for html2text; stripping tags");
        return strip_html_fast(html, settings.max_html_to_text_chars);
    }
    match html2text::from_read(Cursor::new(html.as_bytes()), TEXT_WIDTH) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            warn!(error = %e, "html2text failed; stripping tags");
            strip_html_fast(html, settings.max_html_to_text_chars)
        }
    }
}

/// Drop script and style bodies, replace every tag with a space and collapse
/// whitespace. Input beyond `limit` bytes is ignored.
pub fn strip_html_fast(html: &str, limit: usize) -> String {
    let without_scripts = SCRIPT_BLOCK.replace_all(html, " ");
    let without_styles = STYLE_BLOCK.replace_all(&without_scripts, " ");
    let html = without_styles.as_ref();
    let mut cut = html.len().min(limit);
    while !html.is_char_boundary(cut) {
        cut -= 1;
    }
    let without_tags = TAG.replace_all(&html[..cut], " ");
    WHITESPACE.replace_all(&without_tags, " ").trim().to_string()
}

/// What a fetched page looks like when it yielded no article text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Captcha,
    AccessDenied,
    NotFound,
    Empty,
    Ok,
}

impl PageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageState::Captcha => "captcha",
            PageState::AccessDenied => "access_denied",
            PageState::NotFound => "not_found",
            PageState::Empty => "empty",
            PageState::Ok => "ok",
        }
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CAPTCHA_MARKERS: &[&str] = &[
    "captcha",
    "are you a robot",
    "verify you are human",
    "verifying you are human",
    "unusual traffic",
    "cf-challenge",
    "challenge-platform",
    "press & hold",
    "px-captcha",
];
const ACCESS_DENIED_MARKERS: &[&str] = &[
    "access denied",
    "403 forbidden",
    "request blocked",
    "you don't have permission",
    "subscribe to continue",
];
const NOT_FOUND_MARKERS: &[&str] = &["404 not found", "page not found", "page you requested could not be found"];

/// A challenge page is short; long pages merely embedding a challenge widget are not.
const CAPTCHA_PAGE_MAX_TEXT: usize = 2_000;

fn has_captcha_marker(html: &str) -> bool {
    let lower = html.to_lowercase();
    CAPTCHA_MARKERS.iter().any(|m| lower.contains(m))
}

/// Whether a page is a bot challenge rather than an article.
pub fn looks_like_captcha(html: &str) -> bool {
    has_captcha_marker(html) && strip_html_fast(html, 200_000).chars().count() < CAPTCHA_PAGE_MAX_TEXT
}

/// Label a page by its HTML and title, for logging pages that gave no text.
pub fn classify_page_state(html: &str, title: &str) -> PageState {
    if html.trim().is_empty() {
        return PageState::Empty;
    }
    let haystack = format!("{}\n{}", title, html).to_lowercase();
    if CAPTCHA_MARKERS.iter().any(|m| haystack.contains(m)) {
        PageState::Captcha
    } else if ACCESS_DENIED_MARKERS.iter().any(|m| haystack.contains(m)) {
        PageState::AccessDenied
    } else if NOT_FOUND_MARKERS.iter().any(|m| haystack.contains(m)) {
        PageState::NotFound
    } else if strip_html_fast(html, 200_000).chars().count() < 50 {
        PageState::Empty
    } else {
        PageState::Ok
    }
}
