//! Data models for news-event rows and the transient records built around them.
//!
//! - [`Event`]: one persisted row, mutated by a processing pass
//! - [`OriginalContext`]: set-once snapshot of what the row looked like when first seen
//! - [`Candidate`]: an alternative source article discovered for an event
//! - [`ArticleMeta`]: metadata pulled out of fetched HTML
//! - [`VerifyStatus`] / [`ContentMethod`]: small tagged values written back to the row
//!
//! Row columns use camelCase names because the row store is shared with
//! other tools that already use those headers.

use crate::utils::is_blank;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A news event row as stored in the row store.
///
/// Every column is a plain string; an empty string and a missing column are
/// the same thing (see [`is_blank`]). Columns this crate does not know about
/// are carried through untouched in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Event {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub title_en: String,
    pub title_ru: String,
    pub gn_url: String,
    pub alternative_url: String,
    pub url: String,
    pub source: String,
    pub date: String,
    pub text: String,
    pub summary: String,
    pub topic: String,
    pub priority: String,
    pub ai_topic: String,
    pub ai_priority: String,
    pub description: String,
    pub keywords: String,
    pub content_method: String,
    pub meta_title: String,
    pub meta_description: String,
    pub meta_keywords: String,
    pub meta_date: String,
    pub meta_canonical_url: String,
    pub meta_image: String,
    pub meta_author: String,
    pub meta_site_name: String,
    pub meta_section: String,
    pub meta_tags: String,
    pub meta_lang: String,
    pub verify_status: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Column headers every processed row is expected to carry.
pub const REQUIRED_COLUMNS: &[&str] = &[
    "titleEn",
    "titleRu",
    "gnUrl",
    "alternativeUrl",
    "url",
    "source",
    "contentMethod",
    "metaTitle",
    "metaDescription",
    "metaKeywords",
    "metaDate",
    "metaCanonicalUrl",
    "metaImage",
    "metaAuthor",
    "metaSiteName",
    "metaSection",
    "metaTags",
    "metaLang",
    "verifyStatus",
];

impl Event {
    /// Best available headline for logs.
    pub fn title(&self) -> &str {
        if !is_blank(&self.title_en) {
            &self.title_en
        } else {
            &self.title_ru
        }
    }

    /// Whether the row was already fully processed on an earlier run.
    pub fn is_done(&self) -> bool {
        self.verify_status.trim().eq_ignore_ascii_case("ok")
    }

    /// Whether any of the fields produced by summarization is still empty.
    pub fn needs_text_fields(&self) -> bool {
        is_blank(&self.summary)
            || is_blank(&self.title_ru)
            || is_blank(&self.topic)
            || is_blank(&self.priority)
    }

    /// Names of the fields that must be filled before the row counts as complete.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if is_blank(&self.url) {
            missing.push("url");
        }
        if is_blank(&self.source) {
            missing.push("source");
        }
        if is_blank(&self.text) {
            missing.push("text");
        }
        if is_blank(&self.summary) {
            missing.push("summary");
        }
        missing
    }

    /// Drop everything derived from article text.
    ///
    /// Used when cached text turns out to describe a different event.
    pub fn reset_text_fields(&mut self) {
        self.text.clear();
        self.summary.clear();
        self.title_ru.clear();
        self.topic.clear();
        self.priority.clear();
        self.ai_topic.clear();
        self.ai_priority.clear();
    }

    /// Copy `meta` into blank event fields and blank `meta*` columns.
    pub fn apply_meta(&mut self, meta: &ArticleMeta) {
        fill(&mut self.title_en, &meta.title);
        fill(&mut self.date, &meta.date);
        fill(&mut self.url, &meta.canonical_url);
        fill(&mut self.description, &meta.description);
        fill(&mut self.keywords, &meta.keywords);

        fill(&mut self.meta_title, &meta.title);
        fill(&mut self.meta_description, &meta.description);
        let date = if is_blank(&meta.published_time) {
            &meta.date
        } else {
            &meta.published_time
        };
        fill(&mut self.meta_date, date);
        fill(&mut self.meta_canonical_url, &meta.canonical_url);
        fill(&mut self.meta_image, &meta.image);
        fill(&mut self.meta_author, &meta.author);
        fill(&mut self.meta_site_name, &meta.site_name);
        fill(&mut self.meta_section, &meta.section);
        fill(&mut self.meta_tags, &meta.tags);
        let lang = if is_blank(&meta.lang) {
            &meta.locale
        } else {
            &meta.lang
        };
        fill(&mut self.meta_lang, lang);
    }
}

fn fill(target: &mut String, value: &str) {
    if is_blank(target) && !is_blank(value) {
        *target = value.to_string();
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

/// The row as it was first observed in this pass.
///
/// Fields are set once and never overwritten, so verification always compares
/// against the original headline even after the working copy has switched to
/// an alternative source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OriginalContext {
    pub url: String,
    pub gn_url: String,
    pub title_en: String,
    pub title_ru: String,
    pub source: String,
    pub date: String,
}

impl OriginalContext {
    pub fn capture(&mut self, from: &Event) {
        set_once(&mut self.url, &from.url);
        set_once(&mut self.gn_url, &from.gn_url);
        set_once(&mut self.title_en, &from.title_en);
        set_once(&mut self.title_ru, &from.title_ru);
        set_once(&mut self.source, &from.source);
        set_once(&mut self.date, &from.date);
    }

    pub fn set_url_if_missing(&mut self, url: &str) {
        set_once(&mut self.url, url);
    }

    pub fn title(&self) -> &str {
        if !is_blank(&self.title_en) {
            &self.title_en
        } else {
            &self.title_ru
        }
    }
}

fn set_once(target: &mut String, value: &str) {
    if is_blank(target) && !is_blank(value) {
        *target = value.trim().to_string();
    }
}

/// Where an alternative candidate was discovered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    /// Came from the row store itself; never used as an alternative.
    RowStore,
    /// News aggregator search results.
    Aggregator,
    /// External web search, tagged with the provider name.
    External(String),
    #[default]
    Unknown,
}

impl fmt::Display for CandidateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateOrigin::RowStore => f.write_str("sheet"),
            CandidateOrigin::Aggregator => f.write_str("gn"),
            CandidateOrigin::External(provider) => f.write_str(provider),
            CandidateOrigin::Unknown => f.write_str(""),
        }
    }
}

/// An alternative source article for an event. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Candidate {
    /// Outlet name as reported by the discovery channel.
    pub source: String,
    /// Direct article URL, if known.
    pub url: String,
    /// Aggregator redirect URL that still needs decoding.
    pub gn_url: String,
    pub title: String,
    pub date: String,
    pub origin: CandidateOrigin,
    /// Position in the discovery results, lower is better.
    pub rank: Option<u32>,
}

impl Candidate {
    /// Direct URL if present, otherwise the redirect URL.
    pub fn link(&self) -> &str {
        if !is_blank(&self.url) {
            self.url.trim()
        } else {
            self.gn_url.trim()
        }
    }

    pub fn has_direct_url(&self) -> bool {
        !is_blank(&self.url)
    }
}

/// Result of the verification gate, as written to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Ok,
    Mismatch,
    Unverified,
    Error,
    Skipped,
}

impl VerifyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyStatus::Ok => "ok",
            VerifyStatus::Mismatch => "mismatch",
            VerifyStatus::Unverified => "unverified",
            VerifyStatus::Error => "error",
            VerifyStatus::Skipped => "skipped",
        }
    }

    /// Counts as verified for the completion rule.
    pub fn is_verified(&self) -> bool {
        matches!(self, VerifyStatus::Ok | VerifyStatus::Skipped)
    }
}

impl fmt::Display for VerifyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the accepted article text was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMethod {
    Cache,
    Fetch,
    Jina,
    Browse,
}

impl ContentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentMethod::Cache => "cache",
            ContentMethod::Fetch => "fetch",
            ContentMethod::Jina => "jina",
            ContentMethod::Browse => "browse",
        }
    }
}

impl fmt::Display for ContentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Page metadata extracted from HTML. Empty strings mean "not found".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleMeta {
    pub title: String,
    pub description: String,
    pub keywords: String,
    pub date: String,
    pub published_time: String,
    pub modified_time: String,
    pub canonical_url: String,
    pub image: String,
    pub author: String,
    pub site_name: String,
    pub section: String,
    pub page_type: String,
    pub locale: String,
    pub tags: String,
    pub lang: String,
}

impl ArticleMeta {
    pub fn is_empty(&self) -> bool {
        self == &ArticleMeta::default()
    }
}
