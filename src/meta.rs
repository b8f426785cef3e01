//! Page metadata extraction.
//!
//! JSON-LD blocks are consulted first, then the usual meta tags (OpenGraph,
//! Twitter cards, Parse.ly, Sailthru, Dublin Core), then `<title>` and
//! `<link rel="canonical">`.

use crate::models::ArticleMeta;
use crate::utils::{clamp_chars, decode_html_entities};
use itertools::Itertools;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::Value;

/// Larger pages are cut before parsing; metadata lives in `<head>`.
const MAX_META_HTML_CHARS: usize = 750_000;

static LD_JSON: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static CANONICAL: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"link[rel="canonical"]"#).unwrap());
static HTML_ROOT: Lazy<Selector> = Lazy::new(|| Selector::parse("html").unwrap());

const TITLE_TAGS: &[&str] = &[
    r#"meta[property="og:title"]"#,
    r#"meta[name="twitter:title"]"#,
    r#"meta[name="title"]"#,
    r#"meta[name="parsely-title"]"#,
    r#"meta[name="sailthru.title"]"#,
];
const DESCRIPTION_TAGS: &[&str] = &[
    r#"meta[property="og:description"]"#,
    r#"meta[name="description"]"#,
    r#"meta[name="twitter:description"]"#,
    r#"meta[name="sailthru.description"]"#,
];
const KEYWORD_TAGS: &[&str] = &[
    r#"meta[name="keywords"]"#,
    r#"meta[name="news_keywords"]"#,
    r#"meta[name="parsely-tags"]"#,
];
const PUBLISHED_TAGS: &[&str] = &[
    r#"meta[property="article:published_time"]"#,
    r#"meta[name="pubdate"]"#,
    r#"meta[name="publishdate"]"#,
    r#"meta[name="date"]"#,
    r#"meta[name="dc.date"]"#,
    r#"meta[name="dc.date.issued"]"#,
    r#"meta[name="datepublished"]"#,
];
const MODIFIED_TAGS: &[&str] = &[
    r#"meta[property="article:modified_time"]"#,
    r#"meta[property="og:updated_time"]"#,
    r#"meta[name="datemodified"]"#,
    r#"meta[name="dc.date.modified"]"#,
];
const CANONICAL_TAGS: &[&str] = &[r#"meta[property="og:url"]"#, r#"meta[name="parsely-link"]"#];
const IMAGE_TAGS: &[&str] = &[
    r#"meta[property="og:image"]"#,
    r#"meta[property="og:image:url"]"#,
    r#"meta[name="twitter:image"]"#,
    r#"meta[name="twitter:image:src"]"#,
];
const AUTHOR_TAGS: &[&str] = &[
    r#"meta[name="author"]"#,
    r#"meta[property="article:author"]"#,
    r#"meta[name="parsely-author"]"#,
    r#"meta[name="sailthru.author"]"#,
    r#"meta[name="byl"]"#,
];
const SITE_NAME_TAGS: &[&str] = &[r#"meta[property="og:site_name"]"#, r#"meta[name="application-name"]"#];
const SECTION_TAGS: &[&str] = &[
    r#"meta[property="article:section"]"#,
    r#"meta[name="parsely-section"]"#,
    r#"meta[name="sailthru.section"]"#,
    r#"meta[name="section"]"#,
];
const TAG_LIST_TAGS: &[&str] = &[
    r#"meta[name="news_keywords"]"#,
    r#"meta[name="keywords"]"#,
    r#"meta[name="parsely-tags"]"#,
    r#"meta[name="sailthru.tags"]"#,
];

fn read_meta(doc: &Html, selectors: &[&str]) -> String {
    read_meta_all(doc, selectors).into_iter().next().unwrap_or_default()
}

fn read_meta_all(doc: &Html, selectors: &[&str]) -> Vec<String> {
    let mut values = Vec::new();
    for raw in selectors {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        for node in doc.select(&selector) {
            let el = node.value();
            if let Some(content) = el.attr("content").or_else(|| el.attr("value")) {
                let content = decode_html_entities(content).trim().to_string();
                if !content.is_empty() {
                    values.push(content);
                }
            }
        }
    }
    values
}

fn first_non_empty(values: impl IntoIterator<Item = String>) -> String {
    values.into_iter().find(|v| !v.is_empty()).unwrap_or_default()
}

/// Flatten a JSON-LD value into a display string, preferring the given keys for objects.
fn ld_value(value: &Value, keys: &[&str]) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| ld_value(item, keys))
            .filter(|s| !s.is_empty())
            .join(", "),
        Value::Object(map) => {
            for key in keys.iter().chain(["@id", "id", "url", "contentUrl", "src", "href"].iter()) {
                if let Some(Value::String(s)) = map.get(*key) {
                    if !s.trim().is_empty() {
                        return s.trim().to_string();
                    }
                }
            }
            match map.get("url") {
                Some(nested @ Value::Object(_)) => ld_value(nested, keys),
                _ => String::new(),
            }
        }
        Value::Null => String::new(),
    }
}

#[derive(Default)]
struct LdMeta {
    title: String,
    description: String,
    keywords: String,
    date: String,
    author: String,
    image: String,
    canonical_url: String,
}

impl LdMeta {
    fn collect(&mut self, node: &Value) {
        match node {
            Value::Array(items) => items.iter().for_each(|item| self.collect(item)),
            Value::Object(map) => {
                let pick = |keys: &[&str]| keys.iter().find_map(|k| map.get(*k)).map(|v| ld_value(v, &[]));
                if self.title.is_empty() {
                    self.title = pick(&["headline", "name"]).unwrap_or_default();
                }
                if self.description.is_empty() {
                    self.description = pick(&["description"]).unwrap_or_default();
                }
                if self.keywords.is_empty() {
                    if let Some(v) = map.get("keywords") {
                        self.keywords = ld_value(v, &["name", "text", "value"]);
                    }
                }
                if self.date.is_empty() {
                    self.date = pick(&["datePublished", "dateCreated", "dateModified"]).unwrap_or_default();
                }
                if self.author.is_empty() {
                    if let Some(v) = map.get("author") {
                        self.author = ld_value(v, &["name"]);
                    }
                }
                if self.image.is_empty() {
                    if let Some(v) = map.get("image") {
                        self.image = ld_value(v, &["url", "contentUrl"]);
                    }
                }
                if self.canonical_url.is_empty() {
                    if let Some(Value::Object(page)) = map.get("mainEntityOfPage") {
                        if let Some(url) = page.get("@id").or_else(|| page.get("url")) {
                            self.canonical_url = ld_value(url, &[]);
                        }
                    }
                }
                map.values().for_each(|v| self.collect(v));
            }
            _ => {}
        }
    }
}

fn ld_meta(doc: &Html) -> LdMeta {
    let mut meta = LdMeta::default();
    for script in doc.select(&LD_JSON) {
        let raw = script.text().collect::<String>();
        if let Ok(value) = serde_json::from_str::<Value>(raw.trim()) {
            meta.collect(&value);
        }
    }
    meta
}

fn document_title(doc: &Html) -> String {
    doc.select(&TITLE)
        .next()
        .map(|t| decode_html_entities(&t.text().collect::<String>()).trim().to_string())
        .unwrap_or_default()
}

fn parse_capped(html: &str) -> Html {
    if html.len() > MAX_META_HTML_CHARS {
        Html::parse_document(&clamp_chars(html, MAX_META_HTML_CHARS))
    } else {
        Html::parse_document(html)
    }
}

/// Headline only: OpenGraph/Twitter/`title` meta tags, then `<title>`.
pub fn extract_title(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }
    let doc = parse_capped(html);
    first_non_empty([read_meta(&doc, &TITLE_TAGS[..3]), document_title(&doc)])
}

/// Every metadata field we know how to find. Missing fields are empty strings.
pub fn extract_meta(html: &str) -> ArticleMeta {
    if html.is_empty() {
        return ArticleMeta::default();
    }
    let doc = parse_capped(html);
    let ld = ld_meta(&doc);

    let published_time = read_meta(&doc, PUBLISHED_TAGS);
    let date = first_non_empty([
        ld.date,
        published_time.clone(),
        read_meta(&doc, &[r#"meta[property="og:updated_time"]"#]),
    ]);

    let canonical_link = doc
        .select(&CANONICAL)
        .next()
        .and_then(|l| l.value().attr("href"))
        .map(|h| decode_html_entities(h).trim().to_string())
        .unwrap_or_default();

    let mut tags = read_meta_all(&doc, &[r#"meta[property="article:tag"]"#]);
    for raw in TAG_LIST_TAGS {
        let value = read_meta(&doc, &[*raw]);
        tags.extend(value.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()));
    }

    let lang = doc
        .select(&HTML_ROOT)
        .next()
        .and_then(|h| h.value().attr("lang"))
        .unwrap_or_default()
        .to_string();

    ArticleMeta {
        title: first_non_empty([ld.title, read_meta(&doc, TITLE_TAGS), document_title(&doc)]),
        description: first_non_empty([ld.description, read_meta(&doc, DESCRIPTION_TAGS)]),
        keywords: first_non_empty([ld.keywords, read_meta(&doc, KEYWORD_TAGS)]),
        date,
        published_time,
        modified_time: read_meta(&doc, MODIFIED_TAGS),
        canonical_url: first_non_empty([ld.canonical_url, canonical_link, read_meta(&doc, CANONICAL_TAGS)]),
        image: first_non_empty([ld.image, read_meta(&doc, IMAGE_TAGS)]),
        author: first_non_empty([ld.author, read_meta(&doc, AUTHOR_TAGS)]),
        site_name: read_meta(&doc, SITE_NAME_TAGS),
        section: read_meta(&doc, SECTION_TAGS),
        page_type: read_meta(&doc, &[r#"meta[property="og:type"]"#]),
        locale: read_meta(&doc, &[r#"meta[property="og:locale"]"#]),
        tags: tags.into_iter().unique().join(", "),
        lang,
    }
}
