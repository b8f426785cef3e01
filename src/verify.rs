//! Verification gate.
//!
//! Asks an LLM whether retrieved text describes the same news event as the
//! row's original headline. The gate never touches the event itself; the
//! pipeline applies the returned [`VerifyOutcome`].

use crate::api::{AskAsync, JsonSchema, Prompt};
use crate::config::{VerifyMode, VerifySettings};
use crate::extract::{ExtractSettings, html_to_text};
use crate::meta::extract_meta;
use crate::models::{OriginalContext, VerifyStatus};
use crate::utils::{clamp_chars, is_blank, normalize_title_for_search, truncate_for_log};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

static STYLE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap());
static FENCE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^```(?:json)?").unwrap());

const SYSTEM_PROMPT: &str = "You verify whether the candidate article is about the same news event as the original article. \
Be strict: only mark match=true if it is clearly the same event. \
The candidate may contain MORE information, but must NOT contradict the original. \
If the candidate omits key facts from the original or is about a related but different event, set match=false. \
Dates and sources may differ slightly, but the event must be the same. \
Return ONLY JSON with keys: \
- match (boolean) \
- confidence (number 0-1) \
- reason (string, <=200 chars) \
- page_summary (string, <=200 chars)";

const SEARCH_HINT: &str = " Use web search to confirm details when needed.";

/// Schema for the verdict object.
pub fn verdict_schema() -> JsonSchema {
    JsonSchema {
        name: "verify_result",
        schema: json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "match": { "type": "boolean" },
                "confidence": { "type": "number" },
                "reason": { "type": "string" },
                "page_summary": { "type": "string" },
            },
            "required": ["match", "confidence", "reason", "page_summary"],
        }),
    }
}

/// Whether a candidate should go through the gate at all.
pub fn should_verify(mode: VerifyMode, is_fallback: bool, text_len: usize, short_threshold: usize) -> bool {
    match mode {
        VerifyMode::Always => true,
        VerifyMode::Fallback => is_fallback,
        VerifyMode::Short => text_len < short_threshold,
        VerifyMode::Never => false,
    }
}

/// What the original row says the event is about.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyContext {
    pub title: String,
    pub description: String,
    pub keywords: String,
    pub date: String,
    pub source: String,
    pub url: String,
    pub gn_url: String,
    pub text_snippet: String,
}

impl VerifyContext {
    /// Build the context from the original snapshot, enriched with the
    /// original page when its HTML is available.
    pub fn build(original: &OriginalContext, original_html: Option<&str>, snippet_chars: usize) -> Self {
        let mut ctx = VerifyContext {
            title: original.title().to_string(),
            date: original.date.clone(),
            source: original.source.clone(),
            url: original.url.clone(),
            gn_url: original.gn_url.clone(),
            ..Default::default()
        };
        if let Some(html) = original_html.filter(|h| !h.trim().is_empty()) {
            let meta = extract_meta(html);
            if !is_blank(&meta.title) {
                ctx.title = meta.title;
            }
            if !is_blank(&meta.description) {
                ctx.description = meta.description;
            }
            if !is_blank(&meta.keywords) {
                ctx.keywords = meta.keywords;
            }
            if !is_blank(&meta.date) {
                ctx.date = meta.date;
            }
            if is_blank(&ctx.url) && !is_blank(&meta.canonical_url) {
                ctx.url = meta.canonical_url;
            }
            ctx.text_snippet = snippet(html, snippet_chars);
        }
        ctx.title = normalize_title_for_search(&ctx.title);
        ctx
    }
}

fn snippet(html: &str, max_chars: usize) -> String {
    let cleaned = STYLE_BLOCK.replace_all(html, "");
    let text = html_to_text(&cleaned, &ExtractSettings::default());
    if max_chars == 0 {
        text
    } else {
        clamp_chars(&text, max_chars)
    }
}

/// Retrieved content to check.
#[derive(Debug, Clone, Copy)]
pub struct VerifyCandidate<'a> {
    pub url: &'a str,
    pub text: &'a str,
}

/// Result of one pass through the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    pub ok: bool,
    pub matched: bool,
    pub confidence: f64,
    pub reason: String,
    pub page_summary: String,
    pub status: VerifyStatus,
    pub error: Option<String>,
    pub fallback_used: bool,
}

impl VerifyOutcome {
    pub fn skipped() -> Self {
        Self {
            ok: true,
            matched: false,
            confidence: 0.0,
            reason: String::new(),
            page_summary: String::new(),
            status: VerifyStatus::Skipped,
            error: None,
            fallback_used: false,
        }
    }

    pub fn from_verdict(verdict: Verdict, min_confidence: f64, summary_chars: usize, fallback_used: bool) -> Self {
        let ok = verdict.matched && verdict.confidence >= min_confidence;
        Self {
            ok,
            matched: verdict.matched,
            confidence: verdict.confidence,
            reason: clamp_chars(&verdict.reason, summary_chars),
            page_summary: clamp_chars(&verdict.page_summary, summary_chars),
            status: if ok { VerifyStatus::Ok } else { VerifyStatus::Mismatch },
            error: None,
            fallback_used,
        }
    }

    /// The call itself failed. Fail-open turns it into a cautious pass.
    pub fn failed(error: String, fail_open: bool) -> Self {
        let (ok, status, reason) = if fail_open {
            (true, VerifyStatus::Unverified, "verification unavailable")
        } else {
            (false, VerifyStatus::Error, "verification failed")
        };
        Self {
            ok,
            matched: false,
            confidence: 0.0,
            reason: reason.to_string(),
            page_summary: String::new(),
            status,
            error: Some(error),
            fallback_used: false,
        }
    }
}

/// Parsed model answer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Verdict {
    #[serde(rename = "match", default)]
    pub matched: bool,
    #[serde(default, deserialize_with = "lenient_number")]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default, alias = "pageSummary")]
    pub page_summary: String,
}

fn lenient_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

/// Strip code fences and surrounding chatter, then parse the JSON verdict.
pub fn parse_verdict(raw: &str) -> Result<Verdict, serde_json::Error> {
    let mut text = raw.trim().to_string();
    if text.starts_with("```") {
        text = FENCE_OPEN.replace(&text, "").trim_end_matches("```").trim().to_string();
    }
    if !(text.starts_with('{') && text.ends_with('}')) {
        if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
            if start < end {
                text = text[start..=end].to_string();
            }
        }
    }
    serde_json::from_str(&text)
}

#[async_trait(?Send)]
pub trait Verifier {
    async fn verify(&self, original: &VerifyContext, candidate: VerifyCandidate<'_>) -> VerifyOutcome;
}

/// Gate backed by a chat model.
#[derive(Debug)]
pub struct LlmVerifier<A> {
    ask: A,
    settings: VerifySettings,
}

#[derive(Serialize)]
struct CandidatePayload<'a> {
    url: &'a str,
    text: String,
}

impl<A> LlmVerifier<A>
where
    A: AskAsync<Response = String>,
{
    pub fn new(ask: A, settings: VerifySettings) -> Self {
        Self { ask, settings }
    }

    fn prompt(&self, original: &VerifyContext, candidate: VerifyCandidate<'_>, max_chars: usize, context_chars: usize) -> Prompt {
        let mut original = original.clone();
        original.text_snippet = clamp_chars(&original.text_snippet, context_chars);
        let candidate = CandidatePayload {
            url: candidate.url,
            text: clamp_chars(candidate.text, max_chars),
        };
        let mut system = SYSTEM_PROMPT.to_string();
        if self.settings.use_search {
            system.push_str(SEARCH_HINT);
        }
        let user = format!(
            "Original context:\n{}\nCandidate:\n{}",
            serde_json::to_string_pretty(&original).unwrap_or_default(),
            serde_json::to_string_pretty(&candidate).unwrap_or_default(),
        );
        Prompt::new(system, user)
    }

    async fn call(&self, original: &VerifyContext, candidate: VerifyCandidate<'_>) -> Result<(String, bool), String> {
        let s = &self.settings;
        let prompt = self.prompt(original, candidate, s.max_chars, s.context_max_chars);
        match self.ask.ask(&prompt).await {
            Ok(raw) => Ok((raw, false)),
            Err(e) if crate::error::is_length_message(&e.to_string()) => {
                warn!(error = %e, "Verify payload too large; retrying with smaller budget");
                let prompt = self.prompt(original, candidate, s.fallback_max_chars, s.fallback_context_max_chars);
                self.ask.ask(&prompt).await.map(|raw| (raw, true)).map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait(?Send)]
impl<A> Verifier for LlmVerifier<A>
where
    A: AskAsync<Response = String>,
{
    #[instrument(level = "info", skip_all, fields(url = %candidate.url, chars = candidate.text.len()))]
    async fn verify(&self, original: &VerifyContext, candidate: VerifyCandidate<'_>) -> VerifyOutcome {
        let s = &self.settings;
        let outcome = match self.call(original, candidate).await {
            Ok((raw, fallback_used)) => match parse_verdict(&raw) {
                Ok(verdict) => VerifyOutcome::from_verdict(verdict, s.min_confidence, s.summary_max_chars, fallback_used),
                Err(e) => {
                    warn!(error = %e, raw = %truncate_for_log(&raw, 200), "Verify response unparseable");
                    VerifyOutcome::failed(e.to_string(), s.fail_open)
                }
            },
            Err(e) => {
                warn!(error = %truncate_for_log(&e, 300), "Verify call failed");
                VerifyOutcome::failed(e, s.fail_open)
            }
        };
        info!(
            status = %outcome.status,
            matched = outcome.matched,
            confidence = outcome.confidence,
            reason = %truncate_for_log(&outcome.reason, 200),
            "Verification result"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::BoxError;
    use std::cell::RefCell;

    struct Scripted {
        replies: RefCell<Vec<Result<String, String>>>,
        prompts: RefCell<Vec<Prompt>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: RefCell::new(
                    replies
                        .into_iter()
                        .rev()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl AskAsync for Scripted {
        type Response = String;

        async fn ask(&self, prompt: &Prompt) -> Result<String, BoxError> {
            self.prompts.borrow_mut().push(prompt.clone());
            match self.replies.borrow_mut().pop() {
                Some(Ok(s)) => Ok(s),
                Some(Err(e)) => Err(e.into()),
                None => Err("no reply scripted".into()),
            }
        }
    }

    fn candidate(text: &str) -> VerifyCandidate<'_> {
        VerifyCandidate {
            url: "https://example.com/a",
            text,
        }
    }

    #[test]
    fn test_should_verify_modes() {
        assert!(should_verify(VerifyMode::Always, false, 10_000, 1500));
        assert!(should_verify(VerifyMode::Fallback, true, 10_000, 1500));
        assert!(!should_verify(VerifyMode::Fallback, false, 100, 1500));
        assert!(should_verify(VerifyMode::Short, false, 1499, 1500));
        assert!(!should_verify(VerifyMode::Short, true, 1500, 1500));
        assert!(!should_verify(VerifyMode::Never, true, 1, 1500));
    }

    #[test]
    fn test_parse_verdict_variants() {
        let fenced = "```json\n{\"match\": true, \"confidence\": 0.8, \"reason\": \"same\", \"page_summary\": \"x\"}\n```";
        let v = parse_verdict(fenced).unwrap();
        assert!(v.matched);
        assert_eq!(v.confidence, 0.8);

        let chatty = "Sure! {\"match\": false, \"confidence\": \"0.4\", \"reason\": \"r\", \"pageSummary\": \"p\"} hope it helps";
        let v = parse_verdict(chatty).unwrap();
        assert!(!v.matched);
        assert_eq!(v.confidence, 0.4);
        assert_eq!(v.page_summary, "p");

        assert!(parse_verdict("no json here").is_err());
    }

    #[test]
    fn test_outcome_threshold() {
        let verdict = Verdict {
            matched: true,
            confidence: 0.69,
            ..Default::default()
        };
        let out = VerifyOutcome::from_verdict(verdict, 0.7, 200, false);
        assert!(!out.ok);
        assert_eq!(out.status, VerifyStatus::Mismatch);

        let verdict = Verdict {
            matched: true,
            confidence: 0.7,
            reason: "r".repeat(500),
            ..Default::default()
        };
        let out = VerifyOutcome::from_verdict(verdict, 0.7, 200, false);
        assert!(out.ok);
        assert_eq!(out.status, VerifyStatus::Ok);
        assert_eq!(out.reason.chars().count(), 200);

        let verdict = Verdict {
            matched: false,
            confidence: 0.99,
            ..Default::default()
        };
        assert!(!VerifyOutcome::from_verdict(verdict, 0.7, 200, false).ok);
    }

    #[tokio::test]
    async fn test_match_is_accepted() {
        let ask = Scripted::new(vec![Ok(r#"{"match":true,"confidence":0.9,"reason":"same event","page_summary":"s"}"#)]);
        let verifier = LlmVerifier::new(ask, VerifySettings::default());
        let out = verifier.verify(&VerifyContext::default(), candidate("body")).await;
        assert!(out.ok);
        assert_eq!(out.status, VerifyStatus::Ok);
        assert!(!out.fallback_used);
    }

    #[tokio::test]
    async fn test_length_error_retries_with_smaller_budget() {
        let ask = Scripted::new(vec![
            Err("This model's maximum context length is 8192 tokens"),
            Ok(r#"{"match":true,"confidence":0.95,"reason":"","page_summary":""}"#),
        ]);
        let settings = VerifySettings {
            max_chars: 5000,
            fallback_max_chars: 50,
            ..Default::default()
        };
        let verifier = LlmVerifier::new(ask, settings);
        let text = "x".repeat(4000);
        let out = verifier.verify(&VerifyContext::default(), candidate(&text)).await;
        assert!(out.ok);
        assert!(out.fallback_used);
        let prompts = verifier.ask.prompts.borrow();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].user.contains(&"x".repeat(4000)));
        assert!(!prompts[1].user.contains(&"x".repeat(51)));
    }

    #[tokio::test]
    async fn test_fail_open_and_fail_closed() {
        let ask = Scripted::new(vec![Err("502 bad gateway")]);
        let verifier = LlmVerifier::new(ask, VerifySettings::default());
        let out = verifier.verify(&VerifyContext::default(), candidate("body")).await;
        assert!(out.ok);
        assert_eq!(out.status, VerifyStatus::Unverified);
        assert!(out.error.is_some());

        let ask = Scripted::new(vec![Ok("not json")]);
        let settings = VerifySettings {
            fail_open: false,
            ..Default::default()
        };
        let verifier = LlmVerifier::new(ask, settings);
        let out = verifier.verify(&VerifyContext::default(), candidate("body")).await;
        assert!(!out.ok);
        assert_eq!(out.status, VerifyStatus::Error);
    }

    #[test]
    fn test_context_prefers_page_meta() {
        let original = OriginalContext {
            url: "https://example.com/a".into(),
            title_en: "Row title - Example News".into(),
            source: "Example".into(),
            date: "2025-01-01".into(),
            ..Default::default()
        };
        let ctx = VerifyContext::build(&original, None, 100);
        assert_eq!(ctx.title, "Row title");
        assert!(ctx.text_snippet.is_empty());

        let html = r#"<html><head><title>Page title</title>
            <meta name="description" content="What happened">
            <style>.x{color:red}</style></head>
            <body><p>Body of the original article.</p></body></html>"#;
        let ctx = VerifyContext::build(&original, Some(html), 100);
        assert_eq!(ctx.title, "Page title");
        assert_eq!(ctx.description, "What happened");
        assert_eq!(ctx.source, "Example");
        assert!(ctx.text_snippet.contains("Body of the original article."));
        assert!(!ctx.text_snippet.contains("color"));
    }
}
