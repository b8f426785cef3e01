//! Article summarization.
//!
//! The pipeline only needs [`Summarizer`]; [`LlmSummarizer`] is the
//! chat-model implementation used by the binary.

use crate::api::{AskAsync, JsonSchema, Prompt};
use crate::models::Event;
use crate::utils::{clamp_chars, looks_truncated, truncate_for_log};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, instrument, warn};

const MAX_INPUT_CHARS: usize = 20_000;

/// Fields produced for one article.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub summary: String,
    pub title_translated: String,
    pub topic: String,
    pub priority: String,
    /// Spacing the summarizer wants before its next call.
    pub delay: Duration,
}

#[async_trait(?Send)]
pub trait Summarizer {
    async fn summarize(&self, event: &Event) -> Option<Summary>;
}

#[derive(Debug, Deserialize)]
struct SummaryPayload {
    #[serde(default)]
    summary: String,
    #[serde(default, alias = "titleTranslated")]
    title_translated: String,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    priority: serde_json::Value,
}

/// Schema to request from the backing client.
pub fn summary_schema() -> JsonSchema {
    JsonSchema {
        name: "article_summary",
        schema: json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "summary": { "type": "string" },
                "title_translated": { "type": "string" },
                "topic": { "type": "string" },
                "priority": { "type": "integer" },
            },
            "required": ["summary", "title_translated", "topic", "priority"],
        }),
    }
}

/// Summarizer backed by a chat model.
#[derive(Debug)]
pub struct LlmSummarizer<A> {
    ask: A,
    target_language: String,
    spacing: Duration,
}

impl<A> LlmSummarizer<A>
where
    A: AskAsync<Response = String>,
{
    pub fn new(ask: A, target_language: &str, spacing: Duration) -> Self {
        Self {
            ask,
            target_language: target_language.to_string(),
            spacing,
        }
    }

    fn prompt(&self, event: &Event, shorter: bool) -> Prompt {
        let mut system = format!(
            "You summarize news articles for a {lang}-language digest. \
Return ONLY JSON with keys: summary (3-5 sentences in {lang}), \
title_translated (the headline in {lang}), topic (one or two words in English), \
priority (integer 1-10, 1 = most important).",
            lang = self.target_language
        );
        if shorter {
            system.push_str(" Keep the summary under 400 characters.");
        }
        let user = format!(
            "Source: {}\nURL: {}\nHeadline: {}\n\n{}",
            event.source,
            event.url,
            event.title(),
            clamp_chars(&event.text, MAX_INPUT_CHARS)
        );
        Prompt::new(system, user)
    }
}

fn priority_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.trim().to_string(),
        _ => String::new(),
    }
}

#[async_trait(?Send)]
impl<A> Summarizer for LlmSummarizer<A>
where
    A: AskAsync<Response = String>,
{
    #[instrument(level = "info", skip_all, fields(id = %event.id, chars = event.text.len()))]
    async fn summarize(&self, event: &Event) -> Option<Summary> {
        let mut shorter = false;
        loop {
            let raw = match self.ask.ask(&self.prompt(event, shorter)).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "Summarize call failed");
                    return None;
                }
            };
            match serde_json::from_str::<SummaryPayload>(raw.trim()) {
                Ok(payload) if !payload.summary.trim().is_empty() => {
                    info!(summary = %truncate_for_log(&payload.summary, 160), "Summarized");
                    return Some(Summary {
                        summary: payload.summary.trim().to_string(),
                        title_translated: payload.title_translated.trim().to_string(),
                        topic: payload.topic.trim().to_string(),
                        priority: priority_string(&payload.priority),
                        delay: self.spacing,
                    });
                }
                Ok(_) => {
                    warn!("Summarize returned an empty summary");
                    return None;
                }
                Err(e) if looks_truncated(&e) && !shorter => {
                    warn!("Summary was cut off; asking for a shorter one");
                    shorter = true;
                }
                Err(e) => {
                    warn!(error = %e, raw = %truncate_for_log(&raw, 200), "Summarize response unparseable");
                    return None;
                }
            }
        }
    }
}
