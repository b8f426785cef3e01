//! The per-event content pipeline.
//!
//! One event at a time goes through: cache, direct fetch, browser fetch,
//! alternative sources, external search, then summarization. Every piece of
//! retrieved text passes the verification gate before it is accepted. The
//! working copy of a row is only written back once its pass is over.
//!
//! Collaborators are trait objects so the binary can wire real clients and
//! tests can wire counting fakes.

use crate::alternatives::{Authority, Classified, Ranked, classify, merge_candidates};
use crate::browse::{PageDriver, browse_article};
use crate::cache::{ContentCache, ProbeReason};
use crate::config::Settings;
use crate::error::{BrowseError, PipelineError};
use crate::extract::{ExtractSettings, classify_page_state, extract_text};
use crate::fetch::{DirectFetch, FetchMethod, FetchStatus};
use crate::meta::{extract_meta, extract_title};
use crate::models::{ArticleMeta, Candidate, ContentMethod, Event, OriginalContext, REQUIRED_COLUMNS, VerifyStatus};
use crate::pacing::RunState;
use crate::search::{AggregatorSearch, ExternalSearch, UrlDecoder, external_queries, search_all};
use crate::store::RowStore;
use crate::summarize::Summarizer;
use crate::trace::{EventLog, EventTrace, Failure, FailureSummary, RunStats};
use crate::utils::{
    clamp_chars, format_duration, is_aggregator_url, is_blank, normalize_title_for_search, source_from_url,
};
use crate::verify::{VerifyCandidate, VerifyContext, Verifier, VerifyOutcome, should_verify};
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Row column that may carry candidates discovered before this run.
const ALTERNATIVES_COLUMN: &str = "alternatives";

/// External services the pipeline talks to.
pub struct Collaborators {
    pub fetcher: Box<dyn DirectFetch>,
    pub browser: Box<dyn PageDriver>,
    pub verifier: Box<dyn Verifier>,
    pub decoder: Box<dyn UrlDecoder>,
    pub aggregator: Box<dyn AggregatorSearch>,
    pub external: Box<dyn ExternalSearch>,
    pub summarizer: Box<dyn Summarizer>,
}

pub struct Pipeline {
    deps: Collaborators,
    cache: ContentCache,
    settings: Settings,
    extract: ExtractSettings,
    authority: Authority,
    state: RunState,
    event_log: EventLog,
}

/// Where the accepted text came from.
#[derive(Debug, Clone, PartialEq)]
struct ContentSource {
    url: String,
    source: String,
    method: ContentMethod,
    is_fallback: bool,
}

/// State of one event's pass. Dropped (after merging) when the pass ends.
struct Pass {
    event: Event,
    original: OriginalContext,
    trace: EventTrace,
    pool: Vec<Candidate>,
    original_html: Option<String>,
    context: Option<VerifyContext>,
    content_source: Option<ContentSource>,
    verify_status: Option<VerifyStatus>,
    decode_attempted: bool,
    had_text: bool,
}

impl Pass {
    fn new(base: &Event) -> Self {
        let mut original = OriginalContext::default();
        original.capture(base);
        Self {
            event: base.clone(),
            original,
            trace: EventTrace::new(base),
            pool: candidates_from_row(base),
            original_html: None,
            context: None,
            content_source: None,
            verify_status: None,
            decode_attempted: false,
            had_text: false,
        }
    }
}

/// Retrieved and verified content.
struct Accepted {
    html: String,
    text: String,
    url: String,
    meta: ArticleMeta,
    method: ContentMethod,
    verify: VerifyOutcome,
}

enum Retrieval {
    Accepted(Accepted),
    /// Text was found but the gate rejected it.
    Mismatch(VerifyOutcome),
    Blocked(FetchStatus),
    Exhausted,
}

enum CacheOutcome {
    Hit,
    Mismatch,
    Miss,
}

enum AltOutcome {
    Fetched,
    Deferred,
    Failed,
}

fn candidates_from_row(event: &Event) -> Vec<Candidate> {
    let parsed = match event.extra.get(ALTERNATIVES_COLUMN) {
        Some(Value::String(raw)) if !is_blank(raw) => serde_json::from_str(raw),
        Some(value @ Value::Array(_)) => serde_json::from_value(value.clone()),
        _ => return Vec::new(),
    };
    parsed.unwrap_or_else(|e| {
        warn!(id = %event.id, error = %e, "Ignoring unreadable alternatives column");
        Vec::new()
    })
}

/// Trim links and move an aggregator link out of `url`.
fn normalize(event: &mut Event) {
    event.url = event.url.trim().to_string();
    event.gn_url = event.gn_url.trim().to_string();
    if !event.url.is_empty() && is_aggregator_url(&event.url) {
        if event.gn_url.is_empty() {
            event.gn_url = std::mem::take(&mut event.url);
        } else {
            event.url.clear();
        }
    }
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn content_method(method: FetchMethod) -> ContentMethod {
    match method {
        FetchMethod::Jina => ContentMethod::Jina,
        _ => ContentMethod::Fetch,
    }
}

impl Pipeline {
    pub fn new(deps: Collaborators, settings: Settings, cache: ContentCache, event_log: EventLog) -> Self {
        Self {
            extract: ExtractSettings::from(&settings.pipeline),
            authority: Authority::new(&settings.alternatives),
            state: RunState::new(&settings.pacing),
            deps,
            cache,
            settings,
            event_log,
        }
    }

    /// Close the browser backend.
    pub async fn shutdown(&self) {
        self.deps.browser.close().await;
    }

    /// Process every row that is not done yet, in store order.
    ///
    /// Only a closed browser stops the run early; the row being processed at
    /// that moment is left untouched.
    #[instrument(level = "info", skip_all)]
    pub async fn run(&mut self, store: &mut dyn RowStore) -> Result<RunStats, PipelineError> {
        store.pause_autosave();
        store.ensure_columns(REQUIRED_COLUMNS);
        self.cache.build_alias_index().await;

        let mut stats = RunStats::default();
        let mut failures = FailureSummary::default();
        let limit = self.settings.pipeline.fail_summary_limit;
        let total = store.rows().len();
        info!(total, "Processing rows");

        for index in 0..total {
            let base = store.rows()[index].clone();
            if base.is_done() {
                debug!(id = %base.id, "Row already verified; skipping");
                continue;
            }
            info!(id = %base.id, title = %base.title(), "[{}/{}]", index + 1, total);

            let pass = match self.process_event(&base).await {
                Ok(pass) => pass,
                Err(e) => {
                    error!(id = %base.id, error = %e, "Run aborted");
                    failures.log(limit);
                    if let Err(flush) = store.resume_autosave(true).await {
                        warn!(error = %flush, "Flushing rows after abort failed");
                    }
                    return Err(e);
                }
            };

            let (row, mut trace, failure) = self.finish(pass, &base);
            match failure {
                Some(failure) => {
                    stats.fail += 1;
                    failures.push(failure);
                }
                None => stats.ok += 1,
            }

            let started = Instant::now();
            let saved = store.save_row(index, &row).await;
            trace.time("write", started.elapsed());
            trace.record("write", if saved { "ok" } else { "fail" }, "", "");
            trace.log_timings();
            self.event_log.append(&trace).await;
        }

        store.resume_autosave(true).await?;
        failures.log(limit);
        info!(ok = stats.ok, fail = stats.fail, "Run complete");
        Ok(stats)
    }

    async fn process_event(&mut self, base: &Event) -> Result<Pass, PipelineError> {
        let mut pass = Pass::new(base);
        normalize(&mut pass.event);
        pass.had_text = self.has_text(&pass.event);
        let started = Instant::now();

        if is_blank(&pass.event.url) && !is_blank(&pass.event.gn_url) && !pass.had_text {
            self.decode_event_url(&mut pass).await;
        }
        if !is_blank(&pass.event.url) {
            let url = pass.event.url.clone();
            self.try_cache(&mut pass, &url, false).await;
        }
        if is_blank(&pass.event.url) && !is_blank(&pass.event.gn_url) && !pass.decode_attempted {
            self.decode_event_url(&mut pass).await;
        }
        if is_blank(&pass.event.source) && !is_blank(&pass.event.url) && !is_aggregator_url(&pass.event.url) {
            if let Some(source) = source_from_url(&pass.event.url) {
                pass.event.source = source;
            }
        }

        if pass.event.needs_text_fields() && !self.has_text(&pass.event) {
            if is_blank(&pass.event.url) && !is_blank(&pass.event.gn_url) {
                self.decode_with_retries(&mut pass).await;
            }
            let mut fetched = false;
            if !is_blank(&pass.event.url) {
                let url = pass.event.url.clone();
                match self.fetch_with_retry(&mut pass, &url, false).await? {
                    Retrieval::Accepted(accepted) => {
                        self.accept(&mut pass, accepted, false).await;
                        fetched = true;
                    }
                    Retrieval::Mismatch(verify) => {
                        pass.verify_status = Some(verify.status);
                        pass.trace.record("fetch", "mismatch", "", &verify.reason);
                    }
                    Retrieval::Blocked(status) => {
                        pass.trace.record("fetch", "blocked", "", status.label());
                    }
                    Retrieval::Exhausted => {
                        pass.trace.record("fetch", "fail", "", "no_text");
                    }
                }
            }
            if !fetched {
                fetched = self.resolve_alternatives(&mut pass).await?;
            }
            if !fetched {
                pass.trace.record("fallback_failed", "fail", "", "no candidate produced verified text");
            }
        }
        pass.trace.time("content", started.elapsed());

        if pass.event.needs_text_fields() && self.has_text(&pass.event) {
            self.summarize(&mut pass).await;
        }
        Ok(pass)
    }

    fn has_text(&self, event: &Event) -> bool {
        event.text.trim().chars().count() > self.settings.pipeline.min_text_length
    }

    /// Decode a redirect link through the paced decoder.
    async fn decode(&mut self, pass: &mut Pass, redirect: &str) -> String {
        self.state.ledger.url_decode.wait().await;
        self.state.ledger.url_decode.mark();
        let url = self.deps.decoder.decode(redirect).await.trim().to_string();
        self.state.ledger.url_decode.bump();
        let status = if url.is_empty() { "fail" } else { "ok" };
        pass.trace.record_with("decode", status, "", "", fields(&[("url", json!(url))]));
        url
    }

    async fn decode_event_url(&mut self, pass: &mut Pass) -> bool {
        pass.decode_attempted = true;
        let gn_url = pass.event.gn_url.clone();
        let url = self.decode(pass, &gn_url).await;
        if url.is_empty() {
            return false;
        }
        if is_blank(&pass.event.url) {
            pass.event.url = url.clone();
        }
        pass.original.set_url_if_missing(&url);
        true
    }

    /// Decode the event's link, waiting out the decoder cooldown between tries.
    async fn decode_with_retries(&mut self, pass: &mut Pass) {
        if self.decode_event_url(pass).await {
            return;
        }
        let cap = Duration::from_secs(self.settings.pipeline.decode_retry_wait_secs);
        for retry in 1..=self.settings.pipeline.decode_retries {
            let wait = self
                .deps
                .decoder
                .cooldown()
                .max(self.state.ledger.url_decode.remaining())
                .min(cap);
            info!(id = %pass.event.id, retry, wait = %format_duration(wait), "Waiting to retry decode");
            sleep(wait).await;
            if self.decode_event_url(pass).await {
                return;
            }
        }
    }

    /// How long a decode would have to wait right now.
    fn decode_wait(&self) -> Duration {
        self.state
            .ledger
            .url_decode
            .remaining()
            .max(self.deps.decoder.cooldown())
    }

    /// Look for cached text for `url` and run it through the gate.
    ///
    /// Text the row already carries is gated the same way as cached text.
    async fn try_cache(&mut self, pass: &mut Pass, url: &str, is_fallback: bool) -> CacheOutcome {
        let url = match self.cache.resolve_alias(url) {
            Some(alias) => {
                debug!(%url, %alias, "Cache alias");
                alias.to_string()
            }
            None => url.to_string(),
        };
        let probe = self.cache.probe(&url).await;
        let found = match probe.reason {
            ProbeReason::NoUrl => return CacheOutcome::Miss,
            ProbeReason::Missing => false,
            ProbeReason::Found => true,
        };
        let existing = !is_blank(&pass.event.text);

        if found {
            self.cache.backfill_meta(&mut pass.event, &url).await;
            let mut hit = if existing {
                self.has_text(&pass.event)
            } else {
                self.cache.backfill_text(&mut pass.event, &url).await
            };
            let wants_original = !is_fallback && pass.original_html.is_none();
            if probe.has_html && (!hit || wants_original) {
                if let Some(html) = self.cache.read_html(&url).await {
                    if wants_original {
                        pass.original_html = Some(html.clone());
                    }
                    if !hit {
                        if let Some(text) = extract_text(&html, &self.extract) {
                            pass.event.text = clamp_chars(&text, self.settings.pipeline.max_text_chars);
                            if let Err(e) = self.cache.write_text(&pass.event, &pass.event.text, &url).await {
                                warn!(error = %e, "Rewriting cached text failed");
                            }
                            hit = true;
                        }
                    }
                }
            }
            if !hit {
                pass.trace.record("cache", "miss", "cache", "short_or_empty");
                return CacheOutcome::Miss;
            }
        } else {
            pass.trace.record("cache", "miss", "cache", "no_files");
        }

        if !self.has_text(&pass.event) {
            return CacheOutcome::Miss;
        }
        pass.trace.record_with(
            "cache",
            if existing { "existing" } else { "hit" },
            "cache",
            "",
            fields(&[("len", json!(pass.event.text.chars().count()))]),
        );

        let text = pass.event.text.clone();
        let verify = self.verify_text(pass, &url, &text, is_fallback, ContentMethod::Cache).await;
        pass.verify_status = Some(verify.status);
        if verify.ok {
            let source = pass.event.source.clone();
            self.set_content_source(pass, &url, &source, ContentMethod::Cache, is_fallback);
            CacheOutcome::Hit
        } else {
            pass.trace.record("cache_verify", "mismatch", "cache", &verify.reason);
            pass.event.reset_text_fields();
            CacheOutcome::Mismatch
        }
    }

    /// Run the gate over `text` retrieved from `url`.
    async fn verify_text(
        &mut self,
        pass: &mut Pass,
        url: &str,
        text: &str,
        is_fallback: bool,
        method: ContentMethod,
    ) -> VerifyOutcome {
        let vs = &self.settings.verify;
        if !should_verify(vs.mode, is_fallback, text.chars().count(), vs.short_threshold) {
            pass.trace.record("verify", "skipped", method.as_str(), "");
            return VerifyOutcome::skipped();
        }
        let started = Instant::now();
        if is_blank(&pass.original.url) && !is_blank(&pass.original.gn_url) {
            let gn_url = pass.original.gn_url.clone();
            let decoded = self.decode(pass, &gn_url).await;
            if !decoded.is_empty() && is_blank(&pass.event.url) {
                pass.event.url = decoded.clone();
            }
            pass.original.set_url_if_missing(&decoded);
        }

        self.state.ledger.verify.wait().await;
        self.state.ledger.verify.mark();

        let context = match &pass.context {
            Some(context) => context.clone(),
            None => {
                let context = VerifyContext::build(
                    &pass.original,
                    pass.original_html.as_deref(),
                    self.settings.verify.context_max_chars,
                );
                pass.context = Some(context.clone());
                context
            }
        };
        let outcome = self.deps.verifier.verify(&context, VerifyCandidate { url, text }).await;
        pass.trace.time("verify", started.elapsed());
        pass.trace.record_with(
            "verify",
            outcome.status.as_str(),
            method.as_str(),
            &outcome.reason,
            fields(&[
                ("url", json!(url)),
                ("confidence", json!(outcome.confidence)),
                ("fallback", json!(is_fallback)),
            ]),
        );
        outcome
    }

    /// Retrieval attempts for one URL: direct fetch, then the browser.
    ///
    /// A verified page ends the loop. Verified-rejected text and blocking
    /// statuses also end it so the caller can move on to other sources.
    #[instrument(level = "info", skip_all, fields(id = %pass.event.id, %url, is_fallback))]
    async fn fetch_with_retry(&mut self, pass: &mut Pass, url: &str, is_fallback: bool) -> Result<Retrieval, PipelineError> {
        let attempts = self.settings.pipeline.fetch_attempts.max(1);
        let mut last_html = String::new();
        let mut last_status: Option<FetchStatus> = None;

        for attempt in 1..=attempts {
            let mut mismatch: Option<VerifyOutcome> = None;
            let mut blocked: Option<FetchStatus> = None;

            let outcome = self.deps.fetcher.fetch(url).await;
            let method = content_method(outcome.method);
            match outcome.html {
                Some(html) => {
                    if !is_fallback && pass.original_html.is_none() {
                        pass.original_html = Some(html.clone());
                    }
                    match extract_text(&html, &self.extract) {
                        Some(text) => {
                            let verify = self.verify_text(pass, url, &text, is_fallback, method).await;
                            if verify.ok {
                                return Ok(Retrieval::Accepted(Accepted {
                                    meta: extract_meta(&html),
                                    html,
                                    text,
                                    url: url.to_string(),
                                    method,
                                    verify,
                                }));
                            }
                            pass.trace.record("fetch_verify", "mismatch", method.as_str(), &verify.reason);
                            mismatch = Some(verify);
                        }
                        None => {
                            pass.trace.record("fetch", "no_text", method.as_str(), "");
                            last_html = html;
                        }
                    }
                }
                None => match outcome.status {
                    Some(status) if status.is_blocked() => {
                        pass.trace.record("fetch", "blocked", outcome.method.as_str(), status.label());
                        blocked = Some(status);
                    }
                    Some(status) => {
                        pass.trace.record("fetch", "fail", outcome.method.as_str(), status.label());
                        last_status = Some(status);
                    }
                    None => pass.trace.record("fetch", "fail", outcome.method.as_str(), ""),
                },
            }

            if !self.settings.pipeline.browse_on_mismatch {
                if let Some(verify) = mismatch.take() {
                    return Ok(Retrieval::Mismatch(verify));
                }
            }

            let browsed = browse_article(
                &*self.deps.browser,
                &mut self.state.cooldowns,
                url,
                !is_fallback,
                &self.settings.browse,
            )
            .await;
            match browsed {
                Ok(page) if !page.html.trim().is_empty() => {
                    if !is_fallback && pass.original_html.is_none() {
                        pass.original_html = Some(page.html.clone());
                    }
                    match extract_text(&page.html, &self.extract) {
                        Some(text) => {
                            let verify = self.verify_text(pass, url, &text, is_fallback, ContentMethod::Browse).await;
                            if verify.ok {
                                let meta = if page.meta.is_empty() {
                                    extract_meta(&page.html)
                                } else {
                                    page.meta
                                };
                                return Ok(Retrieval::Accepted(Accepted {
                                    html: page.html,
                                    text,
                                    url: url.to_string(),
                                    meta,
                                    method: ContentMethod::Browse,
                                    verify,
                                }));
                            }
                            pass.trace.record("browse_verify", "mismatch", "browse", &verify.reason);
                            mismatch = Some(verify);
                        }
                        None => {
                            pass.trace.record("browse", "no_text", "browse", "");
                            last_html = page.html;
                        }
                    }
                }
                Ok(_) => pass.trace.record("browse", "empty", "browse", ""),
                Err(BrowseError::BrowserClosed) => return Err(PipelineError::BrowserClosed),
                Err(e @ (BrowseError::Captcha { .. } | BrowseError::Timeout { .. })) => {
                    pass.trace.record("browse", "abort", "browse", &e.to_string());
                }
                Err(e) => pass.trace.record("browse", "fail", "browse", &e.to_string()),
            }

            if let Some(verify) = mismatch {
                return Ok(Retrieval::Mismatch(verify));
            }
            if let Some(status) = blocked {
                return Ok(Retrieval::Blocked(status));
            }
            debug!(attempt, attempts, "Retrieval attempt produced no text");
        }

        let state = classify_page_state(&last_html, &extract_title(&last_html));
        pass.trace.record_with(
            "fetch",
            "no_text",
            "",
            state.as_str(),
            fields(&[("last_status", json!(last_status.map(|s| s.to_string())))]),
        );
        Ok(Retrieval::Exhausted)
    }

    /// Store accepted content on the event and in the cache.
    async fn accept(&mut self, pass: &mut Pass, accepted: Accepted, is_fallback: bool) {
        pass.event.apply_meta(&accepted.meta);
        if let Err(e) = self
            .cache
            .write(&mut pass.event, &accepted.html, &accepted.text, &accepted.url)
            .await
        {
            warn!(error = %e, url = %accepted.url, "Caching article failed");
        }
        pass.verify_status = Some(accepted.verify.status);
        let source = pass.event.source.clone();
        self.set_content_source(pass, &accepted.url, &source, accepted.method, is_fallback);
        pass.trace.record_with(
            "content",
            "ok",
            accepted.method.as_str(),
            "",
            fields(&[
                ("url", json!(accepted.url)),
                ("len", json!(pass.event.text.chars().count())),
            ]),
        );
    }

    fn set_content_source(&self, pass: &mut Pass, url: &str, source: &str, method: ContentMethod, is_fallback: bool) {
        if pass.content_source.is_some() {
            return;
        }
        pass.content_source = Some(ContentSource {
            url: url.to_string(),
            source: source.to_string(),
            method,
            is_fallback,
        });
        pass.event.content_method = method.as_str().to_string();
    }

    fn log_classified(&self, pass: &mut Pass, classified: &Classified, phase: &str) {
        for ranked in &classified.accepted {
            debug!(
                id = %pass.event.id,
                source = %ranked.candidate.source,
                level = ranked.level,
                link = %ranked.candidate.link(),
                "Candidate accepted"
            );
        }
        for rejected in &classified.rejected {
            debug!(
                id = %pass.event.id,
                source = %rejected.candidate.source,
                level = rejected.level,
                reason = %rejected.reason,
                "Candidate rejected"
            );
        }
        pass.trace.record_with(
            phase,
            if classified.accepted.is_empty() { "empty" } else { "ok" },
            "",
            "",
            fields(&[
                ("accepted", json!(classified.accepted.len())),
                ("rejected", json!(classified.rejected.len())),
            ]),
        );
    }

    /// Fill the candidate pool from the aggregator when it is empty.
    async fn hydrate_pool(&mut self, pass: &mut Pass) {
        let query = normalize_title_for_search(if is_blank(pass.original.title()) {
            pass.event.title()
        } else {
            pass.original.title()
        });
        if query.is_empty() {
            return;
        }
        self.state.ledger.aggregator_search.wait().await;
        self.state.ledger.aggregator_search.mark();
        let found = self.deps.aggregator.search(&query).await;
        let total = found.len();
        let added = merge_candidates(&mut pass.pool, &pass.event, &pass.original, found);
        pass.trace.record_with(
            "aggregator_search",
            if added > 0 { "ok" } else { "empty" },
            "",
            "",
            fields(&[("query", json!(query)), ("found", json!(total)), ("added", json!(added))]),
        );
    }

    async fn resolve_alternatives(&mut self, pass: &mut Pass) -> Result<bool, PipelineError> {
        if pass.pool.is_empty() {
            self.hydrate_pool(pass).await;
        }
        let classified = classify(
            &pass.event,
            &pass.original,
            &pass.pool,
            &self.authority,
            &self.settings.alternatives,
        );
        self.log_classified(pass, &classified, "fallback_candidates");
        if self.try_candidates(pass, &classified.accepted).await? {
            return Ok(true);
        }
        self.external_fallback(pass).await
    }

    /// Try candidates in order. The first one that would have to wait for the
    /// decoder is set aside and retried, with waiting, once the loop ends.
    async fn try_candidates(&mut self, pass: &mut Pass, candidates: &[Ranked]) -> Result<bool, PipelineError> {
        let mut deferred = None;
        for ranked in candidates {
            match self.try_alternative(pass, ranked, false).await? {
                AltOutcome::Fetched => return Ok(true),
                AltOutcome::Deferred => {
                    deferred = Some(ranked);
                    break;
                }
                AltOutcome::Failed => {}
            }
        }
        if let Some(ranked) = deferred {
            if let AltOutcome::Fetched = self.try_alternative(pass, ranked, true).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn try_alternative(&mut self, pass: &mut Pass, ranked: &Ranked, allow_wait: bool) -> Result<AltOutcome, PipelineError> {
        let candidate = &ranked.candidate;
        let mut alt_url = candidate.url.trim().to_string();
        if alt_url.is_empty() {
            if !allow_wait {
                let wait = self.decode_wait();
                if !wait.is_zero() {
                    debug!(source = %candidate.source, wait = %format_duration(wait), "Candidate decode deferred");
                    return Ok(AltOutcome::Deferred);
                }
            }
            alt_url = self.decode(pass, candidate.gn_url.trim()).await;
            if alt_url.is_empty() {
                pass.trace.record("fallback_decode", "fail", "", "decode_fail");
                return Ok(AltOutcome::Failed);
            }
        }
        info!(source = %candidate.source, level = ranked.level, url = %alt_url, "Trying alternative source");

        if let CacheOutcome::Hit = self.try_cache(pass, &alt_url, true).await {
            apply_fallback_selection(pass, candidate, &alt_url);
            pass.trace.record("fallback_selected", "ok", "cache", &candidate.source);
            return Ok(AltOutcome::Fetched);
        }

        let reason = match self.fetch_with_retry(pass, &alt_url, true).await? {
            Retrieval::Accepted(accepted) => {
                apply_fallback_selection(pass, candidate, &alt_url);
                let method = accepted.method;
                self.accept(pass, accepted, true).await;
                pass.trace.record("fallback_selected", "ok", method.as_str(), &candidate.source);
                return Ok(AltOutcome::Fetched);
            }
            Retrieval::Mismatch(verify) => {
                pass.verify_status = Some(verify.status);
                "verify_mismatch".to_string()
            }
            Retrieval::Blocked(status) => format!("blocked_{status}"),
            Retrieval::Exhausted => "no_text".to_string(),
        };
        pass.trace.record_with(
            "fallback_attempt",
            "rejected",
            "",
            &reason,
            fields(&[("source", json!(candidate.source)), ("url", json!(alt_url))]),
        );
        Ok(AltOutcome::Failed)
    }

    async fn external_fallback(&mut self, pass: &mut Pass) -> Result<bool, PipelineError> {
        if !self.deps.external.enabled() {
            pass.trace.record("external_search", "skipped", "", "disabled");
            return Ok(false);
        }
        let queries = external_queries(&pass.original, self.settings.external_search.max_queries);
        if queries.is_empty() {
            pass.trace.record("external_search", "skipped", "", "no queries");
            return Ok(false);
        }
        let found = search_all(&*self.deps.external, queries).await;
        if found.is_empty() {
            pass.trace.record("external_search", "empty", "", "");
            return Ok(false);
        }
        let classified = classify(
            &pass.event,
            &pass.original,
            &found,
            &self.authority,
            &self.settings.alternatives,
        );
        self.log_classified(pass, &classified, "external_candidates");
        self.try_candidates(pass, &classified.accepted).await
    }

    async fn summarize(&mut self, pass: &mut Pass) {
        let started = Instant::now();
        self.state.ledger.summarize.wait().await;
        self.state.ledger.summarize.mark();
        match self.deps.summarizer.summarize(&pass.event).await {
            Some(summary) => {
                self.state.ledger.summarize.set_delay(summary.delay);
                let event = &mut pass.event;
                fill(&mut event.topic, &summary.topic);
                fill(&mut event.priority, &summary.priority);
                fill(&mut event.title_ru, &summary.title_translated);
                fill(&mut event.summary, &summary.summary);
                fill(&mut event.ai_topic, &summary.topic);
                fill(&mut event.ai_priority, &summary.priority);
                pass.trace.record("summarize", "ok", "", "");
            }
            None => pass.trace.record("summarize", "fail", "", ""),
        }
        pass.trace.time("summarize", started.elapsed());
    }

    /// Whether the gate would run on the row's own text.
    fn would_verify(&self, event: &Event) -> bool {
        let vs = &self.settings.verify;
        should_verify(vs.mode, false, event.text.trim().chars().count(), vs.short_threshold)
    }

    /// Decide the row's final status and merge the working copy.
    fn finish(&self, pass: Pass, base: &Event) -> (Event, EventTrace, Option<Failure>) {
        let Pass {
            mut event,
            trace,
            verify_status,
            had_text,
            content_source,
            ..
        } = pass;
        if is_blank(&event.gn_url) && !is_blank(&base.gn_url) {
            event.gn_url = base.gn_url.clone();
        }
        let missing = event.missing_fields();
        let complete = missing.is_empty();
        let verified = verify_status.map_or(had_text && !self.would_verify(&event), |s| s.is_verified());

        event.verify_status = match verify_status {
            _ if complete && verified => VerifyStatus::Ok.as_str().to_string(),
            Some(status) if !status.is_verified() => status.as_str().to_string(),
            _ => String::new(),
        };
        if let Some(source) = &content_source {
            debug!(
                id = %event.id,
                url = %source.url,
                source = %source.source,
                method = %source.method,
                fallback = source.is_fallback,
                "Content source"
            );
        }

        let failure = (!(complete && verified)).then(|| Failure {
            id: event.id.clone(),
            title: trace.title().to_string(),
            source: event.source.clone(),
            url: event.url.clone(),
            step: {
                let mut step = trace.last().clone();
                step.reason = if missing.is_empty() {
                    format!("verify status: {}", verify_status.map(|s| s.as_str()).unwrap_or("none"))
                } else {
                    format!("missing: {}", missing.join(", "))
                };
                step
            },
        });
        (merge_row(base, event), trace, failure)
    }
}

fn fill(target: &mut String, value: &str) {
    if is_blank(target) && !is_blank(value) {
        *target = value.to_string();
    }
}

/// Record which alternative the content came from.
fn apply_fallback_selection(pass: &mut Pass, candidate: &Candidate, alt_url: &str) {
    let event = &mut pass.event;
    fill(&mut event.source, &candidate.source);
    fill(&mut event.gn_url, &candidate.gn_url);
    fill(&mut event.title_en, &candidate.title);
    fill(&mut event.url, alt_url);
    if is_blank(&event.gn_url) && is_blank(&event.alternative_url) && event.url.trim() != alt_url {
        event.alternative_url = alt_url.to_string();
    }
    let url = event.url.clone();
    pass.original.set_url_if_missing(&url);
}

/// The persisted row after a pass: the working copy plus any extra column
/// only the base row carries.
fn merge_row(base: &Event, mut working: Event) -> Event {
    for (key, value) in &base.extra {
        working.extra.entry(key.clone()).or_insert_with(|| value.clone());
    }
    working
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PaceSettings, VerifyMode};
    use crate::error::{DriverError, StoreError};
    use crate::fetch::FetchOutcome;
    use crate::models::CandidateOrigin;
    use crate::summarize::Summary;
    use crate::verify::Verdict;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::rc::Rc;
    use tempfile::{TempDir, tempdir};

    const GN_URL: &str = "https://news.google.com/rss/articles/CBMiquake";
    const TITLE: &str = "Strong earthquake hits northern Japan coast";

    fn article_html(len: usize) -> String {
        format!(
            r#"<html><head><title>{TITLE}</title><script type="application/ld+json">{{"@type":"NewsArticle","headline":"{TITLE}","articleBody":"{}"}}</script></head><body><p>short</p></body></html>"#,
            "x".repeat(len)
        )
    }

    /// Call counters shared between the fakes and the test body.
    #[derive(Default)]
    struct Calls {
        fetched: RefCell<Vec<String>>,
        browsed: RefCell<Vec<String>>,
        verified: RefCell<Vec<String>>,
        decoded: Cell<usize>,
        summarized: Cell<usize>,
        aggregator: Cell<usize>,
        external: RefCell<Vec<String>>,
    }

    struct FakeFetch {
        pages: HashMap<String, FetchOutcome>,
        calls: Rc<Calls>,
    }

    #[async_trait(?Send)]
    impl DirectFetch for FakeFetch {
        async fn fetch(&self, url: &str) -> FetchOutcome {
            self.calls.fetched.borrow_mut().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .unwrap_or_else(|| FetchOutcome::failed(FetchMethod::Failed, Some(FetchStatus::Http(404))))
        }
    }

    struct FakeBrowser {
        pages: HashMap<String, String>,
        closed: bool,
        current: RefCell<String>,
        calls: Rc<Calls>,
    }

    #[async_trait(?Send)]
    impl PageDriver for FakeBrowser {
        fn is_closed(&self) -> bool {
            self.closed
        }
        async fn goto(&self, url: &str, _timeout: Duration) -> Result<(), DriverError> {
            if url.starts_with("https://archive.ph/") {
                return Err(DriverError::Other("archive offline".into()));
            }
            self.calls.browsed.borrow_mut().push(url.to_string());
            *self.current.borrow_mut() = url.to_string();
            Ok(())
        }
        async fn wait_network_idle(&self, _timeout: Duration) -> Result<(), DriverError> {
            Ok(())
        }
        async fn detect_captcha(&self) -> bool {
            false
        }
        async fn body_text(&self) -> Result<String, DriverError> {
            Ok(String::new())
        }
        async fn inner_html_all(&self, _selector: &str) -> Result<Vec<String>, DriverError> {
            Ok(self.pages.get(&*self.current.borrow()).cloned().into_iter().collect())
        }
        async fn click_first(&self, _selector: &str) -> Result<bool, DriverError> {
            Ok(false)
        }
        async fn meta(&self) -> Result<ArticleMeta, DriverError> {
            Ok(ArticleMeta::default())
        }
        async fn close(&self) {}
    }

    /// Matches every URL except those listed as mismatches.
    struct FakeVerifier {
        mismatches: Vec<String>,
        calls: Rc<Calls>,
    }

    #[async_trait(?Send)]
    impl Verifier for FakeVerifier {
        async fn verify(&self, _original: &VerifyContext, candidate: VerifyCandidate<'_>) -> VerifyOutcome {
            self.calls.verified.borrow_mut().push(candidate.url.to_string());
            let matched = !self.mismatches.iter().any(|u| u == candidate.url);
            let verdict = Verdict {
                matched,
                confidence: if matched { 0.9 } else { 0.2 },
                reason: if matched { "same event" } else { "different event" }.into(),
                page_summary: String::new(),
            };
            VerifyOutcome::from_verdict(verdict, 0.7, 200, false)
        }
    }

    struct FakeDecoder {
        map: HashMap<String, String>,
        cooldown: Duration,
        calls: Rc<Calls>,
    }

    #[async_trait(?Send)]
    impl UrlDecoder for FakeDecoder {
        async fn decode(&self, redirect_url: &str) -> String {
            self.calls.decoded.set(self.calls.decoded.get() + 1);
            self.map.get(redirect_url).cloned().unwrap_or_default()
        }
        fn cooldown(&self) -> Duration {
            self.cooldown
        }
    }

    struct FakeAggregator {
        results: Vec<Candidate>,
        calls: Rc<Calls>,
    }

    #[async_trait(?Send)]
    impl AggregatorSearch for FakeAggregator {
        async fn search(&self, _query: &str) -> Vec<Candidate> {
            self.calls.aggregator.set(self.calls.aggregator.get() + 1);
            self.results.clone()
        }
    }

    struct NoExternal;

    struct FakeExternal {
        results: Vec<Candidate>,
        calls: Rc<Calls>,
    }

    #[async_trait(?Send)]
    impl ExternalSearch for FakeExternal {
        fn enabled(&self) -> bool {
            true
        }
        async fn search(&self, query: &str) -> Vec<Candidate> {
            self.calls.external.borrow_mut().push(query.to_string());
            self.results.clone()
        }
    }

    /// Every verification call fails; the outcome follows the fail-open policy.
    struct FailingVerifier {
        fail_open: bool,
        calls: Rc<Calls>,
    }

    #[async_trait(?Send)]
    impl Verifier for FailingVerifier {
        async fn verify(&self, _original: &VerifyContext, candidate: VerifyCandidate<'_>) -> VerifyOutcome {
            self.calls.verified.borrow_mut().push(candidate.url.to_string());
            VerifyOutcome::failed("502 bad gateway".into(), self.fail_open)
        }
    }

    #[async_trait(?Send)]
    impl ExternalSearch for NoExternal {
        fn enabled(&self) -> bool {
            false
        }
        async fn search(&self, _query: &str) -> Vec<Candidate> {
            Vec::new()
        }
    }

    struct FakeSummarizer {
        calls: Rc<Calls>,
    }

    #[async_trait(?Send)]
    impl Summarizer for FakeSummarizer {
        async fn summarize(&self, _event: &Event) -> Option<Summary> {
            self.calls.summarized.set(self.calls.summarized.get() + 1);
            Some(Summary {
                summary: "Сильное землетрясение.".into(),
                title_translated: "Землетрясение в Японии".into(),
                topic: "disaster".into(),
                priority: "2".into(),
                delay: Duration::ZERO,
            })
        }
    }

    #[derive(Default)]
    struct MemStore {
        rows: Vec<Event>,
        saved: Vec<usize>,
        paused: bool,
        /// Number of saved rows at each flushing resume.
        flushes: Vec<usize>,
    }

    #[async_trait(?Send)]
    impl RowStore for MemStore {
        fn rows(&self) -> &[Event] {
            &self.rows
        }
        fn ensure_columns(&mut self, _columns: &[&str]) -> usize {
            0
        }
        async fn save_row(&mut self, index: usize, row: &Event) -> bool {
            self.rows[index] = row.clone();
            self.saved.push(index);
            true
        }
        fn pause_autosave(&mut self) {
            self.paused = true;
        }
        async fn resume_autosave(&mut self, flush: bool) -> Result<(), StoreError> {
            self.paused = false;
            if flush {
                self.flushes.push(self.saved.len());
            }
            Ok(())
        }
    }

    /// Scripted world for one test.
    #[derive(Default)]
    struct World {
        fetch: HashMap<String, FetchOutcome>,
        browse: HashMap<String, String>,
        browser_closed: bool,
        mismatches: Vec<String>,
        decode: HashMap<String, String>,
        decoder_cooldown: Duration,
        aggregator: Vec<Candidate>,
        external: Option<Vec<Candidate>>,
        mode: Option<VerifyMode>,
    }

    fn settings(mode: VerifyMode) -> Settings {
        let mut s = Settings::default();
        s.verify.mode = mode;
        s.pacing.url_decode = PaceSettings::fixed(0);
        s.pacing.verify = PaceSettings::fixed(0);
        s.pacing.aggregator_search = PaceSettings::fixed(0);
        s.pipeline.decode_retry_wait_secs = 0;
        s
    }

    fn build(world: World, dir: &TempDir) -> (Pipeline, Rc<Calls>) {
        let calls = Rc::new(Calls::default());
        let settings = settings(world.mode.unwrap_or(VerifyMode::Always));
        let deps = Collaborators {
            fetcher: Box::new(FakeFetch {
                pages: world.fetch,
                calls: calls.clone(),
            }),
            browser: Box::new(FakeBrowser {
                pages: world.browse,
                closed: world.browser_closed,
                current: RefCell::new(String::new()),
                calls: calls.clone(),
            }),
            verifier: Box::new(FakeVerifier {
                mismatches: world.mismatches,
                calls: calls.clone(),
            }),
            decoder: Box::new(FakeDecoder {
                map: world.decode,
                cooldown: world.decoder_cooldown,
                calls: calls.clone(),
            }),
            aggregator: Box::new(FakeAggregator {
                results: world.aggregator,
                calls: calls.clone(),
            }),
            external: match world.external {
                Some(results) => Box::new(FakeExternal {
                    results,
                    calls: calls.clone(),
                }),
                None => Box::new(NoExternal),
            },
            summarizer: Box::new(FakeSummarizer { calls: calls.clone() }),
        };
        let cache = ContentCache::new(dir.path(), 400, 30_000);
        (Pipeline::new(deps, settings, cache, EventLog::default()), calls)
    }

    fn ok_page(len: usize) -> FetchOutcome {
        FetchOutcome::ok(article_html(len), FetchMethod::Fetch)
    }

    #[tokio::test]
    async fn test_redirect_decoded_fetched_verified_and_cached() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/world/quake-japan";
        let world = World {
            decode: HashMap::from([(GN_URL.to_string(), url.to_string())]),
            fetch: HashMap::from([(url.to_string(), ok_page(1200))]),
            ..Default::default()
        };
        let (mut pipeline, calls) = build(world, &dir);
        let mut store = MemStore {
            rows: vec![Event {
                id: "1".into(),
                title_en: TITLE.into(),
                gn_url: GN_URL.into(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let stats = pipeline.run(&mut store).await.unwrap();

        let row = &store.rows[0];
        assert_eq!(stats, RunStats { ok: 1, fail: 0 });
        assert_eq!(row.text.chars().count(), 1200);
        assert_eq!(row.url, url);
        assert_eq!(row.source, "example");
        assert_eq!(row.verify_status, "ok");
        assert_eq!(row.content_method, "fetch");
        assert_eq!(row.title_ru, "Землетрясение в Японии");
        assert_eq!(calls.decoded.get(), 1);
        assert_eq!(*calls.verified.borrow(), vec![url.to_string()]);

        let probe = pipeline.cache.probe(url).await;
        assert!(probe.has_html && probe.has_txt);
    }

    #[tokio::test]
    async fn test_cached_primary_text_skips_gate_in_fallback_mode() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/world/quake-japan";
        let (mut pipeline, calls) = build(
            World {
                mode: Some(VerifyMode::Fallback),
                ..Default::default()
            },
            &dir,
        );
        let mut cached = Event {
            title_en: TITLE.into(),
            ..Default::default()
        };
        pipeline.cache.write(&mut cached, "", &"y".repeat(500), url).await.unwrap();

        let mut store = MemStore {
            rows: vec![Event {
                id: "2".into(),
                title_en: TITLE.into(),
                url: url.into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        pipeline.run(&mut store).await.unwrap();

        let row = &store.rows[0];
        assert_eq!(row.text.chars().count(), 500);
        assert_eq!(row.content_method, "cache");
        assert_eq!(row.verify_status, "ok");
        assert!(calls.verified.borrow().is_empty());
        assert!(calls.fetched.borrow().is_empty());
        assert_eq!(calls.summarized.get(), 1);
    }

    #[tokio::test]
    async fn test_blocked_then_mismatch_moves_to_alternative_without_refetch() {
        let dir = tempdir().unwrap();
        let original = "https://slow-news.com/asia/quake";
        let alternative = "https://reuters.com/world/asia/quake-japan";
        let world = World {
            fetch: HashMap::from([
                (
                    original.to_string(),
                    FetchOutcome::failed(FetchMethod::Fetch, Some(FetchStatus::Http(429))),
                ),
                (alternative.to_string(), ok_page(900)),
            ]),
            browse: HashMap::from([(original.to_string(), article_html(800))]),
            mismatches: vec![original.to_string()],
            aggregator: vec![Candidate {
                source: "Reuters".into(),
                url: alternative.into(),
                title: TITLE.into(),
                origin: CandidateOrigin::Aggregator,
                rank: Some(1),
                ..Default::default()
            }],
            ..Default::default()
        };
        let (mut pipeline, calls) = build(world, &dir);
        let mut store = MemStore {
            rows: vec![Event {
                id: "3".into(),
                title_en: TITLE.into(),
                url: original.into(),
                source: "Slow News".into(),
                ..Default::default()
            }],
            ..Default::default()
        };

        pipeline.run(&mut store).await.unwrap();

        let fetched = calls.fetched.borrow();
        assert_eq!(fetched.iter().filter(|u| *u == original).count(), 1);
        assert_eq!(fetched.iter().filter(|u| *u == alternative).count(), 1);
        assert_eq!(*calls.browsed.borrow(), vec![original.to_string()]);
        assert_eq!(calls.aggregator.get(), 1);

        let row = &store.rows[0];
        assert_eq!(row.text.chars().count(), 900);
        assert_eq!(row.url, original);
        assert_eq!(row.alternative_url, alternative);
        assert_eq!(row.verify_status, "ok");
        assert_eq!(row.content_method, "fetch");
    }

    #[tokio::test]
    async fn test_decode_bound_candidate_is_deferred_then_retried() {
        let dir = tempdir().unwrap();
        let original = "https://slow-news.com/asia/quake";
        let reuters_gn = "https://news.google.com/rss/articles/CBMireuters";
        let reuters = "https://reuters.com/world/asia/quake-japan";
        let local = "https://gazette.example/quake";
        let world = World {
            fetch: HashMap::from([
                (reuters.to_string(), ok_page(900)),
                (local.to_string(), ok_page(900)),
            ]),
            decode: HashMap::from([(reuters_gn.to_string(), reuters.to_string())]),
            decoder_cooldown: Duration::from_secs(5),
            aggregator: vec![
                Candidate {
                    source: "Reuters".into(),
                    gn_url: reuters_gn.into(),
                    title: TITLE.into(),
                    origin: CandidateOrigin::Aggregator,
                    rank: Some(2),
                    ..Default::default()
                },
                Candidate {
                    source: "Gazette".into(),
                    url: local.into(),
                    title: TITLE.into(),
                    origin: CandidateOrigin::Aggregator,
                    rank: Some(1),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let (mut pipeline, calls) = build(world, &dir);
        let mut store = MemStore {
            rows: vec![Event {
                id: "4".into(),
                title_en: TITLE.into(),
                url: original.into(),
                source: "Slow News".into(),
                ..Default::default()
            }],
            ..Default::default()
        };

        pipeline.run(&mut store).await.unwrap();

        let fetched = calls.fetched.borrow();
        assert!(fetched.iter().any(|u| u == reuters));
        assert!(!fetched.iter().any(|u| u == local));
        assert_eq!(calls.decoded.get(), 1);
        assert_eq!(store.rows[0].text.chars().count(), 900);
        assert_eq!(store.rows[0].gn_url, reuters_gn);
        assert_eq!(store.rows[0].verify_status, "ok");
    }

    #[tokio::test]
    async fn test_cache_mismatch_purges_text_and_fetches_live() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/world/quake-japan";
        let world = World {
            fetch: HashMap::from([(url.to_string(), ok_page(700))]),
            ..Default::default()
        };
        let (mut pipeline, calls) = build(world, &dir);
        let mut stale = Event::default();
        pipeline.cache.write(&mut stale, "", &"z".repeat(600), url).await.unwrap();

        // First verify call (cache) mismatches, the live one matches.
        let verifier_calls = calls.clone();
        pipeline.deps.verifier = Box::new(SequenceVerifier {
            answers: RefCell::new(vec![true, false]),
            calls: verifier_calls,
        });

        let mut store = MemStore {
            rows: vec![Event {
                id: "5".into(),
                title_en: TITLE.into(),
                url: url.into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        pipeline.run(&mut store).await.unwrap();

        let row = &store.rows[0];
        assert_eq!(row.text.chars().count(), 700);
        assert_eq!(row.content_method, "fetch");
        assert_eq!(row.verify_status, "ok");
        assert_eq!(calls.verified.borrow().len(), 2);
    }

    struct SequenceVerifier {
        /// Popped from the back.
        answers: RefCell<Vec<bool>>,
        calls: Rc<Calls>,
    }

    #[async_trait(?Send)]
    impl Verifier for SequenceVerifier {
        async fn verify(&self, _original: &VerifyContext, candidate: VerifyCandidate<'_>) -> VerifyOutcome {
            self.calls.verified.borrow_mut().push(candidate.url.to_string());
            let matched = self.answers.borrow_mut().pop().unwrap_or(true);
            VerifyOutcome::from_verdict(
                Verdict {
                    matched,
                    confidence: 0.9,
                    ..Default::default()
                },
                0.7,
                200,
                false,
            )
        }
    }

    #[tokio::test]
    async fn test_exhausted_event_is_saved_as_failure() {
        let dir = tempdir().unwrap();
        let (mut pipeline, calls) = build(World::default(), &dir);
        let mut store = MemStore {
            rows: vec![
                Event {
                    id: "6".into(),
                    title_en: TITLE.into(),
                    url: "https://gone.example/story".into(),
                    ..Default::default()
                },
                Event {
                    id: "7".into(),
                    verify_status: "ok".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let stats = pipeline.run(&mut store).await.unwrap();

        assert_eq!(stats, RunStats { ok: 0, fail: 1 });
        assert_eq!(store.saved, vec![0]);
        assert!(!store.paused);
        assert_eq!(store.flushes, vec![1]);
        assert_eq!(store.rows[0].verify_status, "");
        assert!(store.rows[0].text.is_empty());
        assert_eq!(calls.summarized.get(), 0);
        assert_eq!(
            calls.fetched.borrow().len(),
            pipeline.settings.pipeline.fetch_attempts as usize
        );
    }

    #[tokio::test]
    async fn test_closed_browser_aborts_run() {
        let dir = tempdir().unwrap();
        let world = World {
            browser_closed: true,
            ..Default::default()
        };
        let (mut pipeline, _calls) = build(world, &dir);
        let mut store = MemStore {
            rows: vec![
                Event {
                    id: "8".into(),
                    title_en: TITLE.into(),
                    url: "https://gone.example/story".into(),
                    ..Default::default()
                },
                Event {
                    id: "9".into(),
                    title_en: TITLE.into(),
                    url: "https://other.example/story".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let result = pipeline.run(&mut store).await;

        assert!(matches!(result, Err(PipelineError::BrowserClosed)));
        assert!(store.saved.is_empty());
        assert!(!store.paused);
        assert_eq!(store.flushes, vec![0]);
    }

    #[tokio::test]
    async fn test_row_text_is_gated_and_purged_on_mismatch() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/world/quake-japan";
        let (mut pipeline, calls) = build(
            World {
                mismatches: vec![url.to_string()],
                ..Default::default()
            },
            &dir,
        );
        let mut cached = Event {
            title_en: TITLE.into(),
            ..Default::default()
        };
        pipeline.cache.write(&mut cached, "", &"y".repeat(600), url).await.unwrap();

        let mut store = MemStore {
            rows: vec![Event {
                id: "10".into(),
                title_en: TITLE.into(),
                url: url.into(),
                source: "example".into(),
                text: "unrelated football report ".repeat(40),
                ..Default::default()
            }],
            ..Default::default()
        };
        let stats = pipeline.run(&mut store).await.unwrap();

        let row = &store.rows[0];
        assert_eq!(*calls.verified.borrow(), vec![url.to_string()]);
        assert_eq!(stats, RunStats { ok: 0, fail: 1 });
        assert_eq!(row.verify_status, "mismatch");
        assert!(row.text.is_empty());
        assert!(!row.is_done());
    }

    #[tokio::test]
    async fn test_row_text_without_cache_files_is_still_gated() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/world/quake-japan";
        let (mut pipeline, calls) = build(World::default(), &dir);
        let mut store = MemStore {
            rows: vec![Event {
                id: "11".into(),
                title_en: TITLE.into(),
                url: url.into(),
                source: "example".into(),
                text: "Rescuers searched the coast after the quake. ".repeat(20),
                summary: "Землетрясение.".into(),
                title_ru: "Землетрясение в Японии".into(),
                topic: "disaster".into(),
                priority: "2".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let stats = pipeline.run(&mut store).await.unwrap();

        assert_eq!(*calls.verified.borrow(), vec![url.to_string()]);
        assert_eq!(stats, RunStats { ok: 1, fail: 0 });
        assert_eq!(store.rows[0].verify_status, "ok");
        assert!(calls.fetched.borrow().is_empty());
        assert_eq!(calls.summarized.get(), 0);
    }

    #[tokio::test]
    async fn test_mismatch_returns_early_when_browse_on_mismatch_is_off() {
        let dir = tempdir().unwrap();
        let url = "https://slow-news.com/asia/quake";
        let world = World {
            fetch: HashMap::from([(url.to_string(), ok_page(900))]),
            browse: HashMap::from([(url.to_string(), article_html(900))]),
            mismatches: vec![url.to_string()],
            ..Default::default()
        };
        let (mut pipeline, calls) = build(world, &dir);
        pipeline.settings.pipeline.browse_on_mismatch = false;
        let mut store = MemStore {
            rows: vec![Event {
                id: "12".into(),
                title_en: TITLE.into(),
                url: url.into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        pipeline.run(&mut store).await.unwrap();

        assert_eq!(*calls.fetched.borrow(), vec![url.to_string()]);
        assert!(calls.browsed.borrow().is_empty());
        assert_eq!(store.rows[0].verify_status, "mismatch");
    }

    #[tokio::test]
    async fn test_short_mode_gates_only_short_text() {
        let dir = tempdir().unwrap();
        let short = "https://example.com/world/quake-brief";
        let long = "https://example.com/world/quake-feature";
        let world = World {
            fetch: HashMap::from([(short.to_string(), ok_page(800)), (long.to_string(), ok_page(2_000))]),
            mode: Some(VerifyMode::Short),
            ..Default::default()
        };
        let (mut pipeline, calls) = build(world, &dir);
        let row = |id: &str, url: &str| Event {
            id: id.into(),
            title_en: TITLE.into(),
            url: url.into(),
            ..Default::default()
        };
        let mut store = MemStore {
            rows: vec![row("13", short), row("14", long)],
            ..Default::default()
        };
        let stats = pipeline.run(&mut store).await.unwrap();

        assert_eq!(*calls.verified.borrow(), vec![short.to_string()]);
        assert_eq!(stats, RunStats { ok: 2, fail: 0 });
        assert_eq!(store.rows[1].text.chars().count(), 2_000);
    }

    async fn run_with_failing_gate(fail_open: bool) -> (MemStore, Rc<Calls>) {
        let dir = tempdir().unwrap();
        let url = "https://example.com/world/quake-japan";
        let world = World {
            fetch: HashMap::from([(url.to_string(), ok_page(1_200))]),
            ..Default::default()
        };
        let (mut pipeline, calls) = build(world, &dir);
        pipeline.deps.verifier = Box::new(FailingVerifier {
            fail_open,
            calls: calls.clone(),
        });
        let mut store = MemStore {
            rows: vec![Event {
                id: "15".into(),
                title_en: TITLE.into(),
                url: url.into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        pipeline.run(&mut store).await.unwrap();
        (store, calls)
    }

    #[tokio::test]
    async fn test_fail_open_keeps_text_as_unverified() {
        let (store, calls) = run_with_failing_gate(true).await;
        let row = &store.rows[0];
        assert_eq!(calls.verified.borrow().len(), 1);
        assert_eq!(row.text.chars().count(), 1_200);
        assert_eq!(row.verify_status, "unverified");
        assert!(!row.is_done());
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_text() {
        let (store, calls) = run_with_failing_gate(false).await;
        let row = &store.rows[0];
        assert!(calls.verified.borrow().len() >= 1);
        assert!(row.text.is_empty());
        assert_eq!(row.verify_status, "error");
        assert_eq!(calls.summarized.get(), 0);
    }

    #[tokio::test]
    async fn test_external_search_supplies_alternative() {
        let dir = tempdir().unwrap();
        let original = "https://gone.example/asia/quake-japan-coast";
        let ap = "https://apnews.com/article/quake-japan";
        let world = World {
            fetch: HashMap::from([(ap.to_string(), ok_page(900))]),
            external: Some(vec![Candidate {
                source: "AP".into(),
                url: ap.into(),
                title: TITLE.into(),
                origin: CandidateOrigin::External("serper".into()),
                rank: Some(1),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let (mut pipeline, calls) = build(world, &dir);
        let mut store = MemStore {
            rows: vec![Event {
                id: "16".into(),
                title_en: TITLE.into(),
                url: original.into(),
                source: "Gone".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let stats = pipeline.run(&mut store).await.unwrap();

        assert_eq!(calls.aggregator.get(), 1);
        assert!(!calls.external.borrow().is_empty());
        assert!(calls.fetched.borrow().iter().any(|u| u == ap));
        let row = &store.rows[0];
        assert_eq!(stats, RunStats { ok: 1, fail: 0 });
        assert_eq!(row.text.chars().count(), 900);
        assert_eq!(row.alternative_url, ap);
    }

    #[tokio::test]
    async fn test_rows_saved_before_abort_are_flushed() {
        let dir = tempdir().unwrap();
        let cached_url = "https://example.com/world/quake-japan";
        let (mut pipeline, _calls) = build(
            World {
                browser_closed: true,
                ..Default::default()
            },
            &dir,
        );
        let mut cached = Event {
            title_en: TITLE.into(),
            ..Default::default()
        };
        pipeline.cache.write(&mut cached, "", &"y".repeat(600), cached_url).await.unwrap();
        let mut store = MemStore {
            rows: vec![
                Event {
                    id: "17".into(),
                    title_en: TITLE.into(),
                    url: cached_url.into(),
                    ..Default::default()
                },
                Event {
                    id: "18".into(),
                    title_en: TITLE.into(),
                    url: "https://gone.example/story".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let result = pipeline.run(&mut store).await;

        assert!(matches!(result, Err(PipelineError::BrowserClosed)));
        assert_eq!(store.saved, vec![0]);
        assert_eq!(store.flushes, vec![1]);
        assert!(!store.paused);
    }

    #[test]
    fn test_normalize_moves_aggregator_link() {
        let mut event = Event {
            url: format!(" {GN_URL} "),
            ..Default::default()
        };
        normalize(&mut event);
        assert!(event.url.is_empty());
        assert_eq!(event.gn_url, GN_URL);
    }

    #[test]
    fn test_candidates_from_row_reads_json_column() {
        let mut event = Event::default();
        event.extra.insert(
            ALTERNATIVES_COLUMN.into(),
            json!(r#"[{"source":"AP","url":"https://apnews.com/x","origin":"aggregator","rank":1}]"#),
        );
        let pool = candidates_from_row(&event);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].origin, CandidateOrigin::Aggregator);

        event.extra.insert(ALTERNATIVES_COLUMN.into(), json!("not json"));
        assert!(candidates_from_row(&event).is_empty());
    }
}
