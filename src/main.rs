//! # News Grinder
//!
//! Fills news-event rows with verified article text and an AI summary.
//!
//! ## Features
//!
//! - Content cache keyed by tracking-stripped URL, with a `host/slug` alias index
//! - Direct fetch with an alternate renderer, then a browser fetch that tries
//!   an archive mirror before the live page
//! - An LLM same-event check on every piece of retrieved text
//! - Alternative outlets from the news aggregator and an optional external
//!   news search, ranked by outlet authority
//! - Per-dependency pacing and per-domain cooldowns
//!
//! ## Usage
//!
//! ```sh
//! news_grinder --rows ./rows.json --cache-dir ./articles -c config.yaml
//! ```
//!
//! ## Architecture
//!
//! One event at a time:
//! 1. **Cache**: reuse text fetched by an earlier run
//! 2. **Retrieval**: direct fetch, then browser fetch, each result verified
//! 3. **Fallback**: alternative sources, then external search
//! 4. **Summary**: summarize accepted text and write the row back

use clap::Parser;
use reqwest::Client;
use std::error::Error;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod alternatives;
mod api;
mod browse;
mod cache;
mod cli;
mod config;
mod error;
mod extract;
mod fetch;
mod meta;
mod models;
mod pacing;
mod pipeline;
mod search;
mod store;
mod summarize;
mod trace;
mod utils;
mod verify;

use api::{OpenAiClient, RetryAsk};
use browse::PageDriver;
use cache::ContentCache;
use cli::Cli;
use config::Settings;
use fetch::HttpFetcher;
use pipeline::{Collaborators, Pipeline};
use search::{GoogleNewsRss, RedirectDecoder, SerperSearch};
use store::JsonRowStore;
use summarize::{LlmSummarizer, summary_schema};
use trace::EventLog;
use utils::ensure_writable_dir;
use verify::{LlmVerifier, verdict_schema};

const LLM_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

#[cfg(feature = "chromium")]
async fn page_driver(settings: &Settings) -> Box<dyn PageDriver> {
    match browse::ChromiumDriver::launch(settings.browse.headless).await {
        Ok(driver) => Box::new(driver),
        Err(e) => {
            error!(error = %e, "Chromium failed to start; browser fetch disabled");
            Box::new(browse::DisabledBrowser)
        }
    }
}

#[cfg(not(feature = "chromium"))]
async fn page_driver(_settings: &Settings) -> Box<dyn PageDriver> {
    info!("Built without the chromium feature; browser fetch disabled");
    Box::new(browse::DisabledBrowser)
}

#[tokio::main(flavor = "current_thread")]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("news_grinder starting up");

    let args = Cli::parse();
    debug!(rows = %args.rows, cache_dir = %args.cache_dir, config = ?args.config, "Parsed CLI arguments");

    let mut settings = match &args.config {
        Some(path) => Settings::load(Path::new(path))?,
        None => Settings::default(),
    };
    if let Some(mode) = args.verify_mode {
        settings.verify.mode = mode;
    }
    info!(verify_mode = ?settings.verify.mode, min_text_length = settings.pipeline.min_text_length, "Settings ready");

    // Early check: the cache directory must be writable
    let cache_dir = Path::new(&args.cache_dir);
    if let Err(e) = ensure_writable_dir(cache_dir).await {
        error!(
            path = %args.cache_dir,
            error = %e,
            "Cache directory is not writable (fix perms or choose a different path)"
        );
        return Err(e.into());
    }

    let mut store = JsonRowStore::open(&args.rows).await?;
    let event_log = EventLog::open(args.event_log.as_deref().map(Path::new)).await?;

    let llm_http = Client::builder()
        .timeout(Duration::from_secs(settings.llm.request_timeout_secs))
        .build()?;
    let http = Client::builder()
        .user_agent(settings.fetch.user_agent.clone())
        .timeout(Duration::from_millis(settings.fetch.timeout_ms))
        .build()?;

    let verify_client = OpenAiClient::new(
        llm_http.clone(),
        &args.openai_api_url,
        args.openai_api_key.clone(),
        &settings.verify.model,
        settings.verify.temperature,
    )
    .with_schema(verdict_schema())
    .with_web_search(settings.verify.use_search);
    let summarize_client = OpenAiClient::new(
        llm_http,
        &args.openai_api_url,
        args.openai_api_key.clone(),
        &settings.llm.summarize_model,
        settings.llm.summarize_temperature,
    )
    .with_schema(summary_schema());

    let deps = Collaborators {
        fetcher: Box::new(HttpFetcher::new(&settings.fetch)?),
        browser: page_driver(&settings).await,
        verifier: Box::new(LlmVerifier::new(
            RetryAsk::new(verify_client, settings.llm.max_retries, LLM_RETRY_BASE_DELAY),
            settings.verify.clone(),
        )),
        decoder: Box::new(RedirectDecoder::new(http.clone())),
        aggregator: Box::new(GoogleNewsRss::new(http.clone())),
        external: Box::new(SerperSearch::new(
            http,
            args.search_api_key.clone(),
            settings.external_search.clone(),
        )),
        summarizer: Box::new(LlmSummarizer::new(
            RetryAsk::new(summarize_client, settings.llm.max_retries, LLM_RETRY_BASE_DELAY),
            &settings.llm.target_language,
            Duration::from_millis(settings.pacing.summarize.delay_ms),
        )),
    };

    let cache = ContentCache::new(
        cache_dir,
        settings.pipeline.min_text_length,
        settings.pipeline.max_text_chars,
    );
    let mut pipeline = Pipeline::new(deps, settings, cache, event_log);

    let result = pipeline.run(&mut store).await;
    pipeline.shutdown().await;
    let stats = result?;

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        ok = stats.ok,
        fail = stats.fail,
        "Execution complete"
    );

    Ok(())
}
