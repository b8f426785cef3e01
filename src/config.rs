//! Run settings loaded from `config.yaml`.
//!
//! Every field has a default, so an empty file (or no file at all) gives a
//! working configuration. Durations are written in seconds or milliseconds as
//! the field name says.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pipeline: PipelineSettings,
    pub verify: VerifySettings,
    pub alternatives: AlternativeSettings,
    pub pacing: PacingSettings,
    pub browse: BrowseSettings,
    pub fetch: FetchSettings,
    pub llm: LlmSettings,
    pub external_search: ExternalSearchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Shorter text is treated as no text at all.
    pub min_text_length: usize,
    /// Stored and cached text is cut to this many characters.
    pub max_text_chars: usize,
    /// Above this size HTML is flattened with the fast tag stripper.
    pub max_html_to_text_chars: usize,
    /// Outer retrieval attempts per URL.
    pub fetch_attempts: u32,
    /// Run the browser after a direct fetch failed verification.
    pub browse_on_mismatch: bool,
    pub decode_retries: u32,
    pub decode_retry_wait_secs: u64,
    pub fail_summary_limit: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_text_length: 400,
            max_text_chars: 30_000,
            max_html_to_text_chars: 4_000_000,
            fetch_attempts: 2,
            browse_on_mismatch: true,
            decode_retries: 1,
            decode_retry_wait_secs: 300,
            fail_summary_limit: 20,
        }
    }
}

/// When the verification gate calls the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    Always,
    /// Only text taken from an alternative source.
    #[default]
    Fallback,
    /// Only text shorter than `short_threshold`.
    Short,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifySettings {
    pub mode: VerifyMode,
    pub min_confidence: f64,
    pub short_threshold: usize,
    pub fail_open: bool,
    pub model: String,
    pub temperature: f64,
    pub use_search: bool,
    pub max_chars: usize,
    pub context_max_chars: usize,
    pub fallback_max_chars: usize,
    pub fallback_context_max_chars: usize,
    pub summary_max_chars: usize,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            mode: VerifyMode::Fallback,
            min_confidence: 0.7,
            short_threshold: 1_500,
            fail_open: true,
            model: "gpt-4.1-mini".to_string(),
            temperature: 0.0,
            use_search: false,
            max_chars: 12_000,
            context_max_chars: 4_000,
            fallback_max_chars: 4_000,
            fallback_context_max_chars: 1_500,
            summary_max_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlternativeSettings {
    pub min_agency_level: i32,
    /// Zero disables the date window.
    pub date_window_days: i64,
    /// Outlet authority by normalised source name; merged over the built-in table.
    pub authority: BTreeMap<String, i32>,
}

impl Default for AlternativeSettings {
    fn default() -> Self {
        Self {
            min_agency_level: 0,
            date_window_days: 3,
            authority: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PaceSettings {
    pub delay_ms: u64,
    pub increment_ms: u64,
    /// Zero means uncapped.
    pub max_ms: u64,
}

impl PaceSettings {
    pub const fn fixed(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            increment_ms: 0,
            max_ms: 0,
        }
    }
}

impl Default for PaceSettings {
    fn default() -> Self {
        Self::fixed(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingSettings {
    pub url_decode: PaceSettings,
    pub verify: PaceSettings,
    pub aggregator_search: PaceSettings,
    pub summarize: PaceSettings,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            url_decode: PaceSettings {
                delay_ms: 30_000,
                increment_ms: 1_000,
                max_ms: 60_000,
            },
            verify: PaceSettings::fixed(1_000),
            aggregator_search: PaceSettings::fixed(1_000),
            summarize: PaceSettings::fixed(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowseSettings {
    pub navigation_timeout_ms: u64,
    pub network_idle_timeout_ms: u64,
    pub captcha_cooldown_secs: u64,
    pub timeout_cooldown_secs: u64,
    pub archive_base: String,
    /// Hosts never looked up on the archive mirror.
    pub archive_skip_hosts: Vec<String>,
    pub headless: bool,
}

impl Default for BrowseSettings {
    fn default() -> Self {
        Self {
            navigation_timeout_ms: 10_000,
            network_idle_timeout_ms: 10_000,
            captcha_cooldown_secs: 600,
            timeout_cooldown_secs: 120,
            archive_base: "https://archive.ph".to_string(),
            archive_skip_hosts: vec![
                "apnews.com".to_string(),
                "bbc.com".to_string(),
                "bbc.co.uk".to_string(),
                "aljazeera.com".to_string(),
            ],
            headless: true,
        }
    }
}

impl BrowseSettings {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn network_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.network_idle_timeout_ms)
    }

    pub fn captcha_cooldown(&self) -> Duration {
        Duration::from_secs(self.captcha_cooldown_secs)
    }

    pub fn timeout_cooldown(&self) -> Duration {
        Duration::from_secs(self.timeout_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_ms: u64,
    pub user_agent: String,
    /// Alternate renderer used when the direct request yields nothing; empty disables it.
    pub jina_base: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36".to_string(),
            jina_base: "https://r.jina.ai/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub summarize_model: String,
    pub summarize_temperature: f64,
    /// Target language of `titleRu` and `summary`.
    pub target_language: String,
    pub max_retries: usize,
    pub request_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            summarize_model: "gpt-4.1-mini".to_string(),
            summarize_temperature: 0.2,
            target_language: "Russian".to_string(),
            max_retries: 5,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalSearchSettings {
    pub enabled: bool,
    pub endpoint: String,
    pub max_results: usize,
    pub max_queries: usize,
}

impl Default for ExternalSearchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://google.serper.dev/news".to_string(),
            max_results: 10,
            max_queries: 3,
        }
    }
}

impl Settings {
    /// Load settings from a YAML file.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        let settings = Self::from_yaml(&raw)?;
        info!("Loaded configuration");
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, PipelineError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| PipelineError::Config(e.to_string()))
    }
}
