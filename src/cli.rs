//! Command-line interface for News Grinder.
//!
//! Secrets and endpoints can come from the environment; everything else is
//! either a flag here or a field in `config.yaml`.

use crate::config::VerifyMode;
use clap::Parser;

/// Command-line arguments.
///
/// # Examples
///
/// ```sh
/// # Process rows.json with the default settings
/// news_grinder --rows ./rows.json
///
/// # Custom cache directory, settings file and JSON-lines event log
/// news_grinder --rows ./rows.json --cache-dir ./articles -c config.yaml --event-log events.jsonl
///
/// # Verify every retrieved article
/// news_grinder --rows ./rows.json --verify-mode always
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// JSON file holding the event rows
    #[arg(short, long)]
    pub rows: String,

    /// Directory of cached article HTML and text
    #[arg(long, default_value = "articles")]
    pub cache_dir: String,

    /// Optional path to config.yaml file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Append per-event records to this JSON-lines file
    #[arg(long)]
    pub event_log: Option<String>,

    /// Override `verify.mode` from the config file
    #[arg(long, value_enum)]
    pub verify_mode: Option<VerifyMode>,

    /// API key for the OpenAI-compatible endpoint
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint
    #[arg(long, env = "OPENAI_API_URL", default_value = "https://api.openai.com/v1")]
    pub openai_api_url: String,

    /// API key for the external news search
    #[arg(long, env = "SEARCH_API_KEY", hide_env_values = true)]
    pub search_api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["news_grinder", "--rows", "./rows.json"]);

        assert_eq!(cli.rows, "./rows.json");
        assert_eq!(cli.cache_dir, "articles");
        assert!(cli.config.is_none());
        assert!(cli.verify_mode.is_none());
    }

    #[test]
    fn test_cli_short_flags_and_overrides() {
        let cli = Cli::parse_from([
            "news_grinder",
            "-r",
            "/tmp/rows.json",
            "-c",
            "/tmp/config.yaml",
            "--verify-mode",
            "never",
            "--openai-api-url",
            "http://localhost:8080/v1",
        ]);

        assert_eq!(cli.rows, "/tmp/rows.json");
        assert_eq!(cli.config.as_deref(), Some("/tmp/config.yaml"));
        assert_eq!(cli.verify_mode, Some(VerifyMode::Never));
        assert_eq!(cli.openai_api_url, "http://localhost:8080/v1");
    }
}
