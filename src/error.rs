//! Error types for each layer.
//!
//! Only [`PipelineError::BrowserClosed`] is allowed to escape the per-event
//! loop; every other failure is turned into an outcome value where it happens.

use thiserror::Error;

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("browser window closed")]
    BrowserClosed,

    #[error("row store: {0}")]
    Store(#[from] StoreError),

    #[error("config: {0}")]
    Config(String),
}

/// Errors raised by a browser-driven fetch.
#[derive(Debug, Error)]
pub enum BrowseError {
    /// The browser went away; fatal for the whole run.
    #[error("browser window closed")]
    BrowserClosed,

    #[error("captcha on {host}")]
    Captcha { host: String },

    #[error("navigation timeout on {host}")]
    Timeout { host: String },

    #[error("browse failed: {0}")]
    Failed(String),
}

/// Errors from the page driver collaborator.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("browser window closed")]
    Closed,

    #[error("timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

/// Errors from an LLM endpoint.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("llm transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("llm response had no output text")]
    EmptyResponse,

    #[error("llm response was not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("llm not configured: {0}")]
    NotConfigured(&'static str),
}

impl LlmError {
    /// Whether the provider rejected the request because it was too large.
    pub fn is_length_error(&self) -> bool {
        is_length_message(&self.to_string())
    }
}

/// Context-window and token-budget errors worded the way common providers word them.
pub fn is_length_message(message: &str) -> bool {
    let m = message.to_lowercase();
    ["context", "token", "too long", "maximum", "input size", "max_tokens"]
        .iter()
        .any(|needle| m.contains(needle))
}

/// Errors from the row store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rows file {path} is not a json array of objects: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("row index {0} out of range")]
    OutOfRange(usize),
}
