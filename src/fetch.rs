//! Direct page fetch.
//!
//! The pipeline only sees the [`DirectFetch`] trait and the tagged
//! [`FetchOutcome`] it returns. [`HttpFetcher`] is the production
//! implementation: a plain GET, then the alternate renderer when the plain
//! request yields nothing.

use crate::config::FetchSettings;
use crate::extract::looks_like_captcha;
use async_trait::async_trait;
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Which path produced (or failed to produce) the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    Fetch,
    Jina,
    Captcha,
    Timeout,
    Failed,
}

impl FetchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMethod::Fetch => "fetch",
            FetchMethod::Jina => "jina",
            FetchMethod::Captcha => "captcha",
            FetchMethod::Timeout => "timeout",
            FetchMethod::Failed => "failed",
        }
    }
}

impl fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last status seen while fetching, used to classify failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Http(u16),
    Timeout,
    Captcha,
}

impl FetchStatus {
    /// Blocked responses are not retried with the same method in the same attempt.
    pub fn is_blocked(&self) -> bool {
        matches!(self, FetchStatus::Http(429 | 403 | 503) | FetchStatus::Captcha)
    }

    /// Label used in logs and in the event's last status.
    pub fn label(&self) -> &'static str {
        match self {
            FetchStatus::Http(429) => "rate_limited",
            FetchStatus::Http(403) => "forbidden",
            FetchStatus::Http(503) => "unavailable",
            FetchStatus::Http(504) => "504",
            FetchStatus::Http(_) => "http_error",
            FetchStatus::Timeout => "timeout",
            FetchStatus::Captcha => "captcha",
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStatus::Http(code) => write!(f, "{code}"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub html: Option<String>,
    pub method: FetchMethod,
    pub status: Option<FetchStatus>,
}

impl FetchOutcome {
    pub fn ok(html: String, method: FetchMethod) -> Self {
        Self {
            html: Some(html),
            method,
            status: Some(FetchStatus::Http(200)),
        }
    }

    pub fn failed(method: FetchMethod, status: Option<FetchStatus>) -> Self {
        Self {
            html: None,
            method,
            status,
        }
    }
}

#[async_trait(?Send)]
pub trait DirectFetch {
    async fn fetch(&self, url: &str) -> FetchOutcome;
}

/// reqwest-backed fetcher with the `r.jina.ai` renderer as second chance.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    jina_base: String,
}

enum Attempt {
    Body(String),
    Failed(FetchStatus),
    Error,
}

impl HttpFetcher {
    pub fn new(settings: &FetchSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            jina_base: settings.jina_base.clone(),
        })
    }

    async fn get(&self, url: &str) -> Attempt {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Attempt::Failed(FetchStatus::Timeout),
            Err(e) => {
                debug!(error = %e, %url, "GET failed");
                return Attempt::Error;
            }
        };
        let status = response.status();
        if !status.is_success() {
            return Attempt::Failed(FetchStatus::Http(status.as_u16()));
        }
        match response.text().await {
            Ok(body) if !body.trim().is_empty() => Attempt::Body(body),
            Ok(_) => Attempt::Error,
            Err(e) if e.is_timeout() => Attempt::Failed(FetchStatus::Timeout),
            Err(_) => Attempt::Error,
        }
    }
}

#[async_trait(?Send)]
impl DirectFetch for HttpFetcher {
    #[instrument(level = "info", skip_all, fields(%url))]
    async fn fetch(&self, url: &str) -> FetchOutcome {
        let mut last_status = None;
        let mut method = FetchMethod::Failed;
        match self.get(url).await {
            Attempt::Body(body) => {
                if !looks_like_captcha(&body) {
                    return FetchOutcome::ok(body, FetchMethod::Fetch);
                }
                last_status = Some(FetchStatus::Captcha);
                method = FetchMethod::Captcha;
            }
            Attempt::Failed(status) => {
                if status == FetchStatus::Timeout {
                    method = FetchMethod::Timeout;
                }
                last_status = Some(status);
            }
            Attempt::Error => {}
        }

        if !self.jina_base.is_empty() {
            let proxied = format!("{}{}", self.jina_base, url);
            if let Attempt::Body(body) = self.get(&proxied).await {
                debug!(bytes = body.len(), "Alternate renderer returned content");
                return FetchOutcome::ok(body, FetchMethod::Jina);
            }
        }

        warn!(status = ?last_status, %method, "Direct fetch produced no content");
        FetchOutcome::failed(method, last_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CAPTCHA_PAGE: &str = r#"<html><body><div id="px-captcha"></div>Press & Hold</body></html>"#;
    const ARTICLE_PAGE: &str = "<html><body><article><p>Quake hits Japan.</p></article></body></html>";

    fn fetcher(jina_base: String) -> HttpFetcher {
        HttpFetcher::new(&FetchSettings {
            jina_base,
            ..Default::default()
        })
        .unwrap()
    }

    async fn serve(server: &MockServer, route: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(response)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_plain_fetch_returns_page() {
        let server = MockServer::start().await;
        serve(&server, "/story", ResponseTemplate::new(200).set_body_string(ARTICLE_PAGE)).await;

        let out = fetcher(String::new()).fetch(&format!("{}/story", server.uri())).await;
        assert_eq!(out, FetchOutcome::ok(ARTICLE_PAGE.to_string(), FetchMethod::Fetch));
    }

    #[tokio::test]
    async fn test_blocking_statuses_are_reported() {
        let server = MockServer::start().await;
        serve(&server, "/limited", ResponseTemplate::new(429)).await;
        serve(&server, "/forbidden", ResponseTemplate::new(403)).await;
        serve(&server, "/down", ResponseTemplate::new(503)).await;
        let fetcher = fetcher(String::new());

        for (route, code) in [("/limited", 429), ("/forbidden", 403), ("/down", 503)] {
            let out = fetcher.fetch(&format!("{}{route}", server.uri())).await;
            assert!(out.html.is_none());
            assert_eq!(out.method, FetchMethod::Failed);
            assert_eq!(out.status, Some(FetchStatus::Http(code)));
            assert!(out.status.unwrap().is_blocked());
        }
    }

    #[tokio::test]
    async fn test_captcha_body_is_not_content() {
        let server = MockServer::start().await;
        serve(&server, "/wall", ResponseTemplate::new(200).set_body_string(CAPTCHA_PAGE)).await;

        let out = fetcher(String::new()).fetch(&format!("{}/wall", server.uri())).await;
        assert_eq!(out, FetchOutcome::failed(FetchMethod::Captcha, Some(FetchStatus::Captcha)));
    }

    #[tokio::test]
    async fn test_alternate_renderer_is_second_chance() {
        let server = MockServer::start().await;
        serve(&server, "/forbidden", ResponseTemplate::new(403)).await;
        Mock::given(method("GET"))
            .and(path_regex("^/jina/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Quake hits Japan. Rescuers search the coast."))
            .expect(1)
            .mount(&server)
            .await;

        let out = fetcher(format!("{}/jina/", server.uri()))
            .fetch(&format!("{}/forbidden", server.uri()))
            .await;
        assert_eq!(out.method, FetchMethod::Jina);
        assert_eq!(out.html.as_deref(), Some("Quake hits Japan. Rescuers search the coast."));
    }

    #[tokio::test]
    async fn test_renderer_failure_keeps_first_status() {
        let server = MockServer::start().await;
        serve(&server, "/limited", ResponseTemplate::new(429)).await;
        Mock::given(method("GET"))
            .and(path_regex("^/jina/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let out = fetcher(format!("{}/jina/", server.uri()))
            .fetch(&format!("{}/limited", server.uri()))
            .await;
        assert_eq!(out, FetchOutcome::failed(FetchMethod::Failed, Some(FetchStatus::Http(429))));
    }

    #[test]
    fn test_blocked_statuses() {
        assert!(FetchStatus::Http(429).is_blocked());
        assert!(FetchStatus::Http(403).is_blocked());
        assert!(FetchStatus::Http(503).is_blocked());
        assert!(FetchStatus::Captcha.is_blocked());
        assert!(!FetchStatus::Http(504).is_blocked());
        assert!(!FetchStatus::Timeout.is_blocked());
        assert!(!FetchStatus::Http(404).is_blocked());
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(FetchStatus::Http(429).label(), "rate_limited");
        assert_eq!(FetchStatus::Http(403).label(), "forbidden");
        assert_eq!(FetchStatus::Http(504).to_string(), "504");
        assert_eq!(FetchStatus::Captcha.to_string(), "captcha");
    }

    #[test]
    fn test_outcome_constructors() {
        let ok = FetchOutcome::ok("<p>x</p>".into(), FetchMethod::Jina);
        assert_eq!(ok.method, FetchMethod::Jina);
        assert_eq!(ok.status, Some(FetchStatus::Http(200)));
        let failed = FetchOutcome::failed(FetchMethod::Timeout, Some(FetchStatus::Timeout));
        assert!(failed.html.is_none());
    }
}
