//! Browser-driven fetch.
//!
//! [`browse_article`] tries the archive mirror first, then the live page,
//! and returns the body HTML plus page metadata. Captcha and navigation
//! timeouts put the host on a cooldown that later calls respect unless told
//! to ignore it. A closed browser is reported as
//! [`BrowseError::BrowserClosed`] and must end the run.
//!
//! The actual page automation sits behind [`PageDriver`]. Builds with the
//! `chromium` feature get a chromiumoxide-backed driver; other builds use
//! [`DisabledBrowser`], which makes every browse fail without aborting.

use crate::config::BrowseSettings;
use crate::error::{BrowseError, DriverError};
use crate::models::ArticleMeta;
use crate::pacing::DomainCooldowns;
use crate::utils::{format_duration, host_of};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const ARCHIVE_NO_RESULT_MARKERS: &[&str] = &["no results", "no archive", "nothing found", "not in archive"];
const ARCHIVE_VERSION_LINK: &str = ".TEXT-BLOCK > a";
const ARCHIVE_BODY: &str = ".body";

/// Low-level page automation over a single reusable tab.
#[async_trait(?Send)]
pub trait PageDriver {
    /// False when no browser backend exists at all.
    fn available(&self) -> bool {
        true
    }
    fn is_closed(&self) -> bool;
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), DriverError>;
    async fn wait_network_idle(&self, timeout: Duration) -> Result<(), DriverError>;
    async fn detect_captcha(&self) -> bool;
    /// `innerText` of `<body>`.
    async fn body_text(&self) -> Result<String, DriverError>;
    /// `innerHTML` of every element matching `selector`.
    async fn inner_html_all(&self, selector: &str) -> Result<Vec<String>, DriverError>;
    /// Click the first match and wait for the load. `Ok(false)` if nothing matched.
    async fn click_first(&self, selector: &str) -> Result<bool, DriverError>;
    async fn meta(&self) -> Result<ArticleMeta, DriverError>;
    async fn close(&self);
}

/// What a browse produced. Empty `html` means nothing usable (including a
/// skipped call because of an active domain cooldown).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrowsePage {
    pub html: String,
    pub meta: ArticleMeta,
    pub from_archive: bool,
}

fn driver_error(e: DriverError) -> BrowseError {
    match e {
        DriverError::Closed => BrowseError::BrowserClosed,
        DriverError::Timeout => BrowseError::Failed("timeout".to_string()),
        DriverError::Other(msg) => BrowseError::Failed(msg),
    }
}

fn archive_url(base: &str, url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    format!("{}/{}", base.trim_end_matches('/'), without_query)
}

fn skip_archive_for(settings: &BrowseSettings, url: &str) -> bool {
    let Some(host) = host_of(url) else {
        return true;
    };
    settings
        .archive_skip_hosts
        .iter()
        .any(|skip| host == *skip || host.ends_with(&format!(".{skip}")))
}

/// Archive mirror step. `Ok(None)` means the archive had nothing for us.
async fn try_archive(driver: &dyn PageDriver, url: &str, settings: &BrowseSettings) -> Result<Option<String>, BrowseError> {
    let target = archive_url(&settings.archive_base, url);
    debug!(%target, "Browsing archive");
    match driver.goto(&target, settings.navigation_timeout()).await {
        Ok(()) => {}
        Err(DriverError::Closed) => return Err(BrowseError::BrowserClosed),
        Err(e) => {
            warn!(error = %e, "Archive navigation failed; trying source");
            return Ok(None);
        }
    }
    if driver.detect_captcha().await {
        warn!("Captcha on archive; skipping archive");
        return Ok(None);
    }
    let body = driver.body_text().await.map_err(driver_error)?.to_lowercase();
    if ARCHIVE_NO_RESULT_MARKERS.iter().any(|m| body.contains(m)) {
        debug!("Archive has no results; skipping archive");
        return Ok(None);
    }
    if driver.click_first(ARCHIVE_VERSION_LINK).await.map_err(driver_error)? {
        debug!("Opened newest archived version");
    }
    let html = driver.inner_html_all(ARCHIVE_BODY).await.map_err(driver_error)?.join("");
    Ok((!html.trim().is_empty()).then_some(html))
}

/// Live page step; applies the domain cooldowns.
async fn try_source(
    driver: &dyn PageDriver,
    cooldowns: &mut DomainCooldowns,
    url: &str,
    settings: &BrowseSettings,
) -> Result<BrowsePage, BrowseError> {
    let host = host_of(url).unwrap_or_default();
    let on_wait_error = |e: DriverError, cooldowns: &mut DomainCooldowns| -> Result<(), BrowseError> {
        match e {
            DriverError::Closed => Err(BrowseError::BrowserClosed),
            DriverError::Timeout => {
                warn!(%host, "Browse timeout");
                cooldowns.set(url, settings.timeout_cooldown(), "timeout");
                Err(BrowseError::Timeout { host: host.clone() })
            }
            DriverError::Other(msg) => {
                debug!(error = %msg, "Ignoring navigation error");
                Ok(())
            }
        }
    };

    if let Err(e) = driver.goto(url, settings.navigation_timeout()).await {
        on_wait_error(e, cooldowns)?;
    }
    if driver.detect_captcha().await {
        warn!(%host, "Captcha on source");
        cooldowns.set(url, settings.captcha_cooldown(), "captcha");
        return Err(BrowseError::Captcha { host });
    }
    if let Err(e) = driver.wait_network_idle(settings.network_idle_timeout()).await {
        on_wait_error(e, cooldowns)?;
    }
    if driver.detect_captcha().await {
        warn!(%host, "Captcha on source after load");
        cooldowns.set(url, settings.captcha_cooldown(), "captcha");
        return Err(BrowseError::Captcha { host });
    }
    let html = driver.inner_html_all("body").await.map_err(driver_error)?.join("");
    let meta = match driver.meta().await {
        Ok(meta) => meta,
        Err(DriverError::Closed) => return Err(BrowseError::BrowserClosed),
        Err(_) => ArticleMeta::default(),
    };
    Ok(BrowsePage {
        html,
        meta,
        from_archive: false,
    })
}

/// Fetch a page through the browser: archive mirror first, live page second.
///
/// `ignore_cooldown` lets primary (non-fallback) URLs through even when their
/// host is cooling down.
#[instrument(level = "info", skip_all, fields(%url, ignore_cooldown))]
pub async fn browse_article(
    driver: &dyn PageDriver,
    cooldowns: &mut DomainCooldowns,
    url: &str,
    ignore_cooldown: bool,
    settings: &BrowseSettings,
) -> Result<BrowsePage, BrowseError> {
    if !driver.available() {
        return Err(BrowseError::Failed("no browser backend".to_string()));
    }
    if driver.is_closed() {
        return Err(BrowseError::BrowserClosed);
    }

    if !skip_archive_for(settings, url) {
        if let Some(html) = try_archive(driver, url, settings).await? {
            info!(bytes = html.len(), "Archive copy found");
            return Ok(BrowsePage {
                html,
                meta: ArticleMeta::default(),
                from_archive: true,
            });
        }
    }

    if !ignore_cooldown {
        if let Some((left, reason)) = cooldowns.active(url) {
            info!(reason, left = %format_duration(left), "Domain cooldown active; skipping browse");
            return Ok(BrowsePage::default());
        }
    }

    let page = try_source(driver, cooldowns, url, settings).await?;
    info!(bytes = page.html.len(), "Browsed source page");
    Ok(page)
}

/// Driver used when the binary was built without a browser backend.
#[derive(Debug, Default)]
pub struct DisabledBrowser;

#[async_trait(?Send)]
impl PageDriver for DisabledBrowser {
    fn available(&self) -> bool {
        false
    }
    fn is_closed(&self) -> bool {
        false
    }
    async fn goto(&self, _url: &str, _timeout: Duration) -> Result<(), DriverError> {
        Err(DriverError::Other("no browser backend".to_string()))
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
        Ok(Vec::new())
    }
    async fn click_first(&self, _selector: &str) -> Result<bool, DriverError> {
        Ok(false)
    }
    async fn meta(&self) -> Result<ArticleMeta, DriverError> {
        Ok(ArticleMeta::default())
    }
    async fn close(&self) {}
}

#[cfg(feature = "chromium")]
pub use chromium::ChromiumDriver;

#[cfg(feature = "chromium")]
mod chromium {
    use super::PageDriver;
    use crate::error::DriverError;
    use crate::extract::looks_like_captcha;
    use crate::meta::extract_meta;
    use crate::models::ArticleMeta;
    use async_trait::async_trait;
    use chromiumoxide::{Browser, BrowserConfig, Page};
    use futures::StreamExt;
    use std::cell::RefCell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use tracing::{info, warn};

    const IDLE_POLL: Duration = Duration::from_millis(250);
    /// Consecutive quiet polls that count as network idle.
    const IDLE_QUIET_POLLS: u32 = 2;
    const IDLE_PROBE: &str = "[document.readyState === 'complete', performance.getEntriesByType('resource').length]";

    /// Tracks page load state across polls. The page is idle once it has
    /// finished loading and its resource count stayed flat for a few polls.
    #[derive(Debug)]
    struct IdleTracker {
        last_resources: Option<usize>,
        quiet: u32,
    }

    impl IdleTracker {
        fn new() -> Self {
            Self {
                last_resources: None,
                quiet: 0,
            }
        }

        fn observe(&mut self, ready: bool, resources: usize) -> bool {
            if ready && self.last_resources == Some(resources) {
                self.quiet += 1;
            } else {
                self.quiet = 0;
            }
            self.last_resources = Some(resources);
            self.quiet >= IDLE_QUIET_POLLS
        }
    }

    fn cdp_error(e: chromiumoxide::error::CdpError) -> DriverError {
        let msg = e.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("closed") || lower.contains("channel") {
            DriverError::Closed
        } else if lower.contains("timeout") {
            DriverError::Timeout
        } else {
            DriverError::Other(msg)
        }
    }

    /// One Chromium instance with one tab, reused for every browse.
    pub struct ChromiumDriver {
        browser: RefCell<Option<Browser>>,
        page: Page,
        alive: Arc<AtomicBool>,
    }

    impl ChromiumDriver {
        pub async fn launch(headless: bool) -> Result<Self, DriverError> {
            let mut builder = BrowserConfig::builder();
            if !headless {
                builder = builder.with_head();
            }
            let config = builder.build().map_err(DriverError::Other)?;
            let (browser, mut handler) = Browser::launch(config).await.map_err(cdp_error)?;

            let alive = Arc::new(AtomicBool::new(true));
            let alive_signal = alive.clone();
            tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        warn!(error = %e, "Chromium handler error");
                    }
                }
                alive_signal.store(false, Ordering::SeqCst);
                warn!("Chromium event loop exited");
            });

            let page = browser.new_page("about:blank").await.map_err(cdp_error)?;
            info!(headless, "Chromium launched");
            Ok(Self {
                browser: RefCell::new(Some(browser)),
                page,
                alive,
            })
        }

        async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> Result<T, DriverError> {
            self.page
                .evaluate(script)
                .await
                .map_err(cdp_error)?
                .into_value::<T>()
                .map_err(|e| DriverError::Other(e.to_string()))
        }
    }

    #[async_trait(?Send)]
    impl PageDriver for ChromiumDriver {
        fn is_closed(&self) -> bool {
            !self.alive.load(Ordering::SeqCst)
        }

        async fn goto(&self, url: &str, limit: Duration) -> Result<(), DriverError> {
            match timeout(limit, self.page.goto(url)).await {
                Ok(res) => res.map(|_| ()).map_err(cdp_error),
                Err(_) => Err(DriverError::Timeout),
            }
        }

        async fn wait_network_idle(&self, limit: Duration) -> Result<(), DriverError> {
            let poll = async {
                let mut tracker = IdleTracker::new();
                loop {
                    let (ready, resources): (bool, usize) = self.eval(IDLE_PROBE).await?;
                    if tracker.observe(ready, resources) {
                        return Ok::<(), DriverError>(());
                    }
                    sleep(IDLE_POLL).await;
                }
            };
            match timeout(limit, poll).await {
                Ok(res) => res,
                Err(_) => Err(DriverError::Timeout),
            }
        }

        async fn detect_captcha(&self) -> bool {
            match self.page.content().await {
                Ok(html) => looks_like_captcha(&html),
                Err(_) => false,
            }
        }

        async fn body_text(&self) -> Result<String, DriverError> {
            self.eval("document.body ? document.body.innerText : ''").await
        }

        async fn inner_html_all(&self, selector: &str) -> Result<Vec<String>, DriverError> {
            let quoted = serde_json::to_string(selector).map_err(|e| DriverError::Other(e.to_string()))?;
            self.eval(&format!("[...document.querySelectorAll({quoted})].map(x => x.innerHTML)"))
                .await
        }

        async fn click_first(&self, selector: &str) -> Result<bool, DriverError> {
            let elements = self.page.find_elements(selector).await.map_err(cdp_error)?;
            let Some(first) = elements.into_iter().next() else {
                return Ok(false);
            };
            first.click().await.map_err(cdp_error)?;
            self.page.wait_for_navigation().await.map_err(cdp_error)?;
            Ok(true)
        }

        async fn meta(&self) -> Result<ArticleMeta, DriverError> {
            let html = self.page.content().await.map_err(cdp_error)?;
            Ok(extract_meta(&html))
        }

        async fn close(&self) {
            let browser = self.browser.borrow_mut().take();
            if let Some(mut browser) = browser {
                if let Err(e) = browser.close().await {
                    warn!(error = %e, "Closing Chromium failed");
                }
            }
        }
    }

}
