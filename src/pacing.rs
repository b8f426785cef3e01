//! Per-dependency pacing and per-domain cooldowns.
//!
//! One [`RateLedger`] and one [`DomainCooldowns`] table live for the length of
//! a run and are threaded through the pipeline by `&mut`. The run is
//! single-threaded, so no locking is involved.

use crate::config::{PaceSettings, PacingSettings};
use crate::utils::{format_duration, host_of};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;

/// Last-call timestamp and spacing for one external dependency.
#[derive(Debug, Clone)]
pub struct Pace {
    name: &'static str,
    last: Option<Instant>,
    delay: Duration,
    increment: Duration,
    max_delay: Option<Duration>,
}

impl Pace {
    pub fn new(name: &'static str, settings: PaceSettings) -> Self {
        Self {
            name,
            last: None,
            delay: Duration::from_millis(settings.delay_ms),
            increment: Duration::from_millis(settings.increment_ms),
            max_delay: (settings.max_ms > 0).then(|| Duration::from_millis(settings.max_ms)),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Time left before the next call may start.
    pub fn remaining(&self) -> Duration {
        match self.last {
            Some(last) => (last + self.delay).saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Sleep out the remaining spacing. Returns how long it waited.
    pub async fn wait(&self) -> Duration {
        let remaining = self.remaining();
        if !remaining.is_zero() {
            debug!(pace = self.name, wait = %format_duration(remaining), "Pacing wait");
            sleep(remaining).await;
        }
        remaining
    }

    /// Record a call starting now.
    pub fn mark(&mut self) {
        self.last = Some(Instant::now());
    }

    /// Grow the spacing by the configured increment, up to the cap.
    pub fn bump(&mut self) {
        if self.increment.is_zero() {
            return;
        }
        let grown = self.delay + self.increment;
        self.delay = match self.max_delay {
            Some(max) => grown.min(max),
            None => grown,
        };
    }

    /// Replace the spacing, e.g. with a value a collaborator reported back.
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }
}

/// Pacing state for every rate-limited dependency.
#[derive(Debug, Clone)]
pub struct RateLedger {
    pub url_decode: Pace,
    pub verify: Pace,
    pub aggregator_search: Pace,
    pub summarize: Pace,
}

impl RateLedger {
    pub fn new(settings: &PacingSettings) -> Self {
        Self {
            url_decode: Pace::new("url_decode", settings.url_decode),
            verify: Pace::new("verify", settings.verify),
            aggregator_search: Pace::new("aggregator_search", settings.aggregator_search),
            summarize: Pace::new("summarize", settings.summarize),
        }
    }
}

#[derive(Debug, Clone)]
struct Cooldown {
    until: Instant,
    reason: String,
}

/// Hosts temporarily excluded from browser fetches.
#[derive(Debug, Default)]
pub struct DomainCooldowns {
    by_host: HashMap<String, Cooldown>,
}

impl DomainCooldowns {
    /// Remaining cooldown and its reason, if the URL's host is cooling down.
    pub fn active(&self, url: &str) -> Option<(Duration, &str)> {
        let host = host_of(url)?;
        let entry = self.by_host.get(&host)?;
        let left = entry.until.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some((left, entry.reason.as_str()))
    }

    pub fn set(&mut self, url: &str, duration: Duration, reason: &str) {
        let Some(host) = host_of(url) else {
            return;
        };
        debug!(%host, reason, cooldown = %format_duration(duration), "Domain cooldown set");
        self.by_host.insert(
            host,
            Cooldown {
                until: Instant::now() + duration,
                reason: reason.to_string(),
            },
        );
    }
}

/// Process-wide mutable state of one run.
#[derive(Debug)]
pub struct RunState {
    pub ledger: RateLedger,
    pub cooldowns: DomainCooldowns,
}

impl RunState {
    pub fn new(settings: &PacingSettings) -> Self {
        Self {
            ledger: RateLedger::new(settings),
            cooldowns: DomainCooldowns::default(),
        }
    }
}
