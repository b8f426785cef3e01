//! Per-event outcome tracking and the end-of-run failure summary.
//!
//! Every step of an event's pass is recorded on its [`EventTrace`]: the
//! record goes to `tracing` right away and is kept so that the last
//! phase/status/method/reason can be reported if the event fails. When an
//! [`EventLog`] is open the records are also appended to it as JSON lines.

use crate::models::Event;
use crate::utils::{format_duration, truncate_for_log};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// One step of an event's pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Step {
    pub phase: String,
    pub status: String,
    pub method: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
struct Record {
    ts: String,
    id: String,
    #[serde(flatten)]
    step: Step,
    #[serde(skip_serializing_if = "Map::is_empty")]
    fields: Map<String, Value>,
}

#[derive(Debug)]
pub struct EventTrace {
    id: String,
    title: String,
    last: Step,
    records: Vec<Record>,
    timings: Vec<(&'static str, Duration)>,
    started: Instant,
}

impl EventTrace {
    pub fn new(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            title: event.title().to_string(),
            last: Step::default(),
            records: Vec::new(),
            timings: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, phase: &str, status: &str, method: &str, reason: &str) {
        self.record_with(phase, status, method, reason, Map::new());
    }

    /// Record a step with extra structured fields.
    pub fn record_with(&mut self, phase: &str, status: &str, method: &str, reason: &str, fields: Map<String, Value>) {
        let fields_json = Value::Object(fields.clone());
        info!(
            id = %self.id,
            phase,
            status,
            method,
            reason = %truncate_for_log(reason, 200),
            fields = %fields_json,
            "event"
        );
        let step = Step {
            phase: phase.to_string(),
            status: status.to_string(),
            method: method.to_string(),
            reason: reason.to_string(),
        };
        self.last = step.clone();
        self.records.push(Record {
            ts: Utc::now().to_rfc3339(),
            id: self.id.clone(),
            step,
            fields,
        });
    }

    pub fn last(&self) -> &Step {
        &self.last
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Add `elapsed` to the running total of `phase`.
    pub fn time(&mut self, phase: &'static str, elapsed: Duration) {
        match self.timings.iter_mut().find(|(p, _)| *p == phase) {
            Some((_, total)) => *total += elapsed,
            None => self.timings.push((phase, elapsed)),
        }
    }

    /// Log the phase timings of the whole pass.
    pub fn log_timings(&self) {
        let phases = self
            .timings
            .iter()
            .map(|(p, d)| format!("{p}={}", format_duration(*d)))
            .collect::<Vec<_>>()
            .join(" ");
        info!(id = %self.id, total = %format_duration(self.started.elapsed()), %phases, "Event timings");
    }
}

/// Optional JSON-lines sink for event records.
#[derive(Debug, Default)]
pub struct EventLog {
    file: Option<File>,
}

impl EventLog {
    pub async fn open(path: Option<&Path>) -> io::Result<Self> {
        let file = match path {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path).await?),
            None => None,
        };
        Ok(Self { file })
    }

    /// Append every record of `trace`. Write failures are logged and the sink closed.
    pub async fn append(&mut self, trace: &EventTrace) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let mut buf = String::new();
        for record in &trace.records {
            match serde_json::to_string(record) {
                Ok(line) => {
                    buf.push_str(&line);
                    buf.push('\n');
                }
                Err(e) => warn!(error = %e, "Event record not serializable"),
            }
        }
        let written = match file.write_all(buf.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(error = %e, "Event log write failed; disabling event log");
            self.file = None;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub ok: usize,
    pub fail: usize,
}

/// An event that ended its pass incomplete.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub id: String,
    pub title: String,
    pub source: String,
    pub url: String,
    pub step: Step,
}

impl Failure {
    fn line(&self) -> String {
        let mut line = format!("#{} {}", self.id, truncate_for_log(&self.title, 80));
        if !self.source.is_empty() {
            line.push_str(&format!(" [{}]", self.source));
        }
        if !self.url.is_empty() {
            line.push_str(&format!(" {}", self.url));
        }
        let s = &self.step;
        line.push_str(&format!(
            " phase={} status={} method={} reason={}",
            s.phase, s.status, s.method, s.reason
        ));
        line
    }
}

#[derive(Debug, Default)]
pub struct FailureSummary {
    failures: Vec<Failure>,
}

impl FailureSummary {
    pub fn push(&mut self, failure: Failure) {
        self.failures.push(failure);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Report lines, at most `limit` failures plus a "... N more" line.
    pub fn lines(&self, limit: usize) -> Vec<String> {
        let mut lines: Vec<String> = self.failures.iter().take(limit).map(Failure::line).collect();
        if self.failures.len() > limit {
            lines.push(format!("... {} more", self.failures.len() - limit));
        }
        lines
    }

    pub fn log(&self, limit: usize) {
        if self.is_empty() {
            return;
        }
        warn!(count = self.len(), "Events left incomplete");
        for line in self.lines(limit) {
            warn!("{line}");
        }
    }
}
