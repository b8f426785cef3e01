//! Alternative-source resolver.
//!
//! Filters and ranks candidate articles from other outlets when the row's own
//! URL cannot supply verified text. Every input candidate ends up either in
//! [`Classified::accepted`] or in [`Classified::rejected`] with a reason.

use crate::config::AlternativeSettings;
use crate::models::{Candidate, CandidateOrigin, Event, OriginalContext};
use crate::utils::{is_blank, normalize_source, normalize_title_key, parse_date, search_terms_from_url};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Built-in outlet authority; wire agencies first, then large newsrooms.
const BUILTIN_AUTHORITY: &[(&str, i32)] = &[
    ("reuters", 3),
    ("apnews", 3),
    ("associatedpress", 3),
    ("ap", 3),
    ("afp", 3),
    ("bloomberg", 3),
    ("bbc", 2),
    ("nytimes", 2),
    ("thenewyorktimes", 2),
    ("washingtonpost", 2),
    ("theguardian", 2),
    ("guardian", 2),
    ("ft", 2),
    ("financialtimes", 2),
    ("wsj", 2),
    ("thewallstreetjournal", 2),
    ("aljazeera", 2),
    ("cnn", 2),
    ("npr", 2),
    ("dw", 2),
    ("economist", 2),
    ("theeconomist", 2),
];

const UNKNOWN_LEVEL: i32 = 1;

/// Outlet trustworthiness lookup keyed by normalised source name.
#[derive(Debug, Clone)]
pub struct Authority {
    levels: HashMap<String, i32>,
}

impl Authority {
    /// Built-in table with configured overrides applied on top.
    pub fn new(settings: &AlternativeSettings) -> Self {
        let mut levels: HashMap<String, i32> = BUILTIN_AUTHORITY
            .iter()
            .map(|(name, level)| (name.to_string(), *level))
            .collect();
        for (name, level) in &settings.authority {
            levels.insert(normalize_source(name), *level);
        }
        Self { levels }
    }

    pub fn level(&self, source: &str) -> i32 {
        self.levels
            .get(&normalize_source(source))
            .copied()
            .unwrap_or(UNKNOWN_LEVEL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingLinkOrSource,
    RowStoreOrigin,
    DateOutOfRange,
    SameSourceSameLink,
    Duplicate,
    BelowMinAgency,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingLinkOrSource => "missing_link_or_source",
            RejectReason::RowStoreOrigin => "sheet_origin",
            RejectReason::DateOutOfRange => "date_out_of_range",
            RejectReason::SameSourceSameLink => "same_source_same_link",
            RejectReason::Duplicate => "duplicate",
            RejectReason::BelowMinAgency => "below_min_agency",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An accepted candidate together with the keys it was judged by.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranked {
    pub candidate: Candidate,
    pub level: i32,
    pub source_key: String,
    pub title_key: String,
}

impl Ranked {
    pub fn has_direct_url(&self) -> bool {
        self.candidate.has_direct_url()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub candidate: Candidate,
    pub level: i32,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classified {
    pub accepted: Vec<Ranked>,
    pub rejected: Vec<Rejected>,
}

/// Title key a candidate is compared by.
///
/// Row-store entries can carry stale titles, so for them the URL slug wins.
pub fn candidate_title_key(candidate: &Candidate) -> String {
    let terms = search_terms_from_url(candidate.link());
    let slug_key = if terms.is_empty() {
        String::new()
    } else {
        normalize_title_key(&terms)
    };
    let title_key = normalize_title_key(&candidate.title);
    let (first, second) = if candidate.origin == CandidateOrigin::RowStore {
        (slug_key, title_key)
    } else {
        (title_key, slug_key)
    };
    if first.is_empty() { second } else { first }
}

/// Title key of the event, falling back to its URL slug.
pub fn event_title_key(event: &Event, original: &OriginalContext) -> String {
    let title = [
        event.title_en.as_str(),
        event.title_ru.as_str(),
        original.title_en.as_str(),
        original.title_ru.as_str(),
    ]
    .into_iter()
    .find(|t| !is_blank(t))
    .unwrap_or_default();
    let key = normalize_title_key(title);
    if !key.is_empty() {
        return key;
    }
    let link = if is_blank(&event.url) { &event.gn_url } else { &event.url };
    let terms = search_terms_from_url(link);
    if terms.is_empty() {
        String::new()
    } else {
        normalize_title_key(&terms)
    }
}

/// Loose headline comparison: short targets need every token, longer ones
/// need at least two shared tokens covering 30% of the larger title.
pub fn title_matches(target_key: &str, candidate_key: &str) -> bool {
    let target: HashSet<&str> = target_key.split_whitespace().collect();
    let candidate: HashSet<&str> = candidate_key.split_whitespace().collect();
    if target.is_empty() || candidate.is_empty() {
        return false;
    }
    let common = target.intersection(&candidate).count();
    if target.len() <= 2 {
        return common == target.len();
    }
    let ratio = common as f64 / target.len().max(candidate.len()) as f64;
    common >= 2 && ratio >= 0.3
}

fn within_window(event_date: &str, candidate_date: &str, window_days: i64) -> bool {
    if window_days <= 0 {
        return true;
    }
    match (parse_date(event_date), parse_date(candidate_date)) {
        (Some(a), Some(b)) => (b - a).num_days().abs() <= window_days,
        _ => true,
    }
}

fn compare_ranked(a: &Ranked, b: &Ranked) -> Ordering {
    b.level
        .cmp(&a.level)
        .then_with(|| b.has_direct_url().cmp(&a.has_direct_url()))
        .then_with(|| match (a.candidate.rank, b.candidate.rank) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

/// Split `candidates` into ranked accepted alternatives and reasoned rejections.
pub fn classify(
    event: &Event,
    original: &OriginalContext,
    candidates: &[Candidate],
    authority: &Authority,
    settings: &AlternativeSettings,
) -> Classified {
    let event_source = normalize_source(&event.source);
    let event_link = if is_blank(&event.url) {
        event.gn_url.trim()
    } else {
        event.url.trim()
    };
    let event_date = if is_blank(&original.date) {
        &event.date
    } else {
        &original.date
    };

    let mut seen_titles = HashSet::new();
    let mut seen_links = HashSet::new();
    let mut out = Classified::default();

    for candidate in candidates {
        let level = authority.level(&candidate.source);
        let source_key = normalize_source(&candidate.source);
        let link = candidate.link();
        let title_key = candidate_title_key(candidate);

        let reason = if link.is_empty() || source_key.is_empty() {
            Some(RejectReason::MissingLinkOrSource)
        } else if candidate.origin == CandidateOrigin::RowStore {
            Some(RejectReason::RowStoreOrigin)
        } else if !within_window(event_date, &candidate.date, settings.date_window_days) {
            Some(RejectReason::DateOutOfRange)
        } else if source_key == event_source && link == event_link {
            Some(RejectReason::SameSourceSameLink)
        } else if seen_links.contains(&(source_key.clone(), link.to_string()))
            || (!title_key.is_empty() && seen_titles.contains(&(source_key.clone(), title_key.clone())))
        {
            Some(RejectReason::Duplicate)
        } else if level < settings.min_agency_level {
            Some(RejectReason::BelowMinAgency)
        } else {
            None
        };

        match reason {
            Some(reason) => out.rejected.push(Rejected {
                candidate: candidate.clone(),
                level,
                reason,
            }),
            None => {
                seen_links.insert((source_key.clone(), link.to_string()));
                if !title_key.is_empty() {
                    seen_titles.insert((source_key.clone(), title_key.clone()));
                }
                out.accepted.push(Ranked {
                    candidate: candidate.clone(),
                    level,
                    source_key,
                    title_key,
                });
            }
        }
    }

    out.accepted.sort_by(compare_ranked);
    out
}

/// Add newly discovered candidates to an event's pool.
///
/// Only candidates whose headline matches the event are kept; row-store
/// entries and already-pooled (source, link) pairs are skipped. Returns the
/// number added.
pub fn merge_candidates(
    pool: &mut Vec<Candidate>,
    event: &Event,
    original: &OriginalContext,
    found: Vec<Candidate>,
) -> usize {
    let target = event_title_key(event, original);
    let mut seen: HashSet<(String, String)> = pool
        .iter()
        .filter(|c| !c.link().is_empty() && !is_blank(&c.source))
        .map(|c| (normalize_source(&c.source), c.link().to_string()))
        .collect();
    let mut added = 0;
    for candidate in found {
        if candidate.link().is_empty() || is_blank(&candidate.source) {
            continue;
        }
        if candidate.origin == CandidateOrigin::RowStore {
            continue;
        }
        if !target.is_empty() && !title_matches(&target, &candidate_title_key(&candidate)) {
            continue;
        }
        let key = (normalize_source(&candidate.source), candidate.link().to_string());
        if !seen.insert(key) {
            continue;
        }
        pool.push(candidate);
        added += 1;
    }
    added
}
