pub mod temporal;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use common::storage::vector::{Condition, Filter};
use serde::Serialize;
use tracing::debug;

use crate::intent::QueryIntent;
pub use temporal::{parse_time_range, TimeRange};

/// Record types that can appear under `metadata.__type`.
pub const KNOWN_ENTITY_TYPES: [&str; 8] = [
    "track",
    "playlist",
    "recently_played",
    "repository",
    "pull_request",
    "issue",
    "calendar_event",
    "email",
];

/// Payload datetime fields a time range is checked against; any one may match.
pub const DATE_FIELDS: [&str; 7] = [
    "createdAt",
    "playedAt",
    "updatedAt",
    "mergedAt",
    "pushedAt",
    "startTime",
    "sentAt",
];

struct Domain {
    /// Heuristic tag emitted when the domain matches.
    label: &'static str,
    keywords: &'static [&'static str],
    types: &'static [&'static str],
}

const DOMAINS: [Domain; 5] = [
    Domain {
        label: "code",
        keywords: &[
            "repo",
            "repository",
            "source",
            "code",
            "pull",
            "pr",
            "git",
            "github",
            "commit",
        ],
        types: &["repository", "pull_request"],
    },
    Domain {
        label: "tasks",
        keywords: &["task", "issue", "ticket", "project", "kanban", "bug", "linear"],
        types: &["issue"],
    },
    Domain {
        label: "music",
        keywords: &[
            "music",
            "song",
            "track",
            "playlist",
            "artist",
            "album",
            "listening",
            "spotify",
            "playing",
            "played",
        ],
        types: &["track", "playlist", "recently_played"],
    },
    Domain {
        label: "calendar",
        keywords: &[
            "calendar",
            "meeting",
            "meetings",
            "schedule",
            "appointment",
            "appointments",
            "event",
            "events",
        ],
        types: &["calendar_event"],
    },
    Domain {
        label: "email",
        keywords: &["email", "emails", "mail", "gmail", "inbox"],
        types: &["email"],
    },
];

/// Restriction applied to every vector search of one retrieval call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TypeFilter {
    pub types: Option<Vec<String>>,
    pub time_range: Option<TimeRange>,
}

impl TypeFilter {
    /// The same filter with the time constraint dropped, `None` when nothing is left.
    pub fn without_time(&self) -> Option<Self> {
        self.types.as_ref().map(|types| Self {
            types: Some(types.clone()),
            time_range: None,
        })
    }

    /// `metadata.__type` must match one of the types; when a time range is set,
    /// at least one of the known date fields must fall inside it.
    pub fn to_filter(&self) -> Option<Filter> {
        let mut filter = Filter::default();

        if let Some(types) = self.types.as_ref().filter(|types| !types.is_empty()) {
            filter
                .must
                .push(Condition::match_any("metadata.__type", types.iter().cloned()));
        }

        if let Some(range) = self.time_range {
            filter.should = DATE_FIELDS
                .iter()
                .map(|field| Condition::Range {
                    key: format!("metadata.{field}"),
                    from: Some(range.from),
                    to: Some(range.to),
                })
                .collect();
        }

        (!filter.is_empty()).then_some(filter)
    }
}

/// Infers the search filter for a query. Precedence: intent entity types, then
/// keyword domains, then a time-only filter; `None` means search everything.
pub fn infer_types(
    tags: &[String],
    user_query: Option<&str>,
    intent: Option<&QueryIntent>,
    now: DateTime<Utc>,
) -> Option<TypeFilter> {
    let query = user_query.unwrap_or_default();

    if let Some(intent) = intent {
        let time_range = if intent.is_temporal_query {
            let reference = intent
                .time_reference
                .as_deref()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or(query);
            parse_time_range(reference, now)
        } else {
            None
        };

        if !intent.entity_types.is_empty() {
            debug!(entity_types = ?intent.entity_types, "Using entity types from query intent");
            return Some(TypeFilter {
                types: Some(intent.entity_types.clone()),
                time_range,
            });
        }

        if time_range.is_some() {
            return Some(TypeFilter {
                types: None,
                time_range,
            });
        }
    }

    let keywords = keyword_set(tags, query);
    let mut types: Vec<String> = Vec::new();
    for domain in &DOMAINS {
        if domain.keywords.iter().any(|kw| keywords.contains(*kw)) {
            types.extend(domain.types.iter().map(|t| (*t).to_string()));
        }
    }

    let time_range = parse_time_range(query, now);
    if let Some(range) = &time_range {
        debug!(from = %range.from, to = %range.to, "Time range parsed for filtering");
    }

    if !types.is_empty() {
        return Some(TypeFilter {
            types: Some(types),
            time_range,
        });
    }

    time_range.map(|range| TypeFilter {
        types: None,
        time_range: Some(range),
    })
}

fn keyword_set(tags: &[String], query: &str) -> HashSet<String> {
    let mut keywords: HashSet<String> = tags
        .iter()
        .filter(|tag| !tag.is_empty())
        .map(|tag| tag.to_lowercase())
        .collect();

    let cleaned: String = query
        .to_lowercase()
        .chars()
        .map(|c| {
            if ".,;:!?(){}[]\\/+*_#@%^&=<>|~".contains(c) {
                ' '
            } else {
                c
            }
        })
        .collect();
    keywords.extend(cleaned.split_whitespace().map(str::to_string));
    keywords
}

/// Domain labels whose keywords occur in the query, used as heuristic tags.
pub fn keyword_tags(query: &str) -> Vec<String> {
    let keywords = keyword_set(&[], query);
    DOMAINS
        .iter()
        .filter(|domain| domain.keywords.iter().any(|kw| keywords.contains(*kw)))
        .map(|domain| domain.label.to_string())
        .collect()
}

/// Every type a keyword match can restrict a search to, in table order.
pub fn routed_types() -> Vec<&'static str> {
    let mut types: Vec<&'static str> = Vec::new();
    for ty in DOMAINS.iter().flat_map(|domain| domain.types.iter().copied()) {
        if !types.contains(&ty) {
            types.push(ty);
        }
    }
    types
}
