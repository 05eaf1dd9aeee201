//! Source tables the indexer knows how to read, and how each row is turned
//! into embedding text and a vector payload.

pub mod calendar_event;
pub mod github_issue;
pub mod github_pull_request;
pub mod github_repository;
pub mod gmail_message;
pub mod linear_issue;
pub mod spotify_playlist;
pub mod spotify_recently_played;
pub mod spotify_track;

pub use calendar_event::CalendarEvent;
pub use github_issue::GithubIssue;
pub use github_pull_request::GithubPullRequest;
pub use github_repository::GithubRepository;
pub use gmail_message::GmailMessage;
pub use linear_issue::LinearIssue;
pub use spotify_playlist::SpotifyPlaylist;
pub use spotify_recently_played::SpotifyRecentlyPlayed;
pub use spotify_track::SpotifyTrack;

use chrono::{DateTime, Utc};
use common::storage::{source::SourceEntity, vector::PayloadSchema};
use serde_json::{Map, Value};

/// Per-source description of a row for the vector index.
pub trait EmbeddingDescriptor: SourceEntity {
    /// Value written to `metadata.__type`.
    const ENTITY_TYPE: &'static str;

    /// Natural-language text the row is embedded from.
    fn embedding_text(&self) -> String;

    /// Source fields for the payload metadata, without internal bookkeeping timestamps.
    fn payload_fields(&self) -> Map<String, Value>;

    /// Payload indexes specific to this source.
    fn payload_indexes() -> Vec<(&'static str, PayloadSchema)> {
        Vec::new()
    }
}

/// Strips control characters, collapses whitespace, caps the length in characters.
pub fn sanitize(text: &str, max_chars: usize) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_chars).collect()
}

/// Sanitized preview that marks truncation with `...`.
pub fn preview(text: &str, max_chars: usize) -> String {
    let clean = sanitize(text, usize::MAX);
    if clean.chars().count() > max_chars {
        let head: String = clean.chars().take(max_chars).collect();
        format!("{head}...")
    } else {
        clean
    }
}

/// `m:ss`
pub fn format_duration_ms(duration_ms: u64) -> String {
    let minutes = duration_ms / 60_000;
    let seconds = (duration_ms % 60_000) / 1_000;
    format!("{minutes}:{seconds:02}")
}

/// `March 1, 2024`
pub fn format_date(at: &DateTime<Utc>) -> String {
    at.format("%B %-d, %Y").to_string()
}

/// `9:05 AM`
pub fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%-I:%M %p").to_string()
}

pub(crate) fn plural(count: u64, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

/// Inserts `value` only when present, so payloads carry no explicit nulls.
pub(crate) fn insert_opt(fields: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), value);
    }
}

pub(crate) fn timestamp_value(at: &DateTime<Utc>) -> Value {
    Value::String(common::storage::vector::format_timestamp(at))
}
