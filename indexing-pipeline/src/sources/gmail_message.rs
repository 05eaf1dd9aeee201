use common::storage::{
    source::{EtlCursor, SourceEntity},
    vector::PayloadSchema,
};
use serde_json::{json, Map, Value};

use super::{format_date, format_time, insert_opt, sanitize, timestamp_value, EmbeddingDescriptor};

common::stored_object!(GmailMessage, "gmail_message", {
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    /// Longer plain-text excerpt of the body, preferred over `snippet` when present.
    #[serde(default)]
    body_snippet: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    sent_at: Option<DateTime<Utc>>
});

impl GmailMessage {
    fn body(&self) -> Option<&str> {
        self.body_snippet
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .or(self.snippet.as_deref())
            .filter(|b| !b.trim().is_empty())
    }
}

impl SourceEntity for GmailMessage {
    fn cursor(&self) -> EtlCursor {
        EtlCursor::new(self.updated_at, self.id.clone())
    }
}

impl EmbeddingDescriptor for GmailMessage {
    const ENTITY_TYPE: &'static str = "email";

    fn embedding_text(&self) -> String {
        let mut parts = vec!["Gmail message".to_string()];
        if let Some(subject) = &self.subject {
            parts.push(format!("subject: \"{}\"", sanitize(subject, 300)));
        }
        if let Some(from) = &self.from {
            parts.push(format!("from {}", sanitize(from, 255)));
        }
        if let Some(to) = &self.to {
            parts.push(format!("to {}", sanitize(to, 255)));
        }
        if let Some(sent_at) = &self.sent_at {
            parts.push(format!(
                "sent on {} at {}",
                format_date(sent_at),
                format_time(sent_at)
            ));
        }
        if let Some(body) = self.body() {
            parts.push(format!("content: \"{}\"", sanitize(body, 1000)));
        }
        parts.join(", ")
    }

    fn payload_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        insert_opt(
            &mut fields,
            "subject",
            self.subject.as_deref().map(|s| json!(sanitize(s, 500))),
        );
        insert_opt(&mut fields, "from", self.from.as_deref().map(|f| json!(sanitize(f, 255))));
        insert_opt(&mut fields, "to", self.to.as_deref().map(|t| json!(sanitize(t, 255))));
        insert_opt(
            &mut fields,
            "snippet",
            self.snippet.as_deref().map(|s| json!(sanitize(s, 500))),
        );
        insert_opt(&mut fields, "body", self.body().map(|b| json!(sanitize(b, 2000))));
        insert_opt(&mut fields, "threadId", self.thread_id.as_ref().map(|t| json!(t)));
        fields.insert("labels".into(), json!(self.labels));
        insert_opt(&mut fields, "sentAt", self.sent_at.as_ref().map(timestamp_value));
        fields
    }

    fn payload_indexes() -> Vec<(&'static str, PayloadSchema)> {
        vec![
            ("metadata.from", PayloadSchema::Keyword),
            ("metadata.threadId", PayloadSchema::Keyword),
            ("metadata.sentAt", PayloadSchema::Datetime),
        ]
    }
}
