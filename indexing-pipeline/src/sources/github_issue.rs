use common::storage::{
    source::{EtlCursor, SourceEntity},
    vector::PayloadSchema,
};
use serde_json::{json, Map, Value};

use super::{
    format_date, insert_opt, plural, preview, sanitize, timestamp_value, EmbeddingDescriptor,
};

common::stored_object!(GithubIssue, "github_issue", {
    number: u64,
    title: String,
    #[serde(default)]
    repository_full_name: Option<String>,
    /// `open` or `closed`.
    state: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    assignees: Vec<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    comments: u64,
    #[serde(default)]
    body: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    closed_at: Option<DateTime<Utc>>
});

impl SourceEntity for GithubIssue {
    fn cursor(&self) -> EtlCursor {
        EtlCursor::new(self.updated_at, self.id.clone())
    }
}

impl EmbeddingDescriptor for GithubIssue {
    const ENTITY_TYPE: &'static str = "issue";

    fn embedding_text(&self) -> String {
        let mut parts = vec![format!(
            "GitHub issue #{} '{}'",
            self.number,
            sanitize(&self.title, 300)
        )];

        if let Some(repo) = &self.repository_full_name {
            parts.push(format!("in repository {repo}"));
        }
        parts.push(self.state.clone());
        if let Some(author) = &self.author {
            parts.push(format!("opened by {author}"));
        }
        if !self.assignees.is_empty() {
            let assignees: Vec<&str> = self.assignees.iter().map(String::as_str).take(3).collect();
            parts.push(format!("assigned to {}", assignees.join(", ")));
        }
        let labels: Vec<&str> = self
            .labels
            .iter()
            .map(String::as_str)
            .filter(|l| !l.is_empty())
            .take(5)
            .collect();
        if !labels.is_empty() {
            parts.push(format!("labeled as {}", labels.join(", ")));
        }
        if self.comments > 0 {
            parts.push(plural(self.comments, "comment"));
        }
        if let Some(body) = self.body.as_deref().filter(|b| !b.trim().is_empty()) {
            parts.push(preview(body, 200));
        }
        parts.push(match &self.closed_at {
            Some(closed_at) => format!("closed on {}", format_date(closed_at)),
            None => format!("opened on {}", format_date(&self.created_at)),
        });

        format!("{}.", parts.join(", "))
    }

    fn payload_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("source".into(), json!("github"));
        fields.insert("number".into(), json!(self.number));
        fields.insert("title".into(), json!(sanitize(&self.title, 500)));
        insert_opt(
            &mut fields,
            "repositoryFullName",
            self.repository_full_name.as_ref().map(|r| json!(r)),
        );
        fields.insert("state".into(), json!(self.state));
        insert_opt(&mut fields, "author", self.author.as_ref().map(|a| json!(a)));
        fields.insert("assignees".into(), json!(self.assignees));
        fields.insert("labels".into(), json!(self.labels));
        fields.insert("comments".into(), json!(self.comments));
        fields.insert("createdAt".into(), timestamp_value(&self.created_at));
        insert_opt(&mut fields, "closedAt", self.closed_at.as_ref().map(timestamp_value));
        fields
    }

    fn payload_indexes() -> Vec<(&'static str, PayloadSchema)> {
        vec![
            ("metadata.repositoryFullName", PayloadSchema::Keyword),
            ("metadata.state", PayloadSchema::Keyword),
            ("metadata.createdAt", PayloadSchema::Datetime),
        ]
    }
}
