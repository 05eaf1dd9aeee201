use common::storage::{
    source::{EtlCursor, SourceEntity},
    vector::PayloadSchema,
};
use serde_json::{json, Map, Value};

use super::{
    format_date, insert_opt, plural, preview, sanitize, timestamp_value, EmbeddingDescriptor,
};

common::stored_object!(GithubRepository, "github_repository", {
    name: String,
    full_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    #[serde(default)]
    open_issues_count: u64,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    fork: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    pushed_at: Option<DateTime<Utc>>
});

impl GithubRepository {
    fn flags(&self) -> impl Iterator<Item = &'static str> {
        [
            (self.private, "private"),
            (self.fork, "fork"),
            (self.archived, "archived"),
        ]
        .into_iter()
        .filter_map(|(set, label)| set.then_some(label))
    }
}

impl SourceEntity for GithubRepository {
    fn cursor(&self) -> EtlCursor {
        EtlCursor::new(self.updated_at, self.id.clone())
    }
}

impl EmbeddingDescriptor for GithubRepository {
    const ENTITY_TYPE: &'static str = "repository";

    fn embedding_text(&self) -> String {
        let mut parts = vec![format!("Repository {}", sanitize(&self.full_name, 200))];

        if let Some(description) = self.description.as_deref().filter(|d| !d.trim().is_empty()) {
            parts.push(preview(description, 200));
        }
        parts.extend(self.flags().map(str::to_string));
        if let Some(language) = &self.language {
            parts.push(format!("written in {language}"));
        }
        if self.stargazers_count > 0 {
            parts.push(plural(self.stargazers_count, "star"));
        }
        if self.forks_count > 0 {
            parts.push(plural(self.forks_count, "fork"));
        }
        if self.open_issues_count > 0 {
            parts.push(plural(self.open_issues_count, "open issue"));
        }

        let topics: Vec<&str> = self
            .topics
            .iter()
            .map(String::as_str)
            .filter(|t| !t.is_empty())
            .take(5)
            .collect();
        if !topics.is_empty() {
            parts.push(format!("topics: {}", topics.join(", ")));
        }

        parts.push(match &self.pushed_at {
            Some(pushed_at) => format!("last pushed on {}", format_date(pushed_at)),
            None => format!("created on {}", format_date(&self.created_at)),
        });

        format!("{}.", parts.join(", "))
    }

    fn payload_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(sanitize(&self.name, 500)));
        fields.insert("fullName".into(), json!(sanitize(&self.full_name, 500)));
        insert_opt(
            &mut fields,
            "description",
            self.description.as_deref().map(|d| json!(sanitize(d, 1000))),
        );
        insert_opt(&mut fields, "language", self.language.as_ref().map(|l| json!(l)));
        fields.insert("stars".into(), json!(self.stargazers_count));
        fields.insert("forks".into(), json!(self.forks_count));
        fields.insert("private".into(), json!(self.private));
        fields.insert("archived".into(), json!(self.archived));
        fields.insert("topics".into(), json!(self.topics));
        fields.insert("createdAt".into(), timestamp_value(&self.created_at));
        insert_opt(&mut fields, "pushedAt", self.pushed_at.as_ref().map(timestamp_value));
        fields
    }

    fn payload_indexes() -> Vec<(&'static str, PayloadSchema)> {
        vec![
            ("metadata.fullName", PayloadSchema::Keyword),
            ("metadata.language", PayloadSchema::Keyword),
            ("metadata.pushedAt", PayloadSchema::Datetime),
            ("metadata.createdAt", PayloadSchema::Datetime),
        ]
    }
}
