use common::storage::{
    source::{EtlCursor, SourceEntity},
    vector::PayloadSchema,
};
use serde_json::{json, Map, Value};

use super::{format_date, insert_opt, plural, sanitize, timestamp_value, EmbeddingDescriptor};

common::stored_object!(GithubPullRequest, "github_pull_request", {
    number: u64,
    title: String,
    #[serde(default)]
    repository_full_name: Option<String>,
    /// `open` or `closed`.
    state: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    merged_by: Option<String>,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    #[serde(default)]
    changed_files: u64,
    #[serde(default)]
    commits: u64,
    #[serde(default)]
    comments: u64,
    #[serde(default)]
    review_comments: u64,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    milestone: Option<String>,
    #[serde(default)]
    head_ref: Option<String>,
    #[serde(default)]
    base_ref: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    merged_at: Option<DateTime<Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    closed_at: Option<DateTime<Utc>>
});

impl GithubPullRequest {
    fn state_info(&self) -> Option<String> {
        if self.merged {
            return Some(match self.merged_by.as_deref() {
                Some(login) => format!("merged by {login}"),
                None => "merged".to_string(),
            });
        }
        match (self.state.as_str(), self.draft) {
            ("closed", _) => Some("closed".to_string()),
            ("open", true) => Some("draft PR".to_string()),
            ("open", false) => Some("open".to_string()),
            _ => None,
        }
    }

    fn code_stats(&self) -> Option<String> {
        let mut stats = Vec::new();
        if self.additions > 0 || self.deletions > 0 {
            stats.push(format!("+{} -{} lines", self.additions, self.deletions));
        }
        if self.changed_files > 0 {
            stats.push(plural(self.changed_files, "file"));
        }
        if self.commits > 0 {
            stats.push(plural(self.commits, "commit"));
        }
        (!stats.is_empty()).then(|| format!("across {}", stats.join(", ")))
    }

    fn review_stats(&self) -> Option<String> {
        let mut stats = Vec::new();
        if self.comments > 0 {
            stats.push(plural(self.comments, "comment"));
        }
        if self.review_comments > 0 {
            stats.push(plural(self.review_comments, "review comment"));
        }
        (!stats.is_empty()).then(|| stats.join(", "))
    }

    fn timeline(&self) -> String {
        if let Some(merged_at) = &self.merged_at {
            format!("merged on {}", format_date(merged_at))
        } else if let Some(closed_at) = &self.closed_at {
            format!("closed on {}", format_date(closed_at))
        } else {
            format!("created on {}", format_date(&self.created_at))
        }
    }
}

impl SourceEntity for GithubPullRequest {
    fn cursor(&self) -> EtlCursor {
        EtlCursor::new(self.updated_at, self.id.clone())
    }
}

impl EmbeddingDescriptor for GithubPullRequest {
    const ENTITY_TYPE: &'static str = "pull_request";

    fn embedding_text(&self) -> String {
        let action = if self.author.is_some() { "created" } else { "have" };
        let mut parts = vec![format!(
            "I {action} PR #{} '{}'",
            self.number,
            sanitize(&self.title, 300)
        )];

        if let Some(repo) = &self.repository_full_name {
            parts.push(format!("in repository {repo}"));
        }
        parts.extend(self.state_info());
        parts.extend(self.code_stats());
        parts.extend(self.review_stats());

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
        if let Some(milestone) = &self.milestone {
            parts.push(format!("milestone: {milestone}"));
        }
        if let (Some(head), Some(base)) = (&self.head_ref, &self.base_ref) {
            parts.push(format!("from {head} to {base}"));
        }
        parts.push(self.timeline());

        format!("{}.", parts.join(", "))
    }

    fn payload_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("number".into(), json!(self.number));
        fields.insert("title".into(), json!(sanitize(&self.title, 500)));
        insert_opt(
            &mut fields,
            "repositoryFullName",
            self.repository_full_name.as_ref().map(|r| json!(r)),
        );
        fields.insert("state".into(), json!(self.state));
        fields.insert("draft".into(), json!(self.draft));
        fields.insert("merged".into(), json!(self.merged));
        insert_opt(&mut fields, "author", self.author.as_ref().map(|a| json!(a)));
        fields.insert("additions".into(), json!(self.additions));
        fields.insert("deletions".into(), json!(self.deletions));
        fields.insert("labels".into(), json!(self.labels));
        fields.insert("createdAt".into(), timestamp_value(&self.created_at));
        insert_opt(&mut fields, "mergedAt", self.merged_at.as_ref().map(timestamp_value));
        insert_opt(&mut fields, "closedAt", self.closed_at.as_ref().map(timestamp_value));
        fields
    }

    fn payload_indexes() -> Vec<(&'static str, PayloadSchema)> {
        vec![
            ("metadata.repositoryFullName", PayloadSchema::Keyword),
            ("metadata.state", PayloadSchema::Keyword),
            ("metadata.mergedAt", PayloadSchema::Datetime),
            ("metadata.createdAt", PayloadSchema::Datetime),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pull_request() -> GithubPullRequest {
        let created = Utc.with_ymd_and_hms(2024, 2, 20, 9, 0, 0).unwrap();
        GithubPullRequest {
            id: "pr-42".into(),
            created_at: created,
            updated_at: created,
            number: 42,
            title: "Add retry to vector upserts".into(),
            repository_full_name: Some("acme/indexer".into()),
            state: "closed".into(),
            draft: false,
            merged: true,
            author: Some("dana".into()),
            merged_by: Some("lee".into()),
            additions: 120,
            deletions: 8,
            changed_files: 1,
            commits: 3,
            comments: 2,
            review_comments: 1,
            labels: vec!["etl".into(), "reliability".into()],
            milestone: None,
            head_ref: Some("retry-upserts".into()),
            base_ref: Some("main".into()),
            merged_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            closed_at: None,
        }
    }

    #[test]
    fn describes_a_merged_pull_request() {
        assert_eq!(
            pull_request().embedding_text(),
            "I created PR #42 'Add retry to vector upserts', in repository acme/indexer, \
             merged by lee, across +120 -8 lines, 1 file, 3 commits, 2 comments, \
             1 review comment, labeled as etl, reliability, from retry-upserts to main, \
             merged on March 1, 2024."
        );
    }

    #[test]
    fn open_draft_without_author() {
        let mut pr = pull_request();
        pr.merged = false;
        pr.merged_at = None;
        pr.state = "open".into();
        pr.draft = true;
        pr.author = None;
        let text = pr.embedding_text();
        assert!(text.starts_with("I have PR #42"));
        assert!(text.contains(", draft PR,"));
        assert!(text.ends_with("created on February 20, 2024."));
        assert!(!pr.payload_fields().contains_key("mergedAt"));
    }
}
