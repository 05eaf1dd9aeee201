use common::storage::{
    source::{EtlCursor, SourceEntity},
    vector::PayloadSchema,
};
use serde_json::{json, Map, Value};

use super::{format_date, insert_opt, preview, sanitize, timestamp_value, EmbeddingDescriptor};

common::stored_object!(LinearIssue, "linear_issue", {
    /// Team-scoped key such as `ENG-12`.
    identifier: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    /// Workflow state name.
    state: String,
    /// 0 none, 1 urgent, 2 high, 3 medium, 4 low.
    #[serde(default)]
    priority: u8,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    team_name: Option<String>,
    #[serde(default)]
    assignee: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    /// `YYYY-MM-DD`
    #[serde(default)]
    due_date: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    completed_at: Option<DateTime<Utc>>
});

impl LinearIssue {
    fn priority_label(&self) -> Option<&'static str> {
        match self.priority {
            1 => Some("urgent priority"),
            2 => Some("high priority"),
            3 => Some("medium priority"),
            4 => Some("low priority"),
            _ => None,
        }
    }
}

impl SourceEntity for LinearIssue {
    fn cursor(&self) -> EtlCursor {
        EtlCursor::new(self.updated_at, self.id.clone())
    }
}

impl EmbeddingDescriptor for LinearIssue {
    const ENTITY_TYPE: &'static str = "issue";

    fn embedding_text(&self) -> String {
        let mut parts = vec![format!(
            "Linear issue {} '{}'",
            self.identifier,
            sanitize(&self.title, 300)
        )];

        if let Some(team) = &self.team_name {
            parts.push(format!("in team {team}"));
        }
        parts.push(format!("status {}", self.state));
        parts.extend(self.priority_label().map(str::to_string));
        if let Some(assignee) = &self.assignee {
            parts.push(format!("assigned to {assignee}"));
        }
        if let Some(project) = &self.project {
            parts.push(format!("project {project}"));
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
        if let Some(due) = &self.due_date {
            parts.push(format!("due {due}"));
        }
        if let Some(description) = self.description.as_deref().filter(|d| !d.trim().is_empty()) {
            parts.push(preview(description, 200));
        }
        parts.push(match &self.completed_at {
            Some(completed_at) => format!("completed on {}", format_date(completed_at)),
            None => format!("created on {}", format_date(&self.created_at)),
        });

        format!("{}.", parts.join(", "))
    }

    fn payload_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("source".into(), json!("linear"));
        fields.insert("identifier".into(), json!(self.identifier));
        fields.insert("title".into(), json!(sanitize(&self.title, 500)));
        fields.insert("state".into(), json!(self.state));
        fields.insert("priority".into(), json!(self.priority));
        insert_opt(&mut fields, "teamId", self.team_id.as_ref().map(|t| json!(t)));
        insert_opt(&mut fields, "teamName", self.team_name.as_ref().map(|t| json!(t)));
        insert_opt(&mut fields, "assignee", self.assignee.as_ref().map(|a| json!(a)));
        insert_opt(&mut fields, "project", self.project.as_ref().map(|p| json!(p)));
        fields.insert("labels".into(), json!(self.labels));
        insert_opt(&mut fields, "dueDate", self.due_date.as_ref().map(|d| json!(d)));
        fields.insert("createdAt".into(), timestamp_value(&self.created_at));
        insert_opt(
            &mut fields,
            "completedAt",
            self.completed_at.as_ref().map(timestamp_value),
        );
        fields
    }

    fn payload_indexes() -> Vec<(&'static str, PayloadSchema)> {
        vec![
            ("metadata.state", PayloadSchema::Keyword),
            ("metadata.teamId", PayloadSchema::Keyword),
            ("metadata.createdAt", PayloadSchema::Datetime),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn issue() -> LinearIssue {
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        LinearIssue {
            id: "lin-1".into(),
            created_at: created,
            updated_at: created,
            identifier: "ENG-12".into(),
            title: "Backfill calendar events".into(),
            description: None,
            state: "In Progress".into(),
            priority: 2,
            team_id: Some("team-eng".into()),
            team_name: Some("Platform".into()),
            assignee: Some("dana".into()),
            project: Some("Q3 Indexing".into()),
            labels: vec!["etl".into()],
            due_date: Some("2024-07-01".into()),
            completed_at: None,
        }
    }

    #[test]
    fn describes_an_active_issue() {
        assert_eq!(
            issue().embedding_text(),
            "Linear issue ENG-12 'Backfill calendar events', in team Platform, \
             status In Progress, high priority, assigned to dana, project Q3 Indexing, \
             labeled as etl, due 2024-07-01, created on June 1, 2024."
        );
    }

    #[test]
    fn unprioritized_completed_issue() {
        let mut issue = issue();
        issue.priority = 0;
        issue.state = "Done".into();
        issue.completed_at = Some(Utc.with_ymd_and_hms(2024, 6, 20, 17, 0, 0).unwrap());
        let text = issue.embedding_text();
        assert!(!text.contains("priority"));
        assert!(text.ends_with("completed on June 20, 2024."));
        assert_eq!(issue.payload_fields()["teamId"], json!("team-eng"));
    }
}
