use common::storage::{
    source::{EtlCursor, SourceEntity},
    vector::PayloadSchema,
};
use serde_json::{json, Map, Value};

use super::{
    format_date, format_time, insert_opt, plural, preview, sanitize, timestamp_value,
    EmbeddingDescriptor,
};

common::stored_object!(CalendarEvent, "google_calendar_event", {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    start_time: DateTime<Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    is_all_day: bool,
    #[serde(default)]
    hangout_link: Option<String>,
    #[serde(default)]
    attendees_count: u64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    recurring_event_id: Option<String>
});

impl CalendarEvent {
    fn duration_label(&self) -> Option<String> {
        let end = self.end_time?;
        let minutes = end.signed_duration_since(self.start_time).num_minutes();
        if minutes < 0 {
            return None;
        }
        Some(if minutes >= 60 {
            let (hours, rest) = (minutes / 60, minutes % 60);
            if rest > 0 {
                format!("({hours}h {rest}m duration)")
            } else {
                format!("({hours}h duration)")
            }
        } else {
            format!("({minutes}m duration)")
        })
    }
}

impl SourceEntity for CalendarEvent {
    fn cursor(&self) -> EtlCursor {
        EtlCursor::new(self.updated_at, self.id.clone())
    }
}

impl EmbeddingDescriptor for CalendarEvent {
    const ENTITY_TYPE: &'static str = "calendar_event";

    fn embedding_text(&self) -> String {
        let mut parts = vec!["Calendar event".to_string()];

        let title = sanitize(&self.title, 300);
        if !title.is_empty() {
            parts.push(format!("\"{title}\""));
        }

        let time = if self.is_all_day {
            "all day".to_string()
        } else {
            format_time(&self.start_time)
        };
        parts.push(format!(
            "on {}, {} at {time}",
            self.start_time.format("%A"),
            format_date(&self.start_time)
        ));
        parts.extend(self.duration_label());

        if let Some(location) = self.location.as_deref().map(|l| sanitize(l, 255)) {
            if !location.is_empty() {
                parts.push(format!("at {location}"));
            }
        }
        if self.hangout_link.is_some() {
            parts.push("with video call".to_string());
        }
        if let Some(description) = self.description.as_deref().map(|d| preview(d, 300)) {
            if !description.is_empty() {
                parts.push(format!("Description: {description}"));
            }
        }
        if self.attendees_count > 0 {
            parts.push(format!("with {}", plural(self.attendees_count, "attendee")));
        }
        if let Some(status) = self.status.as_deref().filter(|s| *s != "confirmed") {
            parts.push(format!("({status})"));
        }
        if self.recurring_event_id.is_some() {
            parts.push("(recurring)".to_string());
        }

        parts.join(", ")
    }

    fn payload_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("title".into(), json!(sanitize(&self.title, 500)));
        insert_opt(
            &mut fields,
            "description",
            self.description.as_deref().map(|d| json!(sanitize(d, 2000))),
        );
        insert_opt(
            &mut fields,
            "location",
            self.location.as_deref().map(|l| json!(sanitize(l, 255))),
        );
        fields.insert("startTime".into(), timestamp_value(&self.start_time));
        insert_opt(&mut fields, "endTime", self.end_time.as_ref().map(timestamp_value));
        fields.insert("isAllDay".into(), json!(self.is_all_day));
        fields.insert("attendeesCount".into(), json!(self.attendees_count));
        insert_opt(&mut fields, "status", self.status.as_ref().map(|s| json!(s)));
        insert_opt(
            &mut fields,
            "recurringEventId",
            self.recurring_event_id.as_ref().map(|r| json!(r)),
        );
        fields
    }

    fn payload_indexes() -> Vec<(&'static str, PayloadSchema)> {
        vec![
            ("metadata.status", PayloadSchema::Keyword),
            ("metadata.startTime", PayloadSchema::Datetime),
        ]
    }
}
