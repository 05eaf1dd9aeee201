use common::storage::{
    source::{EtlCursor, SourceEntity},
    vector::PayloadSchema,
};
use serde_json::{json, Map, Value};

use super::{
    format_date, format_duration_ms, insert_opt, sanitize, timestamp_value, EmbeddingDescriptor,
};

common::stored_object!(SpotifyTrack, "spotify_track", {
    name: String,
    artist: String,
    #[serde(default)]
    album: Option<String>,
    #[serde(default)]
    album_type: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    explicit: bool,
    #[serde(default)]
    popularity: Option<u32>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    added_at: Option<DateTime<Utc>>
});

impl SourceEntity for SpotifyTrack {
    fn cursor(&self) -> EtlCursor {
        EtlCursor::new(self.updated_at, self.id.clone())
    }
}

impl EmbeddingDescriptor for SpotifyTrack {
    const ENTITY_TYPE: &'static str = "track";

    fn embedding_text(&self) -> String {
        let mut parts = vec![
            format!(
                "Saved track: \"{}\" by {}",
                sanitize(&self.name, 200),
                sanitize(&self.artist, 200)
            ),
            format!("({})", format_duration_ms(self.duration_ms)),
        ];

        if let Some(album) = self.album.as_deref().filter(|a| !a.trim().is_empty()) {
            parts.push(format!("from \"{}\"", sanitize(album, 200)));
        }
        if let Some(year) = self
            .release_date
            .as_deref()
            .and_then(|date| date.split('-').next())
            .filter(|year| !year.is_empty())
        {
            parts.push(format!("released {year}"));
        }
        if let Some(album_type) = self.album_type.as_deref().filter(|t| *t != "album") {
            parts.push(album_type.to_string());
        }
        if self.explicit {
            parts.push("explicit".to_string());
        }
        match self.popularity {
            Some(p) if p > 70 => parts.push("popular".to_string()),
            Some(p) if p > 0 && p < 30 => parts.push("underground".to_string()),
            _ => {}
        }
        if let Some(added_at) = &self.added_at {
            parts.push(format!("added {}", format_date(added_at)));
        }

        parts.join(", ")
    }

    fn payload_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(sanitize(&self.name, 500)));
        fields.insert("artist".into(), json!(sanitize(&self.artist, 500)));
        insert_opt(&mut fields, "album", self.album.as_deref().map(|a| json!(sanitize(a, 500))));
        insert_opt(&mut fields, "albumType", self.album_type.as_ref().map(|t| json!(t)));
        insert_opt(&mut fields, "releaseDate", self.release_date.as_ref().map(|d| json!(d)));
        fields.insert("durationMs".into(), json!(self.duration_ms));
        fields.insert("explicit".into(), json!(self.explicit));
        insert_opt(&mut fields, "popularity", self.popularity.map(|p| json!(p)));
        insert_opt(&mut fields, "addedAt", self.added_at.as_ref().map(timestamp_value));
        fields.insert("createdAt".into(), timestamp_value(&self.created_at));
        fields
    }

    fn payload_indexes() -> Vec<(&'static str, PayloadSchema)> {
        vec![
            ("metadata.artist", PayloadSchema::Keyword),
            ("metadata.name", PayloadSchema::Keyword),
            ("metadata.album", PayloadSchema::Keyword),
            ("metadata.addedAt", PayloadSchema::Datetime),
        ]
    }
}
