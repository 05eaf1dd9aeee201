use common::storage::{
    source::{EtlCursor, SourceEntity},
    vector::PayloadSchema,
};
use serde_json::{json, Map, Value};

use super::{
    format_date, format_duration_ms, format_time, insert_opt, sanitize, timestamp_value,
    EmbeddingDescriptor,
};

common::stored_object!(SpotifyRecentlyPlayed, "spotify_recently_played", {
    track_name: String,
    artist: String,
    #[serde(default)]
    album: Option<String>,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    explicit: bool,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    played_at: DateTime<Utc>,
    /// Spotify playback context type: `playlist`, `album`, `artist` or `collection`.
    #[serde(default)]
    context_type: Option<String>
});

impl SpotifyRecentlyPlayed {
    fn context_label(&self) -> Option<&'static str> {
        match self.context_type.as_deref()? {
            "playlist" => Some("via playlist"),
            "album" => Some("via album"),
            "artist" => Some("via artist radio"),
            "collection" => Some("from liked songs"),
            _ => None,
        }
    }
}

impl SourceEntity for SpotifyRecentlyPlayed {
    fn cursor(&self) -> EtlCursor {
        EtlCursor::new(self.updated_at, self.id.clone())
    }
}

impl EmbeddingDescriptor for SpotifyRecentlyPlayed {
    const ENTITY_TYPE: &'static str = "recently_played";

    fn embedding_text(&self) -> String {
        let mut parts = vec![
            format!(
                "Played: \"{}\" by {}",
                sanitize(&self.track_name, 200),
                sanitize(&self.artist, 200)
            ),
            format!(
                "on {} at {}",
                format_date(&self.played_at),
                format_time(&self.played_at)
            ),
        ];
        if let Some(album) = self.album.as_deref().filter(|a| !a.trim().is_empty()) {
            parts.push(format!("from \"{}\"", sanitize(album, 200)));
        }
        parts.push(format!("({})", format_duration_ms(self.duration_ms)));
        if let Some(label) = self.context_label() {
            parts.push(label.to_string());
        }
        if self.explicit {
            parts.push("explicit".to_string());
        }
        parts.join(", ")
    }

    fn payload_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("trackName".into(), json!(sanitize(&self.track_name, 500)));
        fields.insert("artist".into(), json!(sanitize(&self.artist, 500)));
        insert_opt(&mut fields, "album", self.album.as_deref().map(|a| json!(sanitize(a, 500))));
        fields.insert("durationMs".into(), json!(self.duration_ms));
        fields.insert("explicit".into(), json!(self.explicit));
        fields.insert("playedAt".into(), timestamp_value(&self.played_at));
        insert_opt(&mut fields, "context", self.context_type.as_ref().map(|c| json!(c)));
        fields
    }

    fn payload_indexes() -> Vec<(&'static str, PayloadSchema)> {
        vec![
            ("metadata.artist", PayloadSchema::Keyword),
            ("metadata.playedAt", PayloadSchema::Datetime),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn describes_a_play_with_context() {
        let played_at = Utc.with_ymd_and_hms(2024, 11, 3, 18, 45, 0).unwrap();
        let play = SpotifyRecentlyPlayed {
            id: "play-1".into(),
            created_at: played_at,
            updated_at: played_at,
            track_name: "Teardrop".into(),
            artist: "Massive Attack".into(),
            album: Some("Mezzanine".into()),
            duration_ms: 330_000,
            explicit: false,
            played_at,
            context_type: Some("collection".into()),
        };

        assert_eq!(
            play.embedding_text(),
            "Played: \"Teardrop\" by Massive Attack, on November 3, 2024 at 6:45 PM, \
             from \"Mezzanine\", (5:30), from liked songs"
        );
        assert_eq!(
            play.payload_fields().get("playedAt"),
            Some(&json!("2024-11-03T18:45:00.000Z"))
        );
    }
}
