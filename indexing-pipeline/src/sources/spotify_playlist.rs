use common::storage::{
    source::{EtlCursor, SourceEntity},
    vector::PayloadSchema,
};
use serde_json::{json, Map, Value};

use super::{insert_opt, plural, preview, sanitize, timestamp_value, EmbeddingDescriptor};

common::stored_object!(SpotifyPlaylist, "spotify_playlist", {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    public: bool,
    #[serde(default)]
    collaborative: bool,
    #[serde(default)]
    track_count: u64,
    #[serde(default)]
    followers: u64
});

impl SpotifyPlaylist {
    fn visibility(&self) -> &'static str {
        if self.collaborative {
            "collaborative"
        } else if self.public {
            "public"
        } else {
            "private"
        }
    }
}

impl SourceEntity for SpotifyPlaylist {
    fn cursor(&self) -> EtlCursor {
        EtlCursor::new(self.updated_at, self.id.clone())
    }
}

impl EmbeddingDescriptor for SpotifyPlaylist {
    const ENTITY_TYPE: &'static str = "playlist";

    fn embedding_text(&self) -> String {
        let mut parts = vec![
            format!("Playlist: \"{}\"", sanitize(&self.name, 300)),
            self.visibility().to_string(),
        ];
        if let Some(owner) = &self.owner {
            parts.push(format!("by {owner}"));
        }
        if let Some(description) = self.description.as_deref().filter(|d| !d.trim().is_empty()) {
            parts.push(preview(description, 200));
        }
        if self.track_count > 0 {
            parts.push(plural(self.track_count, "track"));
        }
        if self.followers > 0 {
            parts.push(plural(self.followers, "follower"));
        }
        parts.join(", ")
    }

    fn payload_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(sanitize(&self.name, 500)));
        insert_opt(
            &mut fields,
            "description",
            self.description.as_deref().map(|d| json!(sanitize(d, 1000))),
        );
        insert_opt(&mut fields, "owner", self.owner.as_ref().map(|o| json!(o)));
        fields.insert("public".into(), json!(self.public));
        fields.insert("collaborative".into(), json!(self.collaborative));
        fields.insert("trackCount".into(), json!(self.track_count));
        fields.insert("followers".into(), json!(self.followers));
        fields.insert("createdAt".into(), timestamp_value(&self.created_at));
        fields
    }

    fn payload_indexes() -> Vec<(&'static str, PayloadSchema)> {
        vec![
            ("metadata.name", PayloadSchema::Keyword),
            ("metadata.owner", PayloadSchema::Keyword),
        ]
    }
}
