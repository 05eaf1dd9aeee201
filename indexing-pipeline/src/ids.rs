use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Point id for a source row: the first 16 bytes of `sha256("{collection}:{source_id}")`
/// rendered as a UUID, so re-indexing a row overwrites its point.
pub fn deterministic_id(collection: &str, source_id: &str) -> String {
    let digest = Sha256::digest(format!("{collection}:{source_id}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_id() {
        let first = deterministic_id("spotify_tracks", "track-123");
        assert_eq!(first, deterministic_id("spotify_tracks", "track-123"));
        assert_ne!(first, deterministic_id("spotify_tracks", "track-124"));
        assert_ne!(first, deterministic_id("other", "track-123"));
        assert!(Uuid::parse_str(&first).is_ok());
    }
}
