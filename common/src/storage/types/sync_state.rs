use async_trait::async_trait;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, source::EtlCursor},
    stored_object,
};

stored_object!(SyncState, "sync_state", {
    connector_name: String,
    entity_type: String,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    cursor_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    cursor_id: Option<String>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    last_sync_time: DateTime<Utc>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    last_etl_run: DateTime<Utc>
});

impl SyncState {
    pub fn key(connector_name: &str, entity_type: &str) -> String {
        format!("{connector_name}__{entity_type}")
    }

    pub fn new(connector_name: &str, entity_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Self::key(connector_name, entity_type),
            created_at: now,
            updated_at: now,
            connector_name: connector_name.to_string(),
            entity_type: entity_type.to_string(),
            cursor_timestamp: None,
            cursor_id: None,
            last_sync_time: now,
            last_etl_run: now,
        }
    }

    pub fn cursor(&self) -> Option<EtlCursor> {
        match (&self.cursor_timestamp, &self.cursor_id) {
            (Some(timestamp), Some(id)) => Some(EtlCursor::new(*timestamp, id.clone())),
            _ => None,
        }
    }

    pub fn set_cursor(&mut self, cursor: Option<EtlCursor>) {
        let now = Utc::now();
        match cursor {
            Some(cursor) => {
                self.cursor_timestamp = Some(cursor.timestamp);
                self.cursor_id = Some(cursor.id);
                self.last_sync_time = now;
            }
            None => {
                self.cursor_timestamp = None;
                self.cursor_id = None;
            }
        }
        self.last_etl_run = now;
        self.updated_at = now;
    }

    pub async fn ensure_initialized(db: &SurrealDbClient) -> Result<(), AppError> {
        let response = db
            .client
            .query(
                "DEFINE TABLE IF NOT EXISTS sync_state SCHEMALESS;
                 DEFINE INDEX IF NOT EXISTS idx_sync_state_key ON TABLE sync_state \
                 FIELDS connector_name, entity_type UNIQUE;",
            )
            .await
            .map_err(AppError::Database)?;
        response.check().map_err(AppError::Database)?;
        Ok(())
    }
}

/// Persisted ETL progress, one record per `(connector, entity type)`.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn get_state(
        &self,
        connector_name: &str,
        entity_type: &str,
    ) -> Result<Option<SyncState>, AppError>;

    async fn save_state(&self, state: SyncState) -> Result<(), AppError>;

    async fn clear_state(&self, connector_name: &str, entity_type: &str) -> Result<(), AppError>;

    /// Keeps the record but forgets the cursor, forcing a full re-extract.
    async fn clear_cursor(&self, connector_name: &str, entity_type: &str) -> Result<(), AppError> {
        if let Some(mut state) = self.get_state(connector_name, entity_type).await? {
            state.set_cursor(None);
            self.save_state(state).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SyncStateStore for SurrealDbClient {
    async fn get_state(
        &self,
        connector_name: &str,
        entity_type: &str,
    ) -> Result<Option<SyncState>, AppError> {
        Ok(self
            .get_item::<SyncState>(&SyncState::key(connector_name, entity_type))
            .await?)
    }

    async fn save_state(&self, state: SyncState) -> Result<(), AppError> {
        self.upsert_item(state).await?;
        Ok(())
    }

    async fn clear_state(&self, connector_name: &str, entity_type: &str) -> Result<(), AppError> {
        let _deleted: Option<SyncState> = self
            .delete_item(&SyncState::key(connector_name, entity_type))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    async fn db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init");
        db
    }

    #[tokio::test]
    async fn state_round_trips_with_cursor() {
        let db = db().await;
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();

        let mut state = SyncState::new("local", "spotify_track");
        state.set_cursor(Some(EtlCursor::new(at, "track-9")));
        db.save_state(state).await.expect("save");

        let loaded = db
            .get_state("local", "spotify_track")
            .await
            .expect("get")
            .expect("state exists");
        assert_eq!(loaded.cursor(), Some(EtlCursor::new(at, "track-9")));
        assert_eq!(loaded.entity_type, "spotify_track");
    }

    #[tokio::test]
    async fn clear_cursor_keeps_record() {
        let db = db().await;
        let mut state = SyncState::new("local", "gmail_message");
        state.set_cursor(Some(EtlCursor::new(Utc::now(), "m-1")));
        db.save_state(state).await.expect("save");

        db.clear_cursor("local", "gmail_message").await.expect("clear cursor");

        let loaded = db
            .get_state("local", "gmail_message")
            .await
            .expect("get")
            .expect("state exists");
        assert!(loaded.cursor().is_none());
    }

    #[tokio::test]
    async fn clear_state_removes_record() {
        let db = db().await;
        db.save_state(SyncState::new("local", "github_pull_request"))
            .await
            .expect("save");
        db.clear_state("local", "github_pull_request")
            .await
            .expect("clear");
        assert!(db
            .get_state("local", "github_pull_request")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn missing_state_is_none() {
        let db = db().await;
        assert!(db.get_state("local", "nothing").await.expect("get").is_none());
    }
}
