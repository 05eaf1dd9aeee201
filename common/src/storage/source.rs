use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Datetime as SurrealDatetime;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::StoredObject},
};

/// Position in a source table: the `(updated_at, id)` of the last processed row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EtlCursor {
    pub timestamp: DateTime<Utc>,
    pub id: String,
}

impl EtlCursor {
    pub fn new(timestamp: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self {
            timestamp,
            id: id.into(),
        }
    }
}

/// A row type that can be extracted in cursor order.
pub trait SourceEntity: StoredObject + Clone + Send + Sync + 'static {
    fn cursor(&self) -> EtlCursor;
}

/// Ordered, cursor-based reads from a relational source.
#[async_trait]
pub trait SourceStore<T: SourceEntity>: Send + Sync {
    /// Up to `limit` rows strictly after `cursor`, ascending by `(updated_at, id)`.
    async fn extract_after(
        &self,
        cursor: Option<&EtlCursor>,
        limit: usize,
    ) -> Result<Vec<T>, AppError>;

    async fn count_after(&self, cursor: Option<&EtlCursor>) -> Result<usize, AppError>;
}

const AFTER_CURSOR: &str = "updated_at > $ts OR (updated_at = $ts AND meta::id(id) > $cursor_id)";

#[derive(Debug, Deserialize)]
struct CountResult {
    count: usize,
}

#[async_trait]
impl<T: SourceEntity> SourceStore<T> for SurrealDbClient {
    async fn extract_after(
        &self,
        cursor: Option<&EtlCursor>,
        limit: usize,
    ) -> Result<Vec<T>, AppError> {
        let mut response = match cursor {
            Some(cursor) => {
                self.client
                    .query(format!(
                        "SELECT * FROM type::table($table) WHERE {AFTER_CURSOR} \
                         ORDER BY updated_at ASC, id ASC LIMIT $limit"
                    ))
                    .bind(("table", T::table_name()))
                    .bind(("ts", SurrealDatetime::from(cursor.timestamp)))
                    .bind(("cursor_id", cursor.id.clone()))
                    .bind(("limit", limit as i64))
                    .await
            }
            None => {
                self.client
                    .query(
                        "SELECT * FROM type::table($table) \
                         ORDER BY updated_at ASC, id ASC LIMIT $limit",
                    )
                    .bind(("table", T::table_name()))
                    .bind(("limit", limit as i64))
                    .await
            }
        }
        .map_err(AppError::Database)?;

        let rows: Vec<T> = response.take(0).map_err(AppError::Database)?;
        Ok(rows)
    }

    async fn count_after(&self, cursor: Option<&EtlCursor>) -> Result<usize, AppError> {
        let mut response = match cursor {
            Some(cursor) => {
                self.client
                    .query(format!(
                        "SELECT count() AS count FROM type::table($table) \
                         WHERE {AFTER_CURSOR} GROUP ALL"
                    ))
                    .bind(("table", T::table_name()))
                    .bind(("ts", SurrealDatetime::from(cursor.timestamp)))
                    .bind(("cursor_id", cursor.id.clone()))
                    .await
            }
            None => {
                self.client
                    .query("SELECT count() AS count FROM type::table($table) GROUP ALL")
                    .bind(("table", T::table_name()))
                    .await
            }
        }
        .map_err(AppError::Database)?;

        let result: Option<CountResult> = response.take(0).map_err(AppError::Database)?;
        Ok(result.map_or(0, |r| r.count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stored_object;
    use chrono::TimeZone;
    use uuid::Uuid;

    stored_object!(Note, "note", {
        body: String
    });

    impl SourceEntity for Note {
        fn cursor(&self) -> EtlCursor {
            EtlCursor::new(self.updated_at, self.id.clone())
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    fn note(id: &str, minute: u32) -> Note {
        Note {
            id: id.to_string(),
            created_at: at(0),
            updated_at: at(minute),
            body: format!("note {id}"),
        }
    }

    async fn seeded() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        for n in [note("c", 2), note("a", 1), note("b", 2), note("d", 3)] {
            db.store_item(n).await.expect("store");
        }
        db
    }

    #[tokio::test]
    async fn extract_orders_by_timestamp_then_id() {
        let db = seeded().await;
        let rows: Vec<Note> = db.extract_after(None, 10).await.expect("extract");
        let ids: Vec<_> = rows.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn extract_after_cursor_is_strict_on_ties() {
        let db = seeded().await;
        let cursor = EtlCursor::new(at(2), "b");

        let rows: Vec<Note> = db.extract_after(Some(&cursor), 10).await.expect("extract");
        let ids: Vec<_> = rows.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d"]);

        let remaining = <SurrealDbClient as SourceStore<Note>>::count_after(&db, Some(&cursor))
            .await
            .expect("count");
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn extract_respects_limit() {
        let db = seeded().await;
        let rows: Vec<Note> = db.extract_after(None, 2).await.expect("extract");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.last().map(|n| n.cursor()), Some(EtlCursor::new(at(2), "b")));
    }

    #[test]
    fn cursors_order_lexicographically() {
        assert!(EtlCursor::new(at(1), "z") < EtlCursor::new(at(2), "a"));
        assert!(EtlCursor::new(at(2), "a") < EtlCursor::new(at(2), "b"));
    }
}
