use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        source::{EtlCursor, SourceStore},
        types::sync_state::{SyncState, SyncStateStore},
        vector::{
            CollectionConfig, Condition, Filter, InMemoryVectorStore, OrderBy, PayloadSchema,
            ScoredPoint, SearchRequest, VectorPoint, VectorStore,
        },
    },
    utils::{
        embedding::Embedder,
        embedding_service::{EmbeddingOptions, EmbeddingService},
    },
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{IndexingConfig, IndexingJob, IndexingPipeline, IndexingTuning};
use crate::{ids::deterministic_id, sources::SpotifyTrack};

const COLLECTION: &str = "personal_index";
const CONNECTOR: &str = "local";

/// Fails on any text mentioning "poison", otherwise returns a small fixed-size vector.
struct TestEmbedder;

#[async_trait]
impl Embedder for TestEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        if text.contains("poison") {
            return Err(AppError::Validation("unembeddable row".into()));
        }
        let length = text.chars().count() as f32;
        Ok(vec![1.0, length.max(1.0).ln(), 0.5, 0.25])
    }

    fn dimension(&self) -> usize {
        4
    }
}

/// Delegates to an in-memory store but fails every upsert after the first `allowed`.
struct FlakyUpsertStore {
    inner: InMemoryVectorStore,
    allowed: usize,
    upserts: AtomicUsize,
}

#[async_trait]
impl VectorStore for FlakyUpsertStore {
    async fn create_collection(&self, config: &CollectionConfig) -> Result<(), AppError> {
        self.inner.create_collection(config).await
    }

    async fn create_payload_index(
        &self,
        collection: &str,
        field: &str,
        schema: PayloadSchema,
    ) -> Result<(), AppError> {
        self.inner
            .create_payload_index(collection, field, schema)
            .await
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), AppError> {
        if self.upserts.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(AppError::VectorStore("vector store unavailable".into()));
        }
        self.inner.upsert(collection, points).await
    }

    async fn search(
        &self,
        collection: &str,
        request: SearchRequest,
    ) -> Result<Vec<ScoredPoint>, AppError> {
        self.inner.search(collection, request).await
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<Filter>,
        order_by: Option<OrderBy>,
        limit: usize,
    ) -> Result<Vec<VectorPoint>, AppError> {
        self.inner.scroll(collection, filter, order_by, limit).await
    }

    async fn count(&self, collection: &str, filter: Option<Filter>) -> Result<usize, AppError> {
        self.inner.count(collection, filter).await
    }
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, minute, 0).unwrap()
}

fn track(id: &str, name: &str, minute: u32) -> SpotifyTrack {
    SpotifyTrack {
        id: id.to_string(),
        created_at: at(0),
        updated_at: at(minute),
        name: name.to_string(),
        artist: "Nina Simone".to_string(),
        album: Some("Pastel Blues".to_string()),
        album_type: None,
        release_date: Some("1965-10-01".to_string()),
        duration_ms: 610_000,
        explicit: false,
        popularity: Some(55),
        added_at: Some(at(minute)),
    }
}

async fn setup_db(rows: Vec<SpotifyTrack>) -> Arc<SurrealDbClient> {
    let db = SurrealDbClient::memory("indexing_test", &Uuid::new_v4().to_string())
        .await
        .expect("Failed to create in-memory SurrealDB");
    db.ensure_initialized().await.expect("Failed to initialize schema");
    for row in rows {
        db.store_item(row).await.expect("Failed to seed row");
    }
    Arc::new(db)
}

fn test_tuning() -> IndexingTuning {
    IndexingTuning {
        extract_page_size: 2,
        batch_size: 1,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 2,
        max_retries: 1,
        ..IndexingTuning::default()
    }
}

fn embeddings() -> Arc<EmbeddingService> {
    Arc::new(EmbeddingService::new(
        Arc::new(TestEmbedder),
        EmbeddingOptions {
            max_retries: 1,
            retry_delay_ms: 1,
            ..EmbeddingOptions::default()
        },
    ))
}

fn pipeline_with(
    db: &Arc<SurrealDbClient>,
    vectors: Arc<dyn VectorStore>,
    tuning: IndexingTuning,
) -> IndexingPipeline<SpotifyTrack> {
    let source: Arc<dyn SourceStore<SpotifyTrack>> = Arc::<SurrealDbClient>::clone(db);
    let sync_state: Arc<dyn SyncStateStore> = Arc::<SurrealDbClient>::clone(db);
    IndexingPipeline::new(
        source,
        sync_state,
        vectors,
        embeddings(),
        IndexingConfig::new(COLLECTION, CONNECTOR).with_tuning(tuning),
    )
}

fn pipeline(
    db: &Arc<SurrealDbClient>,
    vectors: Arc<dyn VectorStore>,
) -> IndexingPipeline<SpotifyTrack> {
    pipeline_with(db, vectors, test_tuning())
}

async fn stored_cursor(db: &SurrealDbClient) -> Option<EtlCursor> {
    db.get_state(CONNECTOR, "spotify_track")
        .await
        .expect("get state")
        .and_then(|state| state.cursor())
}

#[tokio::test]
async fn indexes_rows_and_persists_cursor() {
    let db = setup_db(vec![
        track("b", "Sinnerman", 2),
        track("a", "Strange Fruit", 1),
        track("c", "Be My Husband", 3),
    ])
    .await;
    let vectors = Arc::new(InMemoryVectorStore::new());
    let pipeline = pipeline(&db, vectors.clone());

    let report = pipeline
        .run(10, &CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(report.extracted, 3);
    assert_eq!(report.indexed, 3);
    assert_eq!(report.dropped, 0);
    assert_eq!(report.batches, 2);
    assert_eq!(report.cursor, Some(EtlCursor::new(at(3), "c")));
    assert_eq!(stored_cursor(&db).await, Some(EtlCursor::new(at(3), "c")));

    let indexed = vectors
        .count(
            COLLECTION,
            Some(Filter::must(vec![Condition::match_any(
                "metadata.__type",
                ["track"],
            )])),
        )
        .await
        .expect("count");
    assert_eq!(indexed, 3);
    assert!(vectors.has_payload_index(COLLECTION, "metadata.__type").await);
    assert!(vectors.has_payload_index(COLLECTION, "metadata.artist").await);

    let point = vectors
        .get_point(COLLECTION, &deterministic_id(COLLECTION, "spotify_track:a"))
        .await
        .expect("point for row a");
    let metadata = &point.payload["metadata"];
    assert_eq!(metadata["id"], "a");
    assert_eq!(metadata["__source"], "etl");
    assert_eq!(metadata["__table"], "spotify_track");
    assert_eq!(metadata["__collection"], COLLECTION);
    assert!(metadata.get("updatedAt").is_none());
    assert!(point.payload["content"]
        .as_str()
        .is_some_and(|content| content.starts_with("Saved track: \"Strange Fruit\"")));
    assert!(point.sparse_vector.is_some());

    let again = pipeline
        .run(10, &CancellationToken::new())
        .await
        .expect("second run");
    assert_eq!(again.extracted, 0);
    assert_eq!(again.batches, 0);
}

#[tokio::test]
async fn poison_row_is_dropped_but_cursor_moves_past_it() {
    let db = setup_db(vec![
        track("a", "Feeling Good", 1),
        track("b", "poison pill", 2),
    ])
    .await;
    let vectors = Arc::new(InMemoryVectorStore::new());
    let pipeline = pipeline(&db, vectors.clone());

    let report = pipeline
        .run(10, &CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(report.extracted, 2);
    assert_eq!(report.indexed, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(stored_cursor(&db).await, Some(EtlCursor::new(at(2), "b")));
    assert_eq!(vectors.count(COLLECTION, None).await.expect("count"), 1);
}

#[tokio::test]
async fn dropped_row_stays_skipped_until_it_is_updated() {
    let db = setup_db(vec![
        track("a", "Feeling Good", 1),
        track("b", "poison pill", 2),
    ])
    .await;
    let vectors = Arc::new(InMemoryVectorStore::new());
    let pipeline = pipeline(&db, vectors.clone());
    let cancel = CancellationToken::new();
    pipeline.run(10, &cancel).await.expect("first run");

    let rerun = pipeline.run(10, &cancel).await.expect("rerun");
    assert_eq!(rerun.extracted, 0);
    assert!(vectors
        .get_point(COLLECTION, &deterministic_id(COLLECTION, "spotify_track:b"))
        .await
        .is_none());

    db.upsert_item(track("b", "Four Women", 3))
        .await
        .expect("update row");
    let after_update = pipeline.run(10, &cancel).await.expect("run after update");

    assert_eq!(after_update.extracted, 1);
    assert_eq!(after_update.indexed, 1);
    assert_eq!(stored_cursor(&db).await, Some(EtlCursor::new(at(3), "b")));
    assert!(vectors
        .get_point(COLLECTION, &deterministic_id(COLLECTION, "spotify_track:b"))
        .await
        .is_some());
}

#[tokio::test]
async fn batch_of_only_poison_rows_still_advances() {
    let db = setup_db(vec![track("a", "poison", 1), track("b", "more poison", 2)]).await;
    let vectors = Arc::new(InMemoryVectorStore::new());

    let report = pipeline(&db, vectors.clone())
        .run(10, &CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(report.indexed, 0);
    assert_eq!(report.dropped, 2);
    assert_eq!(report.batches, 1);
    assert_eq!(stored_cursor(&db).await, Some(EtlCursor::new(at(2), "b")));
}

#[tokio::test]
async fn stored_cursor_with_empty_index_is_reset() {
    let db = setup_db(vec![track("a", "Ain't Got No", 1), track("b", "I Put a Spell", 2)]).await;
    let mut state = SyncState::new(CONNECTOR, "spotify_track");
    state.set_cursor(Some(EtlCursor::new(at(5), "z")));
    db.save_state(state).await.expect("save state");

    let vectors = Arc::new(InMemoryVectorStore::new());
    let report = pipeline(&db, vectors.clone())
        .run(10, &CancellationToken::new())
        .await
        .expect("run");

    assert!(report.cursor_reset);
    assert_eq!(report.indexed, 2);
    assert_eq!(stored_cursor(&db).await, Some(EtlCursor::new(at(2), "b")));
}

#[tokio::test]
async fn reprocessing_overwrites_instead_of_duplicating() {
    let db = setup_db(vec![track("a", "Lilac Wine", 1), track("b", "Wild Is the Wind", 2)]).await;
    let vectors = Arc::new(InMemoryVectorStore::new());
    let pipeline = pipeline(&db, vectors.clone());
    let cancel = CancellationToken::new();

    pipeline.run(10, &cancel).await.expect("first run");
    db.clear_cursor(CONNECTOR, "spotify_track")
        .await
        .expect("clear cursor");
    let report = pipeline.run(10, &cancel).await.expect("second run");

    assert!(!report.cursor_reset);
    assert_eq!(report.indexed, 2);
    assert_eq!(vectors.count(COLLECTION, None).await.expect("count"), 2);
}

#[tokio::test]
async fn limit_caps_rows_per_run() {
    let db = setup_db(vec![
        track("a", "Mood Indigo", 1),
        track("b", "Little Girl Blue", 2),
        track("c", "Plain Gold Ring", 3),
    ])
    .await;
    let vectors = Arc::new(InMemoryVectorStore::new());
    let pipeline = pipeline(&db, vectors);
    let cancel = CancellationToken::new();

    let first = pipeline.run(2, &cancel).await.expect("first run");
    assert_eq!(first.extracted, 2);
    assert_eq!(first.cursor, Some(EtlCursor::new(at(2), "b")));

    let second = pipeline.run(2, &cancel).await.expect("second run");
    assert_eq!(second.extracted, 1);
    assert_eq!(second.cursor, Some(EtlCursor::new(at(3), "c")));
}

#[tokio::test]
async fn failed_upsert_keeps_earlier_batches_committed() {
    let db = setup_db(vec![
        track("a", "Black Is the Color", 1),
        track("b", "Four Women", 2),
        track("c", "Baltimore", 3),
    ])
    .await;
    let tuning = IndexingTuning {
        extract_page_size: 1,
        ..test_tuning()
    };
    let store = Arc::new(FlakyUpsertStore {
        inner: InMemoryVectorStore::new(),
        allowed: 1,
        upserts: AtomicUsize::new(0),
    });
    let pipeline = pipeline_with(&db, store, tuning);

    let err = pipeline
        .run(10, &CancellationToken::new())
        .await
        .expect_err("upsert should fail");

    assert!(matches!(err, AppError::RetriesExhausted { .. }));
    assert_eq!(stored_cursor(&db).await, Some(EtlCursor::new(at(1), "a")));
}

#[tokio::test]
async fn cancelled_run_stops_before_extracting() {
    let db = setup_db(vec![track("a", "Sinnerman", 1)]).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = pipeline(&db, Arc::new(InMemoryVectorStore::new()))
        .execute(10, &cancel)
        .await
        .expect_err("cancelled");

    assert!(matches!(err, AppError::Cancelled));
    assert!(stored_cursor(&db).await.is_none());
}
