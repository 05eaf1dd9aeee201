use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{
    format_timestamp, validate_identifier, validate_path, CollectionConfig, Condition,
    Direction, Distance, Filter, OrderBy, PayloadSchema, ScoredPoint, SearchRequest,
    VectorPoint, VectorStore,
};
use crate::{error::AppError, storage::db::SurrealDbClient, utils::sparse::SparseVector};

/// One SurrealDB table per collection, with an HNSW index on `vector`.
#[derive(Clone)]
pub struct SurrealVectorStore {
    db: Arc<SurrealDbClient>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPoint {
    vector: Vec<f32>,
    sparse_vector: Option<SparseVector>,
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct SearchRow {
    point_id: String,
    distance: f32,
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct ScrollRow {
    point_id: String,
    vector: Vec<f32>,
    #[serde(default)]
    sparse_vector: Option<SparseVector>,
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: usize,
}

enum Binding {
    One(String),
    Many(Vec<String>),
}

/// A filter predicate with its positional parameters.
#[derive(Default)]
struct Clause {
    predicate: String,
    bindings: Vec<(String, Binding)>,
}

impl Clause {
    fn from_filter(filter: Option<&Filter>) -> Result<Self, AppError> {
        let mut clause = Clause::default();
        let Some(filter) = filter.filter(|f| !f.is_empty()) else {
            return Ok(clause);
        };

        let mut parts = Vec::new();
        for condition in &filter.must {
            parts.push(clause.condition_sql(condition)?);
        }
        if !filter.should.is_empty() {
            let mut any = Vec::new();
            for condition in &filter.should {
                any.push(clause.condition_sql(condition)?);
            }
            parts.push(format!("({})", any.join(" OR ")));
        }

        clause.predicate = parts.join(" AND ");
        Ok(clause)
    }

    fn where_sql(&self) -> String {
        if self.predicate.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.predicate)
        }
    }

    /// Predicate followed by `AND`, for prefixing another condition.
    fn and_sql(&self) -> String {
        if self.predicate.is_empty() {
            String::new()
        } else {
            format!("{} AND ", self.predicate)
        }
    }

    fn param(&mut self, binding: Binding) -> String {
        let name = format!("p{}", self.bindings.len());
        self.bindings.push((name.clone(), binding));
        format!("${name}")
    }

    fn condition_sql(&mut self, condition: &Condition) -> Result<String, AppError> {
        validate_path(condition.key())?;
        let field = format!("payload.{}", condition.key());

        match condition {
            Condition::Match { any, .. } => {
                let param = self.param(Binding::Many(any.clone()));
                Ok(format!("{field} IN {param}"))
            }
            Condition::Range { from, to, .. } => {
                let mut bounds = vec![format!("{field} != NONE")];
                if let Some(from) = from {
                    let param = self.param(Binding::One(format_timestamp(from)));
                    bounds.push(format!("{field} >= {param}"));
                }
                if let Some(to) = to {
                    let param = self.param(Binding::One(format_timestamp(to)));
                    bounds.push(format!("{field} <= {param}"));
                }
                Ok(format!("({})", bounds.join(" AND ")))
            }
        }
    }
}

/// Candidate list size for the HNSW search; never below the result count.
const MIN_KNN_EF: usize = 40;

impl SurrealVectorStore {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    /// Names defined under `section` of an `INFO FOR ...` result.
    async fn defined_names(
        &self,
        info_query: String,
        section: &str,
    ) -> Result<Vec<String>, AppError> {
        let mut response = self
            .db
            .client
            .query(info_query)
            .await
            .map_err(AppError::Database)?;
        let info: surrealdb::Value = response.take(0).map_err(AppError::Database)?;
        let info_json = serde_json::to_value(info)?;

        Ok(info_json
            .get("Object")
            .and_then(|o| o.get(section))
            .and_then(|s| s.get("Object"))
            .and_then(Value::as_object)
            .map(|defined| defined.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn define(&self, statement: String) -> Result<(), AppError> {
        self.db
            .client
            .query(statement)
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
        Ok(())
    }

    async fn run_with_clause<T>(
        &self,
        sql: String,
        collection: &str,
        clause: Clause,
        extra: Vec<(&'static str, Value)>,
    ) -> Result<Vec<T>, AppError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut query = self
            .db
            .client
            .query(sql)
            .bind(("collection", collection.to_string()));
        for (name, binding) in clause.bindings {
            query = match binding {
                Binding::One(value) => query.bind((name, value)),
                Binding::Many(values) => query.bind((name, values)),
            };
        }
        for (name, value) in extra {
            query = query.bind((name, value));
        }

        let mut response = query.await.map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)
    }
}

#[async_trait]
impl VectorStore for SurrealVectorStore {
    async fn create_collection(&self, config: &CollectionConfig) -> Result<(), AppError> {
        validate_identifier("collection", &config.name)?;
        let tables = self.defined_names("INFO FOR DB;".to_string(), "tables").await?;
        if tables.iter().any(|table| table == &config.name) {
            return Err(AppError::AlreadyExists(format!("collection '{}'", config.name)));
        }

        let distance = match config.distance {
            Distance::Cosine => "COSINE",
        };
        self.define(format!(
            "DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS idx_{table}_vector ON TABLE {table} FIELDS vector \
             HNSW DIMENSION {dimension} DIST {distance} TYPE F32 EFC {efc} M {m};",
            table = config.name,
            dimension = config.vector_size,
            efc = config.hnsw.ef_construction,
            m = config.hnsw.m,
        ))
        .await?;

        debug!(collection = %config.name, dimension = config.vector_size, "collection created");
        Ok(())
    }

    async fn create_payload_index(
        &self,
        collection: &str,
        field: &str,
        schema: PayloadSchema,
    ) -> Result<(), AppError> {
        validate_identifier("collection", collection)?;
        validate_path(field)?;
        let index = format!("idx_{collection}_{}", field.replace('.', "_"));

        let indexes = self
            .defined_names(format!("INFO FOR TABLE {collection};"), "indexes")
            .await?;
        if indexes.contains(&index) {
            return Err(AppError::AlreadyExists(format!(
                "payload index '{field}' on '{collection}'"
            )));
        }

        self.define(format!(
            "DEFINE INDEX IF NOT EXISTS {index} ON TABLE {collection} FIELDS payload.{field};"
        ))
        .await?;

        debug!(%collection, %field, ?schema, "payload index created");
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), AppError> {
        validate_identifier("collection", collection)?;
        for point in points {
            let _stored: Option<StoredPoint> = self
                .db
                .client
                .upsert((collection, point.id.as_str()))
                .content(StoredPoint {
                    vector: point.vector,
                    sparse_vector: point.sparse_vector,
                    payload: point.payload,
                })
                .await
                .map_err(AppError::Database)?;
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        request: SearchRequest,
    ) -> Result<Vec<ScoredPoint>, AppError> {
        validate_identifier("collection", collection)?;
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let clause = Clause::from_filter(request.filter.as_ref())?;
        let sql = format!(
            "SELECT meta::id(id) AS point_id, payload, vector::distance::knn() AS distance \
             FROM {collection} WHERE {filter}vector <|{k},{ef}|> $vector \
             ORDER BY distance ASC",
            filter = clause.and_sql(),
            k = request.limit,
            ef = request.limit.max(MIN_KNN_EF),
        );
        let vector = serde_json::to_value(&request.vector)?;

        let rows: Vec<SearchRow> = self
            .run_with_clause(sql, collection, clause, vec![("vector", vector)])
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| ScoredPoint {
                id: row.point_id,
                score: 1.0 - row.distance,
                payload: row.payload,
            })
            .filter(|hit| request.score_threshold.map_or(true, |t| hit.score >= t))
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<Filter>,
        order_by: Option<OrderBy>,
        limit: usize,
    ) -> Result<Vec<VectorPoint>, AppError> {
        let clause = Clause::from_filter(filter.as_ref())?;
        let (order_projection, order_sql) = match &order_by {
            Some(order) => {
                validate_path(&order.key)?;
                let direction = match order.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                (
                    format!(", payload.{} AS order_key", order.key),
                    format!("ORDER BY order_key {direction}"),
                )
            }
            None => (String::new(), String::new()),
        };
        let sql = format!(
            "SELECT meta::id(id) AS point_id, vector, sparse_vector, payload{order_projection} \
             FROM type::table($collection) {where_clause} {order_sql} LIMIT $limit",
            where_clause = clause.where_sql(),
        );

        let rows: Vec<ScrollRow> = self
            .run_with_clause(sql, collection, clause, vec![("limit", Value::from(limit))])
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| VectorPoint {
                id: row.point_id,
                vector: row.vector,
                sparse_vector: row.sparse_vector,
                payload: row.payload,
            })
            .collect())
    }

    async fn count(&self, collection: &str, filter: Option<Filter>) -> Result<usize, AppError> {
        let clause = Clause::from_filter(filter.as_ref())?;
        let sql = format!(
            "SELECT count() AS count FROM type::table($collection) {} GROUP ALL",
            clause.where_sql()
        );

        let rows: Vec<CountRow> = self
            .run_with_clause(sql, collection, clause, Vec::new())
            .await?;
        Ok(rows.first().map_or(0, |row| row.count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    async fn store() -> SurrealVectorStore {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        SurrealVectorStore::new(Arc::new(db))
    }

    fn point(id: &str, vector: Vec<f32>, kind: &str) -> VectorPoint {
        VectorPoint {
            id: id.to_string(),
            vector,
            sparse_vector: None,
            payload: json!({
                "content": format!("{kind} {id}"),
                "metadata": { "__type": kind, "id": id }
            }),
        }
    }

    #[test]
    fn filter_clause_binds_every_value() {
        let filter = Filter {
            must: vec![Condition::match_any("metadata.__type", ["track", "album"])],
            should: vec![Condition::Range {
                key: "metadata.played_at".into(),
                from: None,
                to: None,
            }],
        };
        let clause = Clause::from_filter(Some(&filter)).expect("clause");
        assert_eq!(
            clause.where_sql(),
            "WHERE payload.metadata.__type IN $p0 AND ((payload.metadata.played_at != NONE))"
        );
        assert_eq!(
            clause.and_sql(),
            "payload.metadata.__type IN $p0 AND ((payload.metadata.played_at != NONE)) AND "
        );
        assert_eq!(clause.bindings.len(), 1);

        let empty = Clause::from_filter(None).expect("clause");
        assert_eq!(empty.where_sql(), "");
        assert_eq!(empty.and_sql(), "");
    }

    #[test]
    fn filter_clause_rejects_injection() {
        let filter = Filter::must(vec![Condition::match_any("metadata.x; DELETE t", ["a"])]);
        assert!(Clause::from_filter(Some(&filter)).is_err());
    }

    #[tokio::test]
    async fn collection_creation_is_reported_once() {
        let store = store().await;
        let config = CollectionConfig::new("points_test", 3);
        store.create_collection(&config).await.expect("first create");
        let err = store
            .create_collection(&config)
            .await
            .expect_err("second create");
        assert!(matches!(err, AppError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn payload_index_creation_is_reported_once() {
        let store = store().await;
        store
            .create_collection(&CollectionConfig::new("points_test", 3))
            .await
            .expect("create");
        store
            .create_payload_index("points_test", "metadata.__type", PayloadSchema::Keyword)
            .await
            .expect("first index");
        let err = store
            .create_payload_index("points_test", "metadata.__type", PayloadSchema::Keyword)
            .await
            .expect_err("second index");
        assert!(matches!(err, AppError::AlreadyExists(_)));

        store
            .create_payload_index("points_test", "metadata.createdAt", PayloadSchema::Datetime)
            .await
            .expect("other field");
    }

    #[tokio::test]
    async fn knn_search_applies_filter_and_threshold() {
        let store = store().await;
        store
            .create_collection(&CollectionConfig::new("points_test", 3))
            .await
            .expect("create");
        store
            .upsert(
                "points_test",
                vec![
                    point("a", vec![1.0, 0.0, 0.0], "track"),
                    point("b", vec![0.0, 1.0, 0.0], "issue"),
                    point("c", vec![0.9, 0.1, 0.0], "issue"),
                ],
            )
            .await
            .expect("upsert");

        let query = |filter, score_threshold, limit| SearchRequest {
            vector: vec![1.0, 0.0, 0.0],
            limit,
            filter,
            score_threshold,
        };

        let issues = Filter::must(vec![Condition::match_any("metadata.__type", ["issue"])]);
        let hits = store
            .search("points_test", query(Some(issues), None, 5))
            .await
            .expect("filtered search");
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert!(hits[0].score > hits[1].score);

        let close = store
            .search("points_test", query(None, Some(0.5), 5))
            .await
            .expect("thresholded search");
        let ids: Vec<_> = close.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!((close[0].score - 1.0).abs() < 1e-4);

        let capped = store
            .search("points_test", query(None, None, 1))
            .await
            .expect("limited search");
        assert_eq!(capped.len(), 1);

        assert!(store
            .search("points_test", query(None, None, 0))
            .await
            .expect("empty search")
            .is_empty());
    }

    #[tokio::test]
    async fn upsert_search_and_count_round_trip() {
        let store = store().await;
        store
            .create_collection(&CollectionConfig::new("points_test", 3))
            .await
            .expect("create");
        store
            .upsert(
                "points_test",
                vec![
                    point("a", vec![1.0, 0.0, 0.0], "track"),
                    point("b", vec![0.0, 1.0, 0.0], "issue"),
                ],
            )
            .await
            .expect("upsert");
        store
            .upsert("points_test", vec![point("a", vec![1.0, 0.1, 0.0], "track")])
            .await
            .expect("overwrite");

        assert_eq!(store.count("points_test", None).await.expect("count"), 2);
        let tracks = Filter::must(vec![Condition::match_any("metadata.__type", ["track"])]);
        assert_eq!(
            store
                .count("points_test", Some(tracks.clone()))
                .await
                .expect("count"),
            1
        );

        let hits = store
            .search(
                "points_test",
                SearchRequest {
                    vector: vec![1.0, 0.0, 0.0],
                    limit: 5,
                    filter: None,
                    score_threshold: None,
                },
            )
            .await
            .expect("search");
        assert_eq!(hits.first().map(|h| h.id.as_str()), Some("a"));
        assert_eq!(
            hits[0].payload["metadata"]["__type"],
            Value::String("track".into())
        );
    }
}
