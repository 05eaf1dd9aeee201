use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    cosine_similarity, payload_path, validate_identifier, validate_path, CollectionConfig,
    Direction, Filter, OrderBy, PayloadSchema, ScoredPoint, SearchRequest, VectorPoint,
    VectorStore,
};
use crate::error::AppError;

#[derive(Debug)]
struct Collection {
    config: CollectionConfig,
    indexes: HashSet<String>,
    points: BTreeMap<String, VectorPoint>,
}

/// Brute-force store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_point(&self, collection: &str, id: &str) -> Option<VectorPoint> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .and_then(|c| c.points.get(id).cloned())
    }

    pub async fn has_payload_index(&self, collection: &str, field: &str) -> bool {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .is_some_and(|c| c.indexes.contains(field))
    }
}

fn passes(filter: Option<&Filter>, point: &VectorPoint) -> bool {
    filter.map_or(true, |f| f.matches(&point.payload))
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn create_collection(&self, config: &CollectionConfig) -> Result<(), AppError> {
        validate_identifier("collection", &config.name)?;
        let mut collections = self.collections.write().await;
        if collections.contains_key(&config.name) {
            return Err(AppError::AlreadyExists(format!(
                "collection '{}'",
                config.name
            )));
        }
        collections.insert(
            config.name.clone(),
            Collection {
                config: config.clone(),
                indexes: HashSet::new(),
                points: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn create_payload_index(
        &self,
        collection: &str,
        field: &str,
        _schema: PayloadSchema,
    ) -> Result<(), AppError> {
        validate_path(field)?;
        let mut collections = self.collections.write().await;
        let entry = collections
            .get_mut(collection)
            .ok_or_else(|| AppError::NotFound(format!("collection '{collection}'")))?;
        if !entry.indexes.insert(field.to_string()) {
            return Err(AppError::AlreadyExists(format!(
                "payload index '{field}' on '{collection}'"
            )));
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), AppError> {
        let mut collections = self.collections.write().await;
        let entry = collections
            .get_mut(collection)
            .ok_or_else(|| AppError::NotFound(format!("collection '{collection}'")))?;

        if let Some(bad) = points
            .iter()
            .find(|p| p.vector.len() != entry.config.vector_size)
        {
            return Err(AppError::DimensionMismatch {
                expected: entry.config.vector_size,
                actual: bad.vector.len(),
            });
        }

        for point in points {
            entry.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        request: SearchRequest,
    ) -> Result<Vec<ScoredPoint>, AppError> {
        let collections = self.collections.read().await;
        let Some(entry) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<ScoredPoint> = entry
            .points
            .values()
            .filter(|point| passes(request.filter.as_ref(), point))
            .map(|point| ScoredPoint {
                id: point.id.clone(),
                score: cosine_similarity(&point.vector, &request.vector),
                payload: point.payload.clone(),
            })
            .filter(|hit| request.score_threshold.map_or(true, |t| hit.score >= t))
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(request.limit);
        Ok(hits)
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<Filter>,
        order_by: Option<OrderBy>,
        limit: usize,
    ) -> Result<Vec<VectorPoint>, AppError> {
        let collections = self.collections.read().await;
        let Some(entry) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut points: Vec<VectorPoint> = entry
            .points
            .values()
            .filter(|point| passes(filter.as_ref(), point))
            .cloned()
            .collect();

        if let Some(order) = order_by {
            points.sort_by(|a, b| {
                let left = payload_path(&a.payload, &order.key).map(|v| v.to_string());
                let right = payload_path(&b.payload, &order.key).map(|v| v.to_string());
                match order.direction {
                    Direction::Asc => left.cmp(&right),
                    Direction::Desc => right.cmp(&left),
                }
            });
        }

        points.truncate(limit);
        Ok(points)
    }

    async fn count(&self, collection: &str, filter: Option<Filter>) -> Result<usize, AppError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map_or(0, |entry| {
            entry
                .points
                .values()
                .filter(|point| passes(filter.as_ref(), point))
                .count()
        }))
    }
}
