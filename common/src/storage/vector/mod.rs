//! Vector index capability: collections of points with a dense vector, an
//! optional sparse vector and a JSON payload, searchable by cosine similarity
//! and filterable on payload paths such as `metadata.__type`.

mod memory;
mod surreal;

pub use memory::InMemoryVectorStore;
pub use surreal::SurrealVectorStore;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::AppError, utils::sparse::SparseVector};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub sparse_vector: Option<SparseVector>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distance {
    #[default]
    Cosine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    pub m: u32,
    pub ef_construction: u32,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionConfig {
    pub name: String,
    pub vector_size: usize,
    pub distance: Distance,
    pub hnsw: HnswParams,
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>, vector_size: usize) -> Self {
        Self {
            name: name.into(),
            vector_size,
            distance: Distance::Cosine,
            hnsw: HnswParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadSchema {
    Keyword,
    Datetime,
}

/// A single predicate on a dotted payload path.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals any of the listed keywords.
    Match { key: String, any: Vec<String> },
    /// Inclusive datetime bounds; stored values are RFC 3339 strings.
    Range {
        key: String,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    },
}

impl Condition {
    pub fn match_any<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Condition::Match {
            key: key.into(),
            any: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Condition::Match { key, .. } | Condition::Range { key, .. } => key,
        }
    }

    /// Evaluates the predicate against a payload document.
    pub fn matches(&self, payload: &Value) -> bool {
        let Some(field) = payload_path(payload, self.key()) else {
            return false;
        };

        match self {
            Condition::Match { any, .. } => {
                keyword_of(field).is_some_and(|value| any.iter().any(|a| *a == value))
            }
            Condition::Range { from, to, .. } => {
                let Some(at) = field
                    .as_str()
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                else {
                    return false;
                };
                from.map_or(true, |from| at >= from) && to.map_or(true, |to| at <= to)
            }
        }
    }
}

/// `must` conditions are AND-ed; at least one `should` condition must hold when any are given.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub must: Vec<Condition>,
    pub should: Vec<Condition>,
}

impl Filter {
    pub fn must(conditions: Vec<Condition>) -> Self {
        Self {
            must: conditions,
            should: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.should.is_empty()
    }

    pub fn matches(&self, payload: &Value) -> bool {
        self.must.iter().all(|c| c.matches(payload))
            && (self.should.is_empty() || self.should.iter().any(|c| c.matches(payload)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub key: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    pub limit: usize,
    pub filter: Option<Filter>,
    pub score_threshold: Option<f32>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Fails with [`AppError::AlreadyExists`] when the collection is present.
    async fn create_collection(&self, config: &CollectionConfig) -> Result<(), AppError>;

    /// Fails with [`AppError::AlreadyExists`] when the index is present.
    async fn create_payload_index(
        &self,
        collection: &str,
        field: &str,
        schema: PayloadSchema,
    ) -> Result<(), AppError>;

    /// Insert or overwrite points by id.
    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), AppError>;

    /// Highest cosine similarity first.
    async fn search(
        &self,
        collection: &str,
        request: SearchRequest,
    ) -> Result<Vec<ScoredPoint>, AppError>;

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<Filter>,
        order_by: Option<OrderBy>,
        limit: usize,
    ) -> Result<Vec<VectorPoint>, AppError>;

    async fn count(&self, collection: &str, filter: Option<Filter>) -> Result<usize, AppError>;
}

/// Canonical timestamp format for payload fields, so range filters can
/// compare stored values lexicographically.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn payload_path<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .try_fold(payload, |current, segment| current.get(segment))
        .filter(|value| !value.is_null())
}

fn keyword_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0f32, 0f32, 0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Collection and field names end up inside SurrealQL statements.
pub(crate) fn validate_identifier(kind: &str, name: &str) -> Result<(), AppError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid {kind} name '{name}'")))
    }
}

pub(crate) fn validate_path(path: &str) -> Result<(), AppError> {
    path.split('.')
        .try_for_each(|segment| validate_identifier("payload field", segment))
}
