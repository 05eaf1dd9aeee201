use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct IndexingTuning {
    /// Points per upsert call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Rows pulled from the source per extract.
    #[serde(default = "default_extract_page_size")]
    pub extract_page_size: usize,
    #[serde(default = "default_upsert_concurrency")]
    pub upsert_concurrency: usize,
    #[serde(default = "default_transform_concurrency")]
    pub transform_concurrency: usize,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_sparse_vectors")]
    pub sparse_vectors: bool,
}

const fn default_batch_size() -> usize {
    100
}

const fn default_extract_page_size() -> usize {
    100
}

const fn default_upsert_concurrency() -> usize {
    3
}

const fn default_transform_concurrency() -> usize {
    2
}

const fn default_retry_initial_delay_ms() -> u64 {
    1_000
}

const fn default_retry_max_delay_ms() -> u64 {
    5_000
}

const fn default_max_retries() -> usize {
    3
}

const fn default_sparse_vectors() -> bool {
    true
}

impl Default for IndexingTuning {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            extract_page_size: default_extract_page_size(),
            upsert_concurrency: default_upsert_concurrency(),
            transform_concurrency: default_transform_concurrency(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_retries: default_max_retries(),
            sparse_vectors: default_sparse_vectors(),
        }
    }
}

impl IndexingTuning {
    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

#[derive(Debug, Clone)]
pub struct IndexingConfig {
    pub collection: String,
    /// Owner of the sync-state records written by this pipeline.
    pub connector_name: String,
    pub tuning: IndexingTuning,
}

impl IndexingConfig {
    pub fn new(collection: impl Into<String>, connector_name: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            connector_name: connector_name.into(),
            tuning: IndexingTuning::default(),
        }
    }

    #[must_use]
    pub fn with_tuning(mut self, tuning: IndexingTuning) -> Self {
        self.tuning = tuning;
        self
    }
}
