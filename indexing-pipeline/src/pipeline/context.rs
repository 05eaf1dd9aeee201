use common::{
    error::AppError,
    storage::{
        source::{EtlCursor, SourceStore},
        types::{
            sync_state::{SyncState, SyncStateStore},
            StoredObject,
        },
        vector::{VectorPoint, VectorStore},
    },
    utils::{embedding_service::EmbeddingService, sparse::SparseEncoder},
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::config::IndexingConfig;
use crate::sources::EmbeddingDescriptor;

/// Outcome of one pipeline run for a single source table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexingReport {
    pub entity_type: String,
    pub batches: usize,
    pub extracted: usize,
    pub indexed: usize,
    pub dropped: usize,
    /// The stored cursor was discarded because the index held nothing for this type.
    pub cursor_reset: bool,
    pub cursor: Option<EtlCursor>,
}

pub struct PipelineContext<'a, T: EmbeddingDescriptor> {
    pub source: &'a dyn SourceStore<T>,
    pub sync_state: &'a dyn SyncStateStore,
    pub vectors: &'a dyn VectorStore,
    pub embeddings: &'a EmbeddingService,
    pub sparse: Option<SparseEncoder>,
    pub config: &'a IndexingConfig,
    pub cancel: &'a CancellationToken,
    pub state: SyncState,
    /// Rows still allowed in this run.
    pub remaining: usize,
    pub rows: Vec<T>,
    pub batch_cursor: Option<EtlCursor>,
    pub points: Vec<VectorPoint>,
    pub report: IndexingReport,
}

impl<'a, T: EmbeddingDescriptor> PipelineContext<'a, T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &'a dyn SourceStore<T>,
        sync_state: &'a dyn SyncStateStore,
        vectors: &'a dyn VectorStore,
        embeddings: &'a EmbeddingService,
        sparse: Option<SparseEncoder>,
        config: &'a IndexingConfig,
        cancel: &'a CancellationToken,
        limit: usize,
    ) -> Self {
        Self {
            source,
            sync_state,
            vectors,
            embeddings,
            sparse,
            config,
            cancel,
            state: SyncState::new(&config.connector_name, T::table_name()),
            remaining: limit,
            rows: Vec::new(),
            batch_cursor: None,
            points: Vec::new(),
            report: IndexingReport {
                entity_type: T::table_name().to_string(),
                ..IndexingReport::default()
            },
        }
    }

    pub fn entity_table(&self) -> &'static str {
        T::table_name()
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    pub fn into_report(self) -> IndexingReport {
        self.report
    }

    /// Logs a run that stops early and hands the error back.
    pub fn log_abort(&self, err: AppError) -> AppError {
        error!(
            entity = self.entity_table(),
            collection = %self.config.collection,
            batches = self.report.batches,
            indexed = self.report.indexed,
            error = %err,
            "indexing pipeline aborted"
        );
        err
    }
}
