mod config;
mod context;
mod stages;
mod state;

pub use config::{IndexingConfig, IndexingTuning};
pub use context::IndexingReport;

use std::{
    marker::PhantomData,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        source::SourceStore, types::sync_state::SyncStateStore, types::StoredObject,
        vector::VectorStore,
    },
    utils::{embedding_service::EmbeddingService, sparse::SparseEncoder},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use self::{
    context::PipelineContext,
    stages::{
        advance_cursor, bootstrap, extract, load, map_guard_error, transform, validate_cursor,
        ExtractOutcome,
    },
    state::pending,
};
use crate::sources::EmbeddingDescriptor;

/// A runnable indexing unit, one per source table.
#[async_trait]
pub trait IndexingJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// Indexes up to `limit` new or changed rows.
    async fn execute(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<IndexingReport, AppError>;
}

/// Incremental extract, embed and upsert of one source table into a vector collection.
pub struct IndexingPipeline<T: EmbeddingDescriptor> {
    source: Arc<dyn SourceStore<T>>,
    sync_state: Arc<dyn SyncStateStore>,
    vectors: Arc<dyn VectorStore>,
    embeddings: Arc<EmbeddingService>,
    config: IndexingConfig,
    _entity: PhantomData<fn() -> T>,
}

impl<T: EmbeddingDescriptor> IndexingPipeline<T> {
    pub fn new(
        source: Arc<dyn SourceStore<T>>,
        sync_state: Arc<dyn SyncStateStore>,
        vectors: Arc<dyn VectorStore>,
        embeddings: Arc<EmbeddingService>,
        config: IndexingConfig,
    ) -> Self {
        Self {
            source,
            sync_state,
            vectors,
            embeddings,
            config,
            _entity: PhantomData,
        }
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    #[tracing::instrument(
        skip_all,
        fields(entity = T::table_name(), collection = %self.config.collection, limit)
    )]
    pub async fn run(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<IndexingReport, AppError> {
        let started = Instant::now();
        let sparse = self
            .config
            .tuning
            .sparse_vectors
            .then(SparseEncoder::default);
        let mut ctx = PipelineContext::new(
            self.source.as_ref(),
            self.sync_state.as_ref(),
            self.vectors.as_ref(),
            self.embeddings.as_ref(),
            sparse,
            &self.config,
            cancel,
            limit,
        );

        let machine = pending();
        let machine = bootstrap(machine, &mut ctx)
            .await
            .map_err(|err| ctx.log_abort(err))?;
        let mut machine = validate_cursor(machine, &mut ctx)
            .await
            .map_err(|err| ctx.log_abort(err))?;

        loop {
            if cancel.is_cancelled() {
                return Err(ctx.log_abort(AppError::Cancelled));
            }

            let extracting = match extract(machine, &mut ctx)
                .await
                .map_err(|err| ctx.log_abort(err))?
            {
                ExtractOutcome::Rows(machine) => machine,
                ExtractOutcome::Exhausted(_done) => break,
            };
            let machine_transformed = transform(extracting, &mut ctx)
                .await
                .map_err(|err| ctx.log_abort(err))?;
            let machine_loaded = load(machine_transformed, &mut ctx)
                .await
                .map_err(|err| ctx.log_abort(err))?;
            let advanced = advance_cursor(machine_loaded, &mut ctx)
                .await
                .map_err(|err| ctx.log_abort(err))?;

            machine = advanced
                .next_batch()
                .map_err(|(_, guard)| map_guard_error("next_batch", &guard))?;
        }

        let report = ctx.into_report();
        info!(
            entity = %report.entity_type,
            batches = report.batches,
            extracted = report.extracted,
            indexed = report.indexed,
            dropped = report.dropped,
            cursor_reset = report.cursor_reset,
            total_ms = Self::duration_millis(started.elapsed()),
            "indexing pipeline finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl<T: EmbeddingDescriptor> IndexingJob for IndexingPipeline<T> {
    fn name(&self) -> &'static str {
        T::table_name()
    }

    async fn execute(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<IndexingReport, AppError> {
        self.run(limit, cancel).await
    }
}

#[cfg(test)]
mod tests;
