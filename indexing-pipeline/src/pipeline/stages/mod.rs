use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        source::SourceEntity,
        types::sync_state::SyncState,
        vector::{format_timestamp, CollectionConfig, Condition, Filter, PayloadSchema, VectorPoint},
    },
    utils::{
        embedding_service::EmbeddingService,
        retry::{capped_exponential_backoff, retry_with_cancel},
        sparse::SparseEncoder,
    },
};
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use state_machines::core::GuardError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{
    context::PipelineContext,
    state::{
        Bootstrapped, CursorAdvanced, Done, EtlMachine, Extracting, Idle, Loading, Pending,
        Transforming,
    },
};
use crate::{ids::deterministic_id, sources::EmbeddingDescriptor};

/// Indexes every collection gets regardless of source.
const BASE_PAYLOAD_INDEXES: [(&str, PayloadSchema); 4] = [
    ("metadata.__type", PayloadSchema::Keyword),
    ("metadata.__table", PayloadSchema::Keyword),
    ("metadata.__source", PayloadSchema::Keyword),
    ("metadata.__indexed_at", PayloadSchema::Datetime),
];

pub enum ExtractOutcome {
    Rows(EtlMachine<(), Extracting>),
    Exhausted(EtlMachine<(), Done>),
}

#[instrument(level = "trace", skip_all, fields(entity = ctx.entity_table()))]
pub async fn bootstrap<T: EmbeddingDescriptor>(
    machine: EtlMachine<(), Pending>,
    ctx: &mut PipelineContext<'_, T>,
) -> Result<EtlMachine<(), Bootstrapped>, AppError> {
    let tuning = &ctx.config.tuning;
    let collection = CollectionConfig::new(
        ctx.collection(),
        ctx.embeddings.expected_vector_size(),
    );

    let created = retry_with_cancel(
        capped_exponential_backoff(
            tuning.retry_initial_delay(),
            tuning.retry_max_delay(),
            tuning.max_retries,
        ),
        ctx.cancel,
        "create collection",
        || ctx.vectors.create_collection(&collection),
    )
    .await;
    match created {
        Ok(()) => info!(collection = %collection.name, size = collection.vector_size, "created vector collection"),
        Err(AppError::AlreadyExists(_)) => debug!(collection = %collection.name, "vector collection already exists"),
        Err(err) => return Err(err),
    }

    let indexes = BASE_PAYLOAD_INDEXES.into_iter().chain(T::payload_indexes());
    for (field, schema) in indexes {
        match ctx
            .vectors
            .create_payload_index(ctx.collection(), field, schema)
            .await
        {
            Ok(()) => debug!(field, ?schema, "created payload index"),
            Err(AppError::AlreadyExists(_)) => {}
            Err(err) => return Err(err),
        }
    }

    machine
        .bootstrap()
        .map_err(|(_, guard)| map_guard_error("bootstrap", &guard))
}

/// Loads the stored cursor and discards it when the index holds nothing for
/// this entity type, which forces a full re-extract.
#[instrument(level = "trace", skip_all, fields(entity = ctx.entity_table()))]
pub async fn validate_cursor<T: EmbeddingDescriptor>(
    machine: EtlMachine<(), Bootstrapped>,
    ctx: &mut PipelineContext<'_, T>,
) -> Result<EtlMachine<(), Idle>, AppError> {
    let connector = ctx.config.connector_name.as_str();
    let entity = ctx.entity_table();
    ctx.state = ctx
        .sync_state
        .get_state(connector, entity)
        .await?
        .unwrap_or_else(|| SyncState::new(connector, entity));

    if let Some(cursor) = ctx.state.cursor() {
        let indexed = ctx
            .vectors
            .count(
                ctx.collection(),
                Some(Filter::must(vec![Condition::match_any(
                    "metadata.__table",
                    [T::table_name()],
                )])),
            )
            .await?;

        if indexed == 0 {
            warn!(
                entity,
                cursor_id = %cursor.id,
                cursor_timestamp = %cursor.timestamp,
                "cursor stored but no vectors indexed; resetting for a full re-extract"
            );
            ctx.state.set_cursor(None);
            ctx.sync_state.save_state(ctx.state.clone()).await?;
            ctx.report.cursor_reset = true;
        }
    }

    machine
        .validate_cursor()
        .map_err(|(_, guard)| map_guard_error("validate_cursor", &guard))
}

#[instrument(level = "trace", skip_all, fields(entity = ctx.entity_table(), remaining = ctx.remaining))]
pub async fn extract<T: EmbeddingDescriptor>(
    machine: EtlMachine<(), Idle>,
    ctx: &mut PipelineContext<'_, T>,
) -> Result<ExtractOutcome, AppError> {
    let page = ctx.remaining.min(ctx.config.tuning.extract_page_size.max(1));
    if page == 0 {
        return finish(machine);
    }

    let cursor = ctx.state.cursor();
    let tuning = &ctx.config.tuning;
    let source = ctx.source;
    let rows = retry_with_cancel(
        capped_exponential_backoff(
            tuning.retry_initial_delay(),
            tuning.retry_max_delay(),
            tuning.max_retries,
        ),
        ctx.cancel,
        "extract rows",
        || source.extract_after(cursor.as_ref(), page),
    )
    .await?;

    if rows.is_empty() {
        return finish(machine);
    }

    debug!(rows = rows.len(), "extracted source rows");
    ctx.remaining = ctx.remaining.saturating_sub(rows.len());
    ctx.report.extracted += rows.len();
    ctx.batch_cursor = rows.last().map(SourceEntity::cursor);
    ctx.rows = rows;

    machine
        .extract()
        .map(ExtractOutcome::Rows)
        .map_err(|(_, guard)| map_guard_error("extract", &guard))
}

fn finish(machine: EtlMachine<(), Idle>) -> Result<ExtractOutcome, AppError> {
    machine
        .finish()
        .map(ExtractOutcome::Exhausted)
        .map_err(|(_, guard)| map_guard_error("finish", &guard))
}

/// Rows that cannot be embedded are dropped; the batch carries on without them.
#[instrument(level = "trace", skip_all, fields(entity = ctx.entity_table()))]
pub async fn transform<T: EmbeddingDescriptor>(
    machine: EtlMachine<(), Extracting>,
    ctx: &mut PipelineContext<'_, T>,
) -> Result<EtlMachine<(), Transforming>, AppError> {
    let rows = std::mem::take(&mut ctx.rows);
    let collection = ctx.config.collection.as_str();
    let embeddings = ctx.embeddings;
    let sparse = ctx.sparse;
    let cancel = ctx.cancel;

    let results: Vec<(String, Result<VectorPoint, AppError>)> = stream::iter(rows.iter())
        .map(|row| async move {
            let point = build_point(row, collection, embeddings, sparse, cancel).await;
            (row.get_id().to_string(), point)
        })
        .buffered(ctx.config.tuning.transform_concurrency.max(1))
        .boxed()
        .collect()
        .await;

    let mut points = Vec::with_capacity(results.len());
    for (row_id, result) in results {
        match result {
            Ok(point) => points.push(point),
            Err(err @ (AppError::Cancelled | AppError::DimensionMismatch { .. })) => return Err(err),
            Err(err) => {
                warn!(row_id = %row_id, error = %err, "dropping row that failed to transform");
                ctx.report.dropped += 1;
            }
        }
    }

    debug!(points = points.len(), rows = rows.len(), "transformed batch");
    ctx.points = points;

    machine
        .transform()
        .map_err(|(_, guard)| map_guard_error("transform", &guard))
}

async fn build_point<T: EmbeddingDescriptor>(
    row: &T,
    collection: &str,
    embeddings: &EmbeddingService,
    sparse: Option<SparseEncoder>,
    cancel: &CancellationToken,
) -> Result<VectorPoint, AppError> {
    let text = row.embedding_text();
    let vector = embeddings.generate_embeddings(&text, cancel).await?;

    let mut metadata = row.payload_fields();
    metadata.insert("id".into(), json!(row.get_id()));
    metadata.insert("__type".into(), json!(T::ENTITY_TYPE));
    metadata.insert("__table".into(), json!(T::table_name()));
    metadata.insert("__source".into(), json!("etl"));
    metadata.insert("__collection".into(), json!(collection));
    metadata.insert(
        "__indexed_at".into(),
        Value::String(format_timestamp(&Utc::now())),
    );

    Ok(VectorPoint {
        id: deterministic_id(collection, &format!("{}:{}", T::table_name(), row.get_id())),
        sparse_vector: sparse
            .map(|encoder| encoder.encode(&text))
            .filter(|sparse| !sparse.is_empty()),
        vector,
        payload: json!({ "content": text, "metadata": metadata }),
    })
}

#[instrument(level = "trace", skip_all, fields(entity = ctx.entity_table(), points = ctx.points.len()))]
pub async fn load<T: EmbeddingDescriptor>(
    machine: EtlMachine<(), Transforming>,
    ctx: &mut PipelineContext<'_, T>,
) -> Result<EtlMachine<(), Loading>, AppError> {
    let points = std::mem::take(&mut ctx.points);
    let tuning = &ctx.config.tuning;
    let collection = ctx.config.collection.as_str();
    let vectors = ctx.vectors;
    let cancel = ctx.cancel;

    let batches: Vec<Vec<VectorPoint>> = points
        .chunks(tuning.batch_size.max(1))
        .map(<[VectorPoint]>::to_vec)
        .collect();

    let outcomes: Vec<Result<usize, AppError>> = stream::iter(batches)
        .map(|batch| async move {
            let size = batch.len();
            retry_with_cancel(
                capped_exponential_backoff(
                    tuning.retry_initial_delay(),
                    tuning.retry_max_delay(),
                    tuning.max_retries,
                ),
                cancel,
                "vector upsert",
                || vectors.upsert(collection, batch.clone()),
            )
            .await
            .map(|()| size)
        })
        .buffer_unordered(tuning.upsert_concurrency.max(1))
        .collect()
        .await;

    for outcome in outcomes {
        ctx.report.indexed += outcome?;
    }

    machine
        .load()
        .map_err(|(_, guard)| map_guard_error("load", &guard))
}

/// Persists the last extracted row's position, even when the batch produced no points.
#[instrument(level = "trace", skip_all, fields(entity = ctx.entity_table()))]
pub async fn advance_cursor<T: EmbeddingDescriptor>(
    machine: EtlMachine<(), Loading>,
    ctx: &mut PipelineContext<'_, T>,
) -> Result<EtlMachine<(), CursorAdvanced>, AppError> {
    if let Some(cursor) = ctx.batch_cursor.take() {
        ctx.state.set_cursor(Some(cursor.clone()));
        ctx.sync_state.save_state(ctx.state.clone()).await?;
        debug!(cursor_id = %cursor.id, cursor_timestamp = %cursor.timestamp, "cursor advanced");
        ctx.report.cursor = Some(cursor);
    }
    ctx.report.batches += 1;

    machine
        .advance_cursor()
        .map_err(|(_, guard)| map_guard_error("advance_cursor", &guard))
}

pub fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid indexing pipeline transition during {event}: {guard:?}"
    ))
}
