use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::vector::{Filter, SearchRequest, VectorStore},
    utils::embedding_service::EmbeddingService,
};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    diversity::DiversityService,
    hyde::HydeGenerator,
    planner::{dedupe, normalize_for_matching, PlanSource, QueryPlan, QueryPlanner},
    reranking::Reranker,
    scoring::{QueryResult, RankFusion, RankedResult},
    type_filter::{infer_types, keyword_tags, TypeFilter},
    Document,
};

use super::{
    config::{RetrievalConfig, RetrievalTuning},
    diagnostics::{FanOutStats, HydeStats, PipelineDiagnostics, PlanStats, RankStats},
    PipelineStage, PipelineStageTimings, StageKind,
};

/// Borrowed collaborators a pipeline run calls into.
#[derive(Clone, Copy)]
pub struct RetrievalServices<'a> {
    pub store: &'a dyn VectorStore,
    pub embeddings: &'a EmbeddingService,
    pub planner: &'a QueryPlanner,
    pub hyde: &'a HydeGenerator,
    pub reranker: Option<&'a dyn Reranker>,
}

pub struct PipelineContext<'a> {
    pub services: RetrievalServices<'a>,
    pub collection: String,
    pub input_text: String,
    pub config: RetrievalConfig,
    pub cancel: CancellationToken,
    pub now: DateTime<Utc>,
    pub plan: Option<QueryPlan>,
    pub filter: Option<TypeFilter>,
    pub query_results: Vec<QueryResult>,
    pub unique_ids: HashSet<String>,
    pub candidates: Vec<Document>,
    pub results: Vec<Document>,
    pub diagnostics: Option<PipelineDiagnostics>,
    stage_timings: PipelineStageTimings,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        services: RetrievalServices<'a>,
        collection: String,
        input_text: String,
        config: RetrievalConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            services,
            collection,
            input_text,
            config,
            cancel,
            now: Utc::now(),
            plan: None,
            filter: None,
            query_results: Vec::new(),
            unique_ids: HashSet::new(),
            candidates: Vec::new(),
            results: Vec::new(),
            diagnostics: None,
            stage_timings: PipelineStageTimings::default(),
        }
    }

    fn ensure_plan(&self) -> Result<&QueryPlan, AppError> {
        self.plan.as_ref().ok_or_else(|| {
            AppError::InternalError("query plan missing before search".to_string())
        })
    }

    pub fn enable_diagnostics(&mut self) {
        if self.diagnostics.is_none() {
            self.diagnostics = Some(PipelineDiagnostics::default());
        }
    }

    fn diagnostics_mut(&mut self) -> Option<&mut PipelineDiagnostics> {
        self.diagnostics.as_mut()
    }

    pub fn take_diagnostics(&mut self) -> Option<PipelineDiagnostics> {
        self.diagnostics.take()
    }

    pub fn take_stage_timings(&mut self) -> PipelineStageTimings {
        std::mem::take(&mut self.stage_timings)
    }

    pub fn record_stage_duration(&mut self, kind: StageKind, duration: std::time::Duration) {
        self.stage_timings.record(kind, duration);
    }

    pub fn take_results(&mut self) -> Vec<Document> {
        std::mem::take(&mut self.results)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlanStage;

#[async_trait]
impl PipelineStage for PlanStage {
    fn kind(&self) -> StageKind {
        StageKind::Plan
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        plan(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DirectPlanStage;

#[async_trait]
impl PipelineStage for DirectPlanStage {
    fn kind(&self) -> StageKind {
        StageKind::Plan
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        direct_plan(ctx);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FilterStage;

#[async_trait]
impl PipelineStage for FilterStage {
    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        infer_filter(ctx)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FanOutStage;

#[async_trait]
impl PipelineStage for FanOutStage {
    fn kind(&self) -> StageKind {
        StageKind::FanOut
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        parallel_search(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HydeStage;

#[async_trait]
impl PipelineStage for HydeStage {
    fn kind(&self) -> StageKind {
        StageKind::Hyde
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        hyde_search(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FuseStage;

#[async_trait]
impl PipelineStage for FuseStage {
    fn kind(&self) -> StageKind {
        StageKind::Fuse
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        fuse(ctx);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RankStage {
    pub allow_rerank: bool,
}

#[async_trait]
impl PipelineStage for RankStage {
    fn kind(&self) -> StageKind {
        StageKind::Rank
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        rank(ctx, self.allow_rerank).await;
        Ok(())
    }
}

#[instrument(level = "trace", skip_all)]
pub async fn plan(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let plan = ctx.services.planner.plan_queries(&ctx.input_text).await;
    record_plan(ctx, &plan);
    ctx.plan = Some(plan);
    Ok(())
}

/// The user query alone, searched without any language-model call.
pub fn direct_plan(ctx: &mut PipelineContext<'_>) {
    let mut queries = dedupe(&[ctx.input_text.clone()], 1);
    if queries.is_empty() {
        let normalized = normalize_for_matching(&ctx.input_text);
        queries.push(if normalized.is_empty() {
            ctx.input_text.clone()
        } else {
            normalized
        });
    }

    let plan = QueryPlan {
        queries,
        tags: keyword_tags(&ctx.input_text),
        source: PlanSource::Heuristic,
        used_fallback: false,
        is_diverse: false,
        intent: None,
    };
    record_plan(ctx, &plan);
    ctx.plan = Some(plan);
}

fn record_plan(ctx: &mut PipelineContext<'_>, plan: &QueryPlan) {
    if let Some(diag) = ctx.diagnostics_mut() {
        diag.plan = Some(PlanStats {
            source: plan.source,
            used_fallback: plan.used_fallback,
            is_diverse: plan.is_diverse,
            queries: plan.queries.clone(),
            tags: plan.tags.clone(),
        });
    }
}

#[instrument(level = "trace", skip_all)]
pub fn infer_filter(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let plan = ctx.ensure_plan()?;
    let filter = infer_types(
        &plan.tags,
        Some(ctx.input_text.as_str()),
        plan.intent.as_ref(),
        ctx.now,
    );

    match &filter {
        Some(filter) => debug!(
            types = ?filter.types,
            time_range = ?filter.time_range,
            "Search filter inferred"
        ),
        None => debug!("No search filter, searching every record type"),
    }

    if let Some(diag) = ctx.diagnostics_mut() {
        diag.filter = filter.clone();
    }
    ctx.filter = filter;
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub async fn parallel_search(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let queries = ctx.ensure_plan()?.queries.clone();
    let tuning = &ctx.config.tuning;
    let services = ctx.services;

    let search_filter = ctx.filter.as_ref().and_then(TypeFilter::to_filter);
    let mut outcome = fan_out(
        &services,
        &ctx.collection,
        &queries,
        search_filter.as_ref(),
        tuning,
        &ctx.cancel,
    )
    .await;

    let mut time_filter_relaxed = false;
    if outcome.unique.is_empty() && ctx.filter.as_ref().is_some_and(|f| f.time_range.is_some()) {
        let relaxed = ctx.filter.as_ref().and_then(TypeFilter::without_time);
        warn!(
            types = ?relaxed.as_ref().and_then(|f| f.types.clone()),
            "No hits inside the time range, retrying without it"
        );
        let relaxed_filter = relaxed.as_ref().and_then(TypeFilter::to_filter);
        outcome = fan_out(
            &services,
            &ctx.collection,
            &queries,
            relaxed_filter.as_ref(),
            tuning,
            &ctx.cancel,
        )
        .await;
        time_filter_relaxed = true;
    }

    if ctx.cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }

    if outcome.attempted > 0 && outcome.failed == outcome.attempted {
        let last_error = outcome.last_error.clone().unwrap_or_default();
        warn!(
            failed = outcome.failed,
            error = %last_error,
            "Every query variant failed"
        );
        if tuning.surface_total_failure {
            return Err(AppError::Processing(format!(
                "all {} query searches failed: {last_error}",
                outcome.failed
            )));
        }
    }

    debug!(
        queries = queries.len(),
        attempted = outcome.attempted,
        failed = outcome.failed,
        unique = outcome.unique.len(),
        stopped_early = outcome.stopped_early,
        "Parallel search finished"
    );

    let stats = FanOutStats {
        queries: queries.len(),
        attempted: outcome.attempted,
        failed: outcome.failed,
        unique_documents: outcome.unique.len(),
        stopped_early: outcome.stopped_early,
        time_filter_relaxed,
        last_error: outcome.last_error,
    };
    if let Some(diag) = ctx.diagnostics_mut() {
        diag.fan_out = Some(stats);
    }

    let mut results = outcome.results;
    results.sort_by_key(|r| r.query_idx);
    ctx.query_results = results;
    ctx.unique_ids = outcome.unique;
    Ok(())
}

#[derive(Debug, Default)]
struct FanOutOutcome {
    results: Vec<QueryResult>,
    unique: HashSet<String>,
    low_gain_streak: usize,
    attempted: usize,
    failed: usize,
    last_error: Option<String>,
    stopped_early: bool,
}

/// Workers pull `(index, query)` pairs from a shared queue until it drains,
/// enough unique documents were seen, or several batches in a row added
/// little. In-flight searches always complete.
async fn fan_out(
    services: &RetrievalServices<'_>,
    collection: &str,
    queries: &[String],
    filter: Option<&Filter>,
    tuning: &RetrievalTuning,
    cancel: &CancellationToken,
) -> FanOutOutcome {
    let per_query_k = tuning.per_query_k(queries.len());
    let target_unique = tuning.max_docs;
    let workers = tuning.clamped_concurrency().min(queries.len()).max(1);

    let queue: Mutex<VecDeque<(usize, String)>> =
        Mutex::new(queries.iter().cloned().enumerate().collect());
    let state = Mutex::new(FanOutOutcome::default());
    let queue = &queue;
    let state = &state;

    let worker = |_worker_id: usize| async move {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let next = queue.lock().await.pop_front();
            let Some((index, query)) = next else {
                break;
            };

            let search = search_query(
                services,
                collection,
                &query,
                per_query_k,
                filter,
                Some(tuning.score_threshold),
                cancel,
            )
            .await;

            let mut progress = state.lock().await;
            progress.attempted += 1;
            match search {
                Ok(hits) => {
                    let before = progress.unique.len();
                    for (doc, _) in &hits {
                        progress.unique.insert(doc.id());
                    }
                    let gained = progress.unique.len().saturating_sub(before);
                    progress.low_gain_streak = if gained < tuning.low_gain_min_new {
                        progress.low_gain_streak + 1
                    } else {
                        0
                    };
                    progress.results.push(QueryResult {
                        query_idx: i32::try_from(index).unwrap_or(i32::MAX),
                        results: hits,
                    });

                    let enough = progress.unique.len() >= target_unique;
                    let stalled = progress.low_gain_streak >= tuning.low_gain_window;
                    if (enough || stalled) && !progress.stopped_early {
                        progress.stopped_early = true;
                        let skipped = {
                            let mut pending = queue.lock().await;
                            let skipped = pending.len();
                            pending.clear();
                            skipped
                        };
                        debug!(
                            unique = progress.unique.len(),
                            enough,
                            stalled,
                            skipped,
                            "Stopping query fan-out early"
                        );
                    }
                }
                Err(err) => {
                    debug!(query_idx = index, error = %err, "Query variant search failed");
                    progress.failed += 1;
                    progress.last_error = Some(err.to_string());
                }
            }
        }
    };

    join_all((0..workers).map(worker)).await;

    let mut finished = state.lock().await;
    std::mem::take(&mut *finished)
}

async fn search_query(
    services: &RetrievalServices<'_>,
    collection: &str,
    query: &str,
    limit: usize,
    filter: Option<&Filter>,
    score_threshold: Option<f32>,
    cancel: &CancellationToken,
) -> Result<Vec<(Document, f32)>, AppError> {
    let vector = services.embeddings.generate_embeddings(query, cancel).await?;
    search_vector(services, collection, vector, limit, filter, score_threshold).await
}

async fn search_vector(
    services: &RetrievalServices<'_>,
    collection: &str,
    vector: Vec<f32>,
    limit: usize,
    filter: Option<&Filter>,
    score_threshold: Option<f32>,
) -> Result<Vec<(Document, f32)>, AppError> {
    let hits = services
        .store
        .search(
            collection,
            SearchRequest {
                vector,
                limit,
                filter: filter.cloned(),
                score_threshold,
            },
        )
        .await?;

    Ok(hits
        .into_iter()
        .map(|hit| (Document::from_payload(&hit.payload), hit.score))
        .collect())
}

#[instrument(level = "trace", skip_all)]
pub async fn hyde_search(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let tuning = &ctx.config.tuning;
    if !tuning.use_hyde {
        return Ok(());
    }

    let unique = ctx.unique_ids.len();
    let trigger = tuning.hyde_trigger();
    if unique >= trigger {
        debug!(unique, trigger, "Skipping HyDE, recall is sufficient");
        if let Some(diag) = ctx.diagnostics_mut() {
            diag.hyde = Some(HydeStats::default());
        }
        return Ok(());
    }

    let query_count = ctx.ensure_plan()?.queries.len();
    let per_query_k = tuning.per_query_k(query_count);
    let services = ctx.services;
    let search_filter = ctx.filter.as_ref().and_then(TypeFilter::to_filter);

    let outcome = match services
        .hyde
        .embed_hypothetical(&ctx.input_text, services.embeddings, &ctx.cancel)
        .await
    {
        Ok(vector) => {
            search_vector(
                &services,
                &ctx.collection,
                vector,
                per_query_k,
                search_filter.as_ref(),
                None,
            )
            .await
        }
        Err(err) => Err(err),
    };

    let stats = match outcome {
        Ok(hits) => {
            debug!(hits = hits.len(), "HyDE search completed");
            for (doc, _) in &hits {
                ctx.unique_ids.insert(doc.id());
            }
            let count = hits.len();
            ctx.query_results.push(QueryResult {
                query_idx: -1,
                results: hits.into_iter().map(|(doc, _)| (doc, 1.0)).collect(),
            });
            HydeStats {
                triggered: true,
                hits: count,
                error: None,
            }
        }
        Err(AppError::Cancelled) => return Err(AppError::Cancelled),
        Err(err) => {
            warn!(error = %err, "HyDE failed, continuing without it");
            HydeStats {
                triggered: true,
                hits: 0,
                error: Some(err.to_string()),
            }
        }
    };

    if let Some(diag) = ctx.diagnostics_mut() {
        diag.hyde = Some(stats);
    }
    Ok(())
}

/// Fuses every query result and keeps the top `2 * max_docs` as candidates.
#[instrument(level = "trace", skip_all)]
pub fn fuse(ctx: &mut PipelineContext<'_>) {
    let tuning = &ctx.config.tuning;
    let fusion = RankFusion::from_tuning(tuning);
    let ranked = fusion.fuse(&ctx.query_results, Document::id);
    let fused_documents = ranked.len();

    ctx.candidates = ranked
        .into_iter()
        .take(tuning.max_docs.saturating_mul(2))
        .map(annotate_fused)
        .collect();

    debug!(
        fused = fused_documents,
        candidates = ctx.candidates.len(),
        "Query results fused"
    );

    if let Some(diag) = ctx.diagnostics_mut() {
        diag.rank = Some(RankStats {
            fused_documents,
            ..RankStats::default()
        });
    }
}

fn annotate_fused(result: RankedResult) -> Document {
    let mut doc = result.doc;
    doc.set_metadata("score", Value::from(result.final_score));
    doc.set_metadata("bestScore", Value::from(result.best_score));
    doc.set_metadata("rrfScore", Value::from(result.rrf_score));
    doc
}

/// Reranks when a reranker is configured and enough candidates remain,
/// otherwise (or when reranking fails) diversifies with MMR.
#[instrument(level = "trace", skip_all)]
pub async fn rank(ctx: &mut PipelineContext<'_>, allow_rerank: bool) {
    let tuning = &ctx.config.tuning;
    let max_docs = tuning.max_docs;
    let candidates = std::mem::take(&mut ctx.candidates);
    let candidate_count = candidates.len();
    let diversity = DiversityService::from_tuning(tuning);

    let reranker = ctx
        .services
        .reranker
        .filter(|_| allow_rerank && tuning.rerank_enabled)
        .filter(|_| candidate_count > tuning.rerank_min_candidates);

    let mut reranked = false;
    let mut rerank_error = None;
    let results = match reranker {
        Some(reranker) => {
            match reranker
                .rerank(&ctx.input_text, candidates.clone(), max_docs)
                .await
            {
                Ok(docs) => {
                    reranked = true;
                    docs
                }
                Err(err) => {
                    warn!(error = %err, "Rerank failed, falling back to MMR");
                    rerank_error = Some(err.to_string());
                    diversity.apply_mmr(&candidates, max_docs)
                }
            }
        }
        None => diversity.apply_mmr(&candidates, max_docs),
    };

    debug!(
        candidates = candidate_count,
        returned = results.len(),
        reranked,
        "Ranking completed"
    );

    if let Some(diag) = ctx.diagnostics_mut() {
        let stats = diag.rank.get_or_insert_with(RankStats::default);
        stats.candidates = candidate_count;
        stats.reranked = reranked;
        stats.rerank_error = rerank_error;
        stats.returned = results.len();
        stats.top_scores = results.iter().take(5).map(Document::score).collect();
    }

    ctx.results = results;
}
