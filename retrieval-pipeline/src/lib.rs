pub mod diversity;
pub mod hyde;
pub mod intent;
pub mod pipeline;
pub mod planner;
mod prompts;
pub mod reranking;
pub mod scoring;
#[cfg(test)]
mod test_support;
pub mod type_filter;

use std::sync::Arc;

use common::{
    error::AppError,
    storage::vector::VectorStore,
    utils::{embedding_service::EmbeddingService, llm::LanguageModel},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use hyde::HydeGenerator;
use planner::QueryPlanner;
use reranking::Reranker;

pub use pipeline::{
    PipelineDiagnostics, PipelineRunOutput, PipelineStageTimings, RetrievalConfig,
    RetrievalStrategy, RetrievalTuning,
};

/// A retrieved record: its indexed text plus the payload metadata, extended
/// with ranking scores as it moves through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub page_content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(page_content: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            page_content: page_content.into(),
            metadata,
        }
    }

    /// Reads a `{content, metadata}` vector payload.
    pub fn from_payload(payload: &Value) -> Self {
        Self {
            page_content: payload
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            metadata: payload
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// `metadata.id`, else the record type plus the first 80 characters of content.
    pub fn id(&self) -> String {
        match self.metadata.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                let prefix: String = self.page_content.chars().take(80).collect();
                format!("{}:{prefix}", self.entity_type().unwrap_or("unknown"))
            }
        }
    }

    pub fn entity_type(&self) -> Option<&str> {
        self.metadata.get("__type").and_then(Value::as_str)
    }

    /// The latest score written by the pipeline, 0 when unscored.
    pub fn score(&self) -> f32 {
        self.metadata
            .get("score")
            .and_then(Value::as_f64)
            .map_or(0.0, |score| score as f32)
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }
}

/// Multi-query retrieval over one vector collection.
pub struct MultiQueryRetriever {
    store: Arc<dyn VectorStore>,
    embeddings: EmbeddingService,
    planner: QueryPlanner,
    hyde: HydeGenerator,
    reranker: Option<Arc<dyn Reranker>>,
    config: RetrievalConfig,
}

impl MultiQueryRetriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embeddings: EmbeddingService,
        model: Arc<dyn LanguageModel>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embeddings,
            planner: QueryPlanner::new(Arc::clone(&model), &config.tuning),
            hyde: HydeGenerator::new(model, &config.tuning),
            reranker: None,
            config,
        }
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Ranked documents for `query`; empty when nothing matched.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn retrieve(
        &self,
        collection: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Document>, AppError> {
        self.run(collection, query, cancel, false)
            .await
            .map(|run| run.results)
    }

    /// Same as [`Self::retrieve`], with stage timings and per-stage diagnostics.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn retrieve_with_metrics(
        &self,
        collection: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineRunOutput<Vec<Document>>, AppError> {
        self.run(collection, query, cancel, true).await
    }

    async fn run(
        &self,
        collection: &str,
        query: &str,
        cancel: &CancellationToken,
        capture_diagnostics: bool,
    ) -> Result<PipelineRunOutput<Vec<Document>>, AppError> {
        let services = pipeline::RetrievalServices {
            store: self.store.as_ref(),
            embeddings: &self.embeddings,
            planner: &self.planner,
            hyde: &self.hyde,
            reranker: self.reranker.as_deref(),
        };
        pipeline::run_pipeline(
            services,
            collection,
            query,
            self.config.clone(),
            cancel,
            capture_diagnostics,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{
        storage::vector::{
            CollectionConfig, Filter, InMemoryVectorStore, OrderBy, PayloadSchema, ScoredPoint,
            SearchRequest, VectorPoint,
        },
        utils::embedding_service::EmbeddingOptions,
    };
    use serde_json::json;
    use test_support::{KeyedEmbedder, ScriptedModel};

    /// Answers each search by the query vector's strongest axis.
    struct ScriptedStore {
        hits: Vec<Vec<(&'static str, f32)>>,
    }

    impl ScriptedStore {
        fn three_queries() -> Self {
            Self {
                hits: vec![
                    vec![("shared", 0.9), ("a", 0.8)],
                    vec![("b", 0.85), ("shared", 0.7)],
                    vec![("c", 0.88), ("shared", 0.6)],
                ],
            }
        }
    }

    #[async_trait]
    impl VectorStore for ScriptedStore {
        async fn create_collection(&self, _: &CollectionConfig) -> Result<(), AppError> {
            Ok(())
        }

        async fn create_payload_index(
            &self,
            _: &str,
            _: &str,
            _: PayloadSchema,
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn upsert(&self, _: &str, _: Vec<VectorPoint>) -> Result<(), AppError> {
            Ok(())
        }

        async fn search(
            &self,
            _: &str,
            request: SearchRequest,
        ) -> Result<Vec<ScoredPoint>, AppError> {
            let axis = request
                .vector
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map_or(0, |(i, _)| i);
            Ok(self
                .hits
                .get(axis)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|(id, score)| ScoredPoint {
                    id: id.to_string(),
                    score,
                    payload: json!({
                        "content": format!("document {id} about async rust"),
                        "metadata": { "id": id, "__type": "note" }
                    }),
                })
                .collect())
        }

        async fn scroll(
            &self,
            _: &str,
            _: Option<Filter>,
            _: Option<OrderBy>,
            _: usize,
        ) -> Result<Vec<VectorPoint>, AppError> {
            Ok(Vec::new())
        }

        async fn count(&self, _: &str, _: Option<Filter>) -> Result<usize, AppError> {
            Ok(0)
        }
    }

    fn e2e_tuning() -> RetrievalTuning {
        RetrievalTuning {
            max_docs: 5,
            queries_count: 4,
            min_query_count: 3,
            use_hyde: false,
            ..RetrievalTuning::default()
        }
    }

    fn e2e_embeddings() -> EmbeddingService {
        EmbeddingService::new(
            Arc::new(
                KeyedEmbedder::new(3)
                    .with_axis("rust async patterns", 0)
                    .with_axis("rust async runtime", 1)
                    .with_axis("tokio scheduler internals", 2),
            ),
            EmbeddingOptions::default(),
        )
    }

    fn e2e_model() -> ScriptedModel {
        ScriptedModel::new().with_structured(
            "query_plan",
            json!({
                "queries": ["rust async runtime", "tokio scheduler internals"],
                "tags": []
            }),
        )
    }

    #[tokio::test]
    async fn recurring_document_ranks_first() {
        let retriever = MultiQueryRetriever::new(
            Arc::new(ScriptedStore::three_queries()),
            e2e_embeddings(),
            Arc::new(e2e_model()),
            RetrievalConfig::new(e2e_tuning()),
        );

        let run = retriever
            .retrieve_with_metrics("personal_index", "rust async patterns", &CancellationToken::new())
            .await
            .expect("retrieve");

        let ids: Vec<String> = run.results.iter().map(Document::id).collect();
        assert_eq!(ids.first().map(String::as_str), Some("shared"));
        assert!(run.results.len() <= 5);
        assert_eq!(run.results.len(), 4);
        assert!(run.results[0].metadata.contains_key("rrfScore"));

        let diagnostics = run.diagnostics.expect("diagnostics");
        let plan = diagnostics.plan.expect("plan");
        assert_eq!(
            plan.queries,
            vec![
                "rust async patterns".to_string(),
                "rust async runtime".to_string(),
                "tokio scheduler internals".to_string()
            ]
        );
        let fan_out = diagnostics.fan_out.expect("fan out");
        assert_eq!(fan_out.attempted, 3);
        assert_eq!(fan_out.unique_documents, 4);
    }

    #[tokio::test]
    async fn reranker_order_wins_when_configured() {
        struct ReverseReranker;

        #[async_trait]
        impl Reranker for ReverseReranker {
            async fn rerank(
                &self,
                _query: &str,
                mut documents: Vec<Document>,
                top_k: usize,
            ) -> Result<Vec<Document>, AppError> {
                documents.reverse();
                documents.truncate(top_k);
                Ok(documents)
            }
        }

        let tuning = RetrievalTuning {
            rerank_min_candidates: 2,
            ..e2e_tuning()
        };
        let retriever = MultiQueryRetriever::new(
            Arc::new(ScriptedStore::three_queries()),
            e2e_embeddings(),
            Arc::new(e2e_model()),
            RetrievalConfig::new(tuning),
        )
        .with_reranker(Arc::new(ReverseReranker));

        let docs = retriever
            .retrieve("personal_index", "rust async patterns", &CancellationToken::new())
            .await
            .expect("retrieve");
        assert_eq!(docs.last().map(Document::id).as_deref(), Some("shared"));
    }

    #[tokio::test]
    async fn failing_reranker_falls_back_to_mmr() {
        struct BrokenReranker;

        #[async_trait]
        impl Reranker for BrokenReranker {
            async fn rerank(
                &self,
                _: &str,
                _: Vec<Document>,
                _: usize,
            ) -> Result<Vec<Document>, AppError> {
                Err(AppError::Processing("model unavailable".into()))
            }
        }

        let tuning = RetrievalTuning {
            rerank_min_candidates: 2,
            ..e2e_tuning()
        };
        let retriever = MultiQueryRetriever::new(
            Arc::new(ScriptedStore::three_queries()),
            e2e_embeddings(),
            Arc::new(e2e_model()),
            RetrievalConfig::new(tuning),
        )
        .with_reranker(Arc::new(BrokenReranker));

        let run = retriever
            .retrieve_with_metrics("personal_index", "rust async patterns", &CancellationToken::new())
            .await
            .expect("retrieve");
        assert_eq!(run.results[0].id(), "shared");
        let rank = run.diagnostics.and_then(|d| d.rank).expect("rank stats");
        assert!(!rank.reranked);
        assert!(rank.rerank_error.is_some());
    }

    #[tokio::test]
    async fn empty_query_and_empty_store_return_nothing() {
        let retriever = MultiQueryRetriever::new(
            Arc::new(InMemoryVectorStore::new()),
            EmbeddingService::new(Arc::new(KeyedEmbedder::new(3)), EmbeddingOptions::default()),
            Arc::new(ScriptedModel::new()),
            RetrievalConfig::default(),
        );
        let cancel = CancellationToken::new();

        assert!(retriever
            .retrieve("personal_index", "", &cancel)
            .await
            .expect("empty query")
            .is_empty());
        assert!(retriever
            .retrieve("personal_index", "   ", &cancel)
            .await
            .expect("blank query")
            .is_empty());
        assert!(retriever
            .retrieve("personal_index", "what did I listen to", &cancel)
            .await
            .expect("empty store")
            .is_empty());
    }

    #[tokio::test]
    async fn direct_strategy_skips_the_language_model() {
        let store = InMemoryVectorStore::new();
        store
            .create_collection(&CollectionConfig::new("personal_index", 3))
            .await
            .expect("collection");
        store
            .upsert(
                "personal_index",
                vec![VectorPoint {
                    id: "p1".into(),
                    vector: vec![0.0, 0.0, 1.0],
                    sparse_vector: None,
                    payload: json!({
                        "content": "Listened to Kind of Blue",
                        "metadata": { "id": "track-1", "__type": "track" }
                    }),
                }],
            )
            .await
            .expect("upsert");

        let model = Arc::new(ScriptedModel::new());
        let retriever = MultiQueryRetriever::new(
            Arc::new(store),
            EmbeddingService::new(Arc::new(KeyedEmbedder::new(3)), EmbeddingOptions::default()),
            model.clone(),
            RetrievalConfig::with_strategy(RetrievalStrategy::Direct),
        );

        let docs = retriever
            .retrieve("personal_index", "spotify songs", &CancellationToken::new())
            .await
            .expect("retrieve");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id(), "track-1");
        assert!(model.request_names().await.is_empty());
        assert!(model.text_prompts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_retrieval() {
        let retriever = MultiQueryRetriever::new(
            Arc::new(ScriptedStore::three_queries()),
            e2e_embeddings(),
            Arc::new(e2e_model()),
            RetrievalConfig::new(e2e_tuning()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = retriever
            .retrieve("personal_index", "rust async patterns", &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, AppError::Cancelled));
    }

    #[test]
    fn document_ids_fall_back_to_type_and_content() {
        let doc = Document::from_payload(&json!({
            "content": "Weekly sync with the platform team",
            "metadata": { "__type": "calendar_event" }
        }));
        assert_eq!(doc.id(), "calendar_event:Weekly sync with the platform team");

        let untyped = Document::new("x".repeat(100), Map::new());
        assert_eq!(untyped.id(), format!("unknown:{}", "x".repeat(80)));
        assert!((untyped.score() - 0.0).abs() < f32::EPSILON);
    }
}
