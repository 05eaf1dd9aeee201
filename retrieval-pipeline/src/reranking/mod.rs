use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::llm::{generate_structured_as, LanguageModel, StructuredRequest},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    pipeline::RetrievalTuning,
    prompts::{build_rerank_prompt, get_rerank_schema, RERANK_SYSTEM_PROMPT},
    scoring::clamp_unit,
    Document,
};

/// Reorders candidates by relevance to the query. Errors are fatal to the
/// rerank step only; callers fall back to diversity ranking.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<Document>,
        top_k: usize,
    ) -> Result<Vec<Document>, AppError>;
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    scores: Vec<RerankScore>,
}

#[derive(Debug, Deserialize)]
struct RerankScore {
    index: usize,
    relevance: f32,
}

/// Scores candidates 0-10 with one structured language-model call.
#[derive(Clone)]
pub struct LlmReranker {
    model: Arc<dyn LanguageModel>,
    max_docs_for_llm: usize,
    preview_chars: usize,
    temperature: f32,
}

impl LlmReranker {
    pub fn new(model: Arc<dyn LanguageModel>, tuning: &RetrievalTuning) -> Self {
        Self {
            model,
            max_docs_for_llm: tuning.rerank_max_docs.max(1),
            preview_chars: tuning.rerank_preview_chars,
            temperature: tuning.rerank_temperature,
        }
    }

    fn preview(&self, doc: &Document) -> String {
        doc.page_content
            .chars()
            .take(self.preview_chars)
            .collect::<String>()
            .replace('\n', " ")
    }
}

#[async_trait]
impl Reranker for LlmReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<Document>,
        top_k: usize,
    ) -> Result<Vec<Document>, AppError> {
        if documents.len() <= 1 {
            return Ok(documents);
        }

        // Positions (into `documents`) of the subset sent to the model.
        let mut subset: Vec<usize> = (0..documents.len()).collect();
        if documents.len() > self.max_docs_for_llm {
            warn!(
                total = documents.len(),
                max = self.max_docs_for_llm,
                "Too many documents for reranking, pre-filtering to top candidates"
            );
            subset.sort_by(|a, b| {
                let score = |i: &usize| documents.get(*i).map_or(0.0, Document::score);
                score(b).partial_cmp(&score(a)).unwrap_or(Ordering::Equal)
            });
            subset.truncate(self.max_docs_for_llm);
        }

        let previews: Vec<String> = subset
            .iter()
            .filter_map(|i| documents.get(*i))
            .map(|doc| self.preview(doc))
            .collect();

        let request = StructuredRequest {
            name: "rerank".to_string(),
            description: "Relevance score per document index".to_string(),
            schema: get_rerank_schema(),
            system_prompt: RERANK_SYSTEM_PROMPT.to_string(),
            prompt: build_rerank_prompt(query, &previews),
            temperature: self.temperature,
        };

        let response: RerankResponse = generate_structured_as(self.model.as_ref(), request)
            .await
            .map_err(|err| AppError::Processing(format!("Rerank failed: {err}")))?;

        let llm_scores: HashMap<usize, f32> = response
            .scores
            .into_iter()
            .map(|entry| (entry.index, entry.relevance.clamp(0.0, 10.0)))
            .collect();

        // Subset position i -> document index.
        let reranked: HashMap<usize, usize> = subset
            .iter()
            .enumerate()
            .map(|(pos, doc_index)| (*doc_index, pos))
            .collect();

        let mut scored: Vec<(Document, f32, bool)> = documents
            .into_iter()
            .enumerate()
            .map(|(i, doc)| match reranked.get(&i) {
                Some(pos) => (doc, llm_scores.get(pos).copied().unwrap_or(0.0), true),
                None => (doc, 0.0, false),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.2.cmp(&a.2)
                .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
        });

        debug!(
            reranked = subset.len(),
            output = scored.len().min(top_k),
            top = ?scored.iter().take(3).map(|s| s.1).collect::<Vec<_>>(),
            "Reranking completed"
        );

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(mut doc, score, was_reranked)| {
                doc.set_metadata("score", Value::from(clamp_unit(score / 10.0)));
                doc.set_metadata("rerankScore", Value::from(score));
                doc.set_metadata("wasReranked", Value::Bool(was_reranked));
                doc
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use tokio::sync::Mutex;

    struct ScoringModel {
        response: Result<Value, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScoringModel {
        fn new(response: Result<Value, String>) -> Self {
            Self {
                response,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScoringModel {
        async fn generate_text(&self, _: &str, _: &str, _: f32) -> Result<String, AppError> {
            Err(AppError::InternalError("unused".into()))
        }

        async fn generate_structured(&self, request: StructuredRequest) -> Result<Value, AppError> {
            self.prompts.lock().await.push(request.prompt);
            self.response.clone().map_err(AppError::InternalError)
        }
    }

    fn doc(id: &str, score: f64) -> Document {
        let mut metadata = Map::new();
        metadata.insert("id".into(), json!(id));
        metadata.insert("score".into(), json!(score));
        Document::new(format!("document {id}"), metadata)
    }

    fn tuning(max_docs: usize) -> RetrievalTuning {
        RetrievalTuning {
            rerank_max_docs: max_docs,
            ..RetrievalTuning::default()
        }
    }

    #[tokio::test]
    async fn orders_by_model_relevance_and_annotates_metadata() {
        let model = Arc::new(ScoringModel::new(Ok(json!({
            "scores": [
                { "index": 0, "relevance": 2.0 },
                { "index": 1, "relevance": 9.0 },
                { "index": 2, "relevance": 5.0 }
            ]
        }))));
        let reranker = LlmReranker::new(model, &tuning(100));

        let out = reranker
            .rerank("query", vec![doc("a", 0.9), doc("b", 0.8), doc("c", 0.7)], 10)
            .await
            .expect("rerank");

        let ids: Vec<String> = out.iter().map(Document::id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(out[0].metadata["rerankScore"], json!(9.0));
        assert_eq!(out[0].metadata["wasReranked"], json!(true));
        assert!((out[0].score() - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unscored_documents_follow_scored_ones() {
        let model = Arc::new(ScoringModel::new(Ok(json!({
            "scores": [
                { "index": 0, "relevance": 1.0 },
                { "index": 1, "relevance": 3.0 }
            ]
        }))));
        let reranker = LlmReranker::new(model.clone(), &tuning(2));

        // Only the two best-scored documents ("b", "c") reach the model.
        let out = reranker
            .rerank(
                "query",
                vec![doc("a", 0.1), doc("b", 0.9), doc("c", 0.8)],
                10,
            )
            .await
            .expect("rerank");

        let ids: Vec<String> = out.iter().map(Document::id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert_eq!(out[2].metadata["wasReranked"], json!(false));
        assert_eq!(out[2].metadata["rerankScore"], json!(0.0));

        let prompts = model.prompts.lock().await;
        assert!(prompts[0].contains("[0] document b"));
        assert!(!prompts[0].contains("document a"));
    }

    #[tokio::test]
    async fn respects_top_k_and_trivial_inputs() {
        let model = Arc::new(ScoringModel::new(Ok(json!({ "scores": [] }))));
        let reranker = LlmReranker::new(model, &tuning(100));

        assert!(reranker.rerank("q", Vec::new(), 5).await.expect("empty").is_empty());
        let single = reranker.rerank("q", vec![doc("a", 0.5)], 5).await.expect("single");
        assert_eq!(single.len(), 1);

        let out = reranker
            .rerank("q", vec![doc("a", 0.5), doc("b", 0.4), doc("c", 0.3)], 2)
            .await
            .expect("rerank");
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn model_failure_is_an_error() {
        let model = Arc::new(ScoringModel::new(Err("rate limited".into())));
        let reranker = LlmReranker::new(model, &tuning(100));
        let err = reranker
            .rerank("q", vec![doc("a", 0.5), doc("b", 0.4)], 5)
            .await
            .expect_err("should fail");
        assert!(matches!(err, AppError::Processing(_)));
    }
}
