use std::sync::Arc;

use common::{
    error::AppError,
    utils::{embedding_service::EmbeddingService, llm::LanguageModel},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{pipeline::RetrievalTuning, prompts::HYDE_SYSTEM_PROMPT};

/// Hypothetical document embeddings: search with the vector of an invented
/// answer instead of the question.
#[derive(Clone)]
pub struct HydeGenerator {
    model: Arc<dyn LanguageModel>,
    temperature: f32,
}

impl HydeGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, tuning: &RetrievalTuning) -> Self {
        Self {
            model,
            temperature: tuning.hyde_temperature.clamp(0.0, 1.0),
        }
    }

    pub async fn hypothetical_document(&self, user_query: &str) -> Result<String, AppError> {
        let text = self
            .model
            .generate_text(
                HYDE_SYSTEM_PROMPT,
                &format!("Question: {}", user_query.trim()),
                self.temperature,
            )
            .await?;

        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::LLMParsing(
                "hypothetical document was empty".to_string(),
            ));
        }
        Ok(text.to_string())
    }

    #[instrument(level = "trace", skip_all)]
    pub async fn embed_hypothetical(
        &self,
        user_query: &str,
        embeddings: &EmbeddingService,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, AppError> {
        let document = self.hypothetical_document(user_query).await?;
        debug!(chars = document.chars().count(), "Hypothetical document generated");
        embeddings.generate_embeddings(&document, cancel).await
    }
}
