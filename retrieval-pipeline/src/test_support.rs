//! Scripted capability doubles shared by the pipeline tests.

use std::collections::HashMap;

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::{
        embedding::Embedder,
        llm::{LanguageModel, StructuredRequest},
    },
};
use serde_json::Value;
use tokio::sync::Mutex;

/// Answers structured requests by request name; unknown names fail.
#[derive(Default)]
pub struct ScriptedModel {
    structured: HashMap<String, Value>,
    text: Option<String>,
    pub requests: Mutex<Vec<StructuredRequest>>,
    pub text_prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_structured(mut self, name: &str, response: Value) -> Self {
        self.structured.insert(name.to_string(), response);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub async fn request_names(&self) -> Vec<String> {
        self.requests
            .lock()
            .await
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate_text(
        &self,
        _system_prompt: &str,
        prompt: &str,
        _temperature: f32,
    ) -> Result<String, AppError> {
        self.text_prompts.lock().await.push(prompt.to_string());
        self.text
            .clone()
            .ok_or_else(|| AppError::InternalError("no scripted text".into()))
    }

    async fn generate_structured(&self, request: StructuredRequest) -> Result<Value, AppError> {
        let response = self.structured.get(&request.name).cloned();
        let name = request.name.clone();
        self.requests.lock().await.push(request);
        response.ok_or_else(|| AppError::InternalError(format!("no scripted response for {name}")))
    }
}

/// Maps known texts to fixed vectors; anything else embeds to the last axis.
pub struct KeyedEmbedder {
    dimension: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl KeyedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
        }
    }

    /// `text` embeds to the unit vector on `axis`.
    pub fn with_axis(mut self, text: &str, axis: usize) -> Self {
        let mut vector = vec![0.0; self.dimension];
        if let Some(slot) = vector.get_mut(axis) {
            *slot = 1.0;
        }
        self.vectors.insert(text.to_string(), vector);
        self
    }
}

#[async_trait]
impl Embedder for KeyedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        if let Some(vector) = self.vectors.get(text) {
            return Ok(vector.clone());
        }
        let mut vector = vec![0.0; self.dimension];
        if let Some(last) = vector.last_mut() {
            *last = 1.0;
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
