use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse, ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::AppError;

/// A structured-generation call: the model must answer with JSON matching `schema`.
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub system_prompt: String,
    pub prompt: String,
    pub temperature: f32,
}

/// Request/response language model capability.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate_text(
        &self,
        system_prompt: &str,
        prompt: &str,
        temperature: f32,
    ) -> Result<String, AppError>;

    async fn generate_structured(&self, request: StructuredRequest) -> Result<Value, AppError>;
}

/// Runs a structured request and deserializes the answer into `T`.
pub async fn generate_structured_as<T: DeserializeOwned>(
    model: &dyn LanguageModel,
    request: StructuredRequest,
) -> Result<T, AppError> {
    let name = request.name.clone();
    let value = model.generate_structured(request).await?;
    serde_json::from_value(value)
        .map_err(|e| AppError::LLMParsing(format!("Failed to parse {name} response: {e}")))
}

#[derive(Clone)]
pub struct OpenAiLanguageModel {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAiLanguageModel {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn build_request(
        &self,
        system_prompt: &str,
        prompt: &str,
        temperature: f32,
        response_format: Option<ResponseFormat>,
    ) -> Result<CreateChatCompletionRequest, AppError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .temperature(temperature)
            .messages([
                ChatCompletionRequestSystemMessage::from(system_prompt.to_string()).into(),
                ChatCompletionRequestUserMessage::from(prompt.to_string()).into(),
            ]);
        if let Some(format) = response_format {
            args.response_format(format);
        }
        Ok(args.build()?)
    }
}

fn first_content(response: CreateChatCompletionResponse) -> Result<String, AppError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or(AppError::LLMParsing(
            "No content found in LLM response".into(),
        ))
}

#[async_trait]
impl LanguageModel for OpenAiLanguageModel {
    async fn generate_text(
        &self,
        system_prompt: &str,
        prompt: &str,
        temperature: f32,
    ) -> Result<String, AppError> {
        let request = self.build_request(system_prompt, prompt, temperature, None)?;
        let response = self.client.chat().create(request).await?;
        first_content(response)
    }

    async fn generate_structured(&self, request: StructuredRequest) -> Result<Value, AppError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: Some(request.description.clone()),
                name: request.name.clone(),
                schema: Some(request.schema.clone()),
                strict: Some(true),
            },
        };

        let chat_request = self.build_request(
            &request.system_prompt,
            &request.prompt,
            request.temperature,
            Some(response_format),
        )?;
        let response = self.client.chat().create(chat_request).await?;
        let content = first_content(response)?;

        debug!(name = %request.name, bytes = content.len(), "structured response received");

        serde_json::from_str(&content).map_err(|e| {
            AppError::LLMParsing(format!("Failed to parse {} response: {e}", request.name))
        })
    }
}
