use common::utils::llm::{generate_structured_as, LanguageModel, StructuredRequest};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    prompts::{get_query_intent_schema, QUERY_INTENT_SYSTEM_PROMPT},
    type_filter::KNOWN_ENTITY_TYPES,
};

/// What the model understood the question to be about.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryIntent {
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub is_temporal_query: bool,
    #[serde(default)]
    pub time_reference: Option<String>,
}

/// Lowercases, maps separators to `_`, keeps only known types.
pub fn normalize_entity_types(raw: &[String]) -> Vec<String> {
    let mut types: Vec<String> = Vec::new();
    for value in raw {
        let normalized: String = value
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
            .collect();
        if KNOWN_ENTITY_TYPES.contains(&normalized.as_str()) && !types.contains(&normalized) {
            types.push(normalized);
        }
    }
    types
}

/// Asks the model for the query intent; any failure yields `None`.
pub async fn analyze_intent(
    model: &dyn LanguageModel,
    user_query: &str,
    temperature: f32,
) -> Option<QueryIntent> {
    let request = StructuredRequest {
        name: "query_intent".to_string(),
        description: "Record types and time period a question refers to".to_string(),
        schema: get_query_intent_schema(),
        system_prompt: QUERY_INTENT_SYSTEM_PROMPT.to_string(),
        prompt: format!("Question: {}", user_query.trim()),
        temperature,
    };

    match generate_structured_as::<QueryIntent>(model, request).await {
        Ok(raw) => {
            let intent = QueryIntent {
                entity_types: normalize_entity_types(&raw.entity_types),
                is_temporal_query: raw.is_temporal_query,
                time_reference: raw.time_reference.filter(|r| !r.trim().is_empty()),
            };
            info!(
                entity_types = ?intent.entity_types,
                is_temporal = intent.is_temporal_query,
                "Query intent analysed"
            );
            Some(intent)
        }
        Err(err) => {
            warn!(error = %err, "Query intent analysis failed, continuing without it");
            None
        }
    }
}
