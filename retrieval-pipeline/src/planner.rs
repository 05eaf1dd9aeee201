use std::{collections::HashSet, sync::Arc};

use common::{
    error::AppError,
    utils::llm::{generate_structured_as, LanguageModel, StructuredRequest},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use unicode_normalization::UnicodeNormalization;

use crate::{
    diversity::DiversityService,
    intent::{analyze_intent, QueryIntent},
    pipeline::RetrievalTuning,
    prompts::{build_query_planning_prompt, get_query_plan_schema, QUERY_PLANNER_SYSTEM_PROMPT},
    type_filter::keyword_tags,
};

/// Vendor names kept in heuristic variants so domain filters still apply.
const DOMAIN_TOKENS: [&str; 5] = ["github", "linear", "spotify", "gmail", "calendar"];

const DOMAIN_PHRASES: [&str; 3] = ["recent work", "projects", "current focus"];

const GENERIC_PHRASES: [&str; 4] = [
    "related tasks",
    "similar content",
    "contextual information",
    "relevant documents",
];

const MIN_WORDS: usize = 2;
const MAX_WORDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Llm,
    Heuristic,
}

/// Query variants for one user question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub queries: Vec<String>,
    pub tags: Vec<String>,
    pub source: PlanSource,
    /// Heuristic queries were used, alone or topping up the model's.
    pub used_fallback: bool,
    /// False signals weaker recall, not an error.
    pub is_diverse: bool,
    pub intent: Option<QueryIntent>,
}

#[derive(Debug, Deserialize)]
struct GeneratedPlan {
    #[serde(default)]
    queries: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

pub struct QueryPlanner {
    model: Arc<dyn LanguageModel>,
    queries_count: usize,
    min_query_count: usize,
    temperature: f32,
    intent_temperature: f32,
    diversity: DiversityService,
}

impl QueryPlanner {
    pub fn new(model: Arc<dyn LanguageModel>, tuning: &RetrievalTuning) -> Self {
        Self {
            model,
            queries_count: tuning.clamped_queries_count(),
            min_query_count: tuning.clamped_min_query_count(),
            temperature: tuning.planner_temperature.clamp(0.0, 1.0),
            intent_temperature: tuning.intent_temperature.clamp(0.0, 1.0),
            diversity: DiversityService::from_tuning(tuning),
        }
    }

    /// Never fails: model errors or thin output degrade to the heuristic planner.
    #[instrument(skip_all, fields(queries_count = self.queries_count))]
    pub async fn plan_queries(&self, user_query: &str) -> QueryPlan {
        let intent = analyze_intent(self.model.as_ref(), user_query, self.intent_temperature).await;

        let mut plan = match self.plan_with_model(user_query, intent.as_ref()).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "Query planning failed, using heuristic plan");
                self.heuristic_plan(user_query)
            }
        };

        match DiversityService::average_query_similarity(&plan.queries) {
            Some(similarity) => info!(
                source = ?plan.source,
                queries = plan.queries.len(),
                used_fallback = plan.used_fallback,
                similarity,
                within_window = self.diversity.validate_query_diversity(&plan.queries),
                "Query plan ready"
            ),
            None => info!(
                source = ?plan.source,
                queries = plan.queries.len(),
                used_fallback = plan.used_fallback,
                "Query plan ready"
            ),
        }

        plan.intent = intent;
        plan
    }

    async fn plan_with_model(
        &self,
        user_query: &str,
        intent: Option<&QueryIntent>,
    ) -> Result<QueryPlan, AppError> {
        let request = StructuredRequest {
            name: "query_plan".to_string(),
            description: "Search query variants and topic tags".to_string(),
            schema: get_query_plan_schema(),
            system_prompt: QUERY_PLANNER_SYSTEM_PROMPT.to_string(),
            prompt: build_query_planning_prompt(
                user_query,
                self.queries_count,
                intent.map(|i| i.entity_types.as_slice()),
                intent.and_then(|i| i.time_reference.as_deref()),
            ),
            temperature: self.temperature,
        };

        let generated: GeneratedPlan = generate_structured_as(self.model.as_ref(), request).await?;

        let candidates: Vec<String> = generated
            .queries
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| (2..=100).contains(&q.chars().count()))
            .collect();
        let candidates = ensure_user_query(candidates, user_query);
        let cleaned = dedupe(&candidates, self.queries_count);
        let tags = merge_tags(&generated.tags, &keyword_tags(user_query));

        debug!(
            raw = generated.queries.len(),
            cleaned = cleaned.len(),
            "Model query variants cleaned"
        );

        if cleaned.len() >= self.min_query_count {
            return Ok(QueryPlan {
                queries: cleaned,
                tags,
                source: PlanSource::Llm,
                used_fallback: false,
                is_diverse: true,
                intent: None,
            });
        }

        let had_model_queries = !cleaned.is_empty();
        let mut merged = cleaned;
        merged.extend(self.heuristic_queries(user_query));
        let queries = dedupe(&merged, self.queries_count);

        warn!(
            min = self.min_query_count,
            total = queries.len(),
            "Too few model queries, topped up with heuristics"
        );

        Ok(QueryPlan {
            queries,
            tags,
            source: if had_model_queries {
                PlanSource::Llm
            } else {
                PlanSource::Heuristic
            },
            used_fallback: true,
            is_diverse: false,
            intent: None,
        })
    }

    pub fn heuristic_plan(&self, user_query: &str) -> QueryPlan {
        QueryPlan {
            queries: self.heuristic_queries(user_query),
            tags: keyword_tags(user_query),
            source: PlanSource::Heuristic,
            used_fallback: true,
            is_diverse: false,
            intent: None,
        }
    }

    fn heuristic_queries(&self, user_query: &str) -> Vec<String> {
        let base = user_query.trim().to_lowercase();
        let domains: Vec<&str> = base
            .split_whitespace()
            .filter(|token| DOMAIN_TOKENS.contains(token))
            .collect();
        let with_domain = |phrase: &str| {
            if domains.is_empty() {
                phrase.to_string()
            } else {
                format!("{} {phrase}", domains.join(" "))
            }
        };

        let mut candidates = vec![base.clone()];
        candidates.extend(DOMAIN_PHRASES.iter().map(|phrase| with_domain(*phrase)));
        candidates.extend(GENERIC_PHRASES.iter().map(|phrase| (*phrase).to_string()));

        dedupe(&candidates, self.queries_count)
    }
}

/// NFKC, lowercase, quotes dropped, other punctuation turned into spaces,
/// whitespace collapsed.
pub fn normalize_for_matching(text: &str) -> String {
    let mapped: String = text
        .nfkc()
        .flat_map(char::to_lowercase)
        .filter(|c| !matches!(*c, '"' | '\'' | '`' | '\u{2018}' | '\u{2019}' | '\u{201c}' | '\u{201d}'))
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalizes, keeps 2-8 word queries, drops repeats, stops at `limit`.
pub fn dedupe(candidates: &[String], limit: usize) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut result = Vec::new();

    for candidate in candidates {
        if result.len() >= limit {
            break;
        }
        let normalized = normalize_for_matching(candidate);
        let words = normalized.split_whitespace().count();
        if !(MIN_WORDS..=MAX_WORDS).contains(&words) {
            continue;
        }
        if seen.insert(normalized.clone()) {
            result.push(normalized);
        }
    }

    result
}

/// Puts the trimmed user query first unless an equivalent variant is present.
pub fn ensure_user_query(mut queries: Vec<String>, user_query: &str) -> Vec<String> {
    let trimmed = user_query.trim();
    if trimmed.is_empty() {
        return queries;
    }
    let target = normalize_for_matching(trimmed);
    if !queries.iter().any(|q| normalize_for_matching(q) == target) {
        queries.insert(0, trimmed.to_string());
    }
    queries
}

/// Case-insensitive union keeping the first spelling seen.
pub fn merge_tags(primary: &[String], secondary: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    primary
        .iter()
        .chain(secondary)
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .filter(|tag| seen.insert(tag.to_lowercase()))
        .map(str::to_string)
        .collect()
}
