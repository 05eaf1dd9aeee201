use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Planned query variants, parallel fan-out, optional HyDE, fusion and rerank/MMR
    MultiQuery,
    /// The normalized user query alone with the keyword filter; never calls the language model
    Direct,
}

impl Default for RetrievalStrategy {
    fn default() -> Self {
        Self::MultiQuery
    }
}

impl std::str::FromStr for RetrievalStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "multi_query" | "multi-query" | "default" => Ok(Self::MultiQuery),
            "direct" | "single" => Ok(Self::Direct),
            other => Err(format!("unknown retrieval strategy '{other}'")),
        }
    }
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RetrievalStrategy::MultiQuery => "multi_query",
            RetrievalStrategy::Direct => "direct",
        };
        f.write_str(label)
    }
}

/// Tunable parameters that govern each retrieval stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalTuning {
    /// Documents returned to the caller.
    #[serde(default = "default_max_docs")]
    pub max_docs: usize,
    /// Fan-out workers, clamped to 1..=8.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_true")]
    pub use_hyde: bool,
    /// HyDE runs while unique hits stay below this share of `max_docs`.
    #[serde(default = "default_hyde_recall_ratio")]
    pub hyde_recall_ratio: f32,
    #[serde(default = "default_hyde_temperature")]
    pub hyde_temperature: f32,
    #[serde(default = "default_min_per_query_k")]
    pub min_per_query_k: usize,
    #[serde(default = "default_per_query_budget_factor")]
    pub per_query_budget_factor: f32,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,
    #[serde(default = "default_rrf_weight")]
    pub rrf_weight: f32,
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f32,
    #[serde(default = "default_true")]
    pub diversity_enabled: bool,
    #[serde(default = "default_diversity_lambda")]
    pub diversity_lambda: f32,
    #[serde(default = "default_query_similarity_min")]
    pub query_similarity_min: f32,
    #[serde(default = "default_query_similarity_max")]
    pub query_similarity_max: f32,
    /// Query variants requested from the planner, clamped to 4..=12.
    #[serde(default = "default_queries_count")]
    pub queries_count: usize,
    #[serde(default = "default_min_query_count")]
    pub min_query_count: usize,
    #[serde(default = "default_planner_temperature")]
    pub planner_temperature: f32,
    #[serde(default = "default_intent_temperature")]
    pub intent_temperature: f32,
    /// Consecutive low-gain batches that stop the fan-out.
    #[serde(default = "default_low_gain_window")]
    pub low_gain_window: usize,
    /// A batch adding fewer new unique ids than this counts as low gain.
    #[serde(default = "default_low_gain_min_new")]
    pub low_gain_min_new: usize,
    #[serde(default = "default_true")]
    pub rerank_enabled: bool,
    /// Rerank only runs with more candidates than this.
    #[serde(default = "default_rerank_min_candidates")]
    pub rerank_min_candidates: usize,
    #[serde(default = "default_rerank_max_docs")]
    pub rerank_max_docs: usize,
    #[serde(default = "default_rerank_preview_chars")]
    pub rerank_preview_chars: usize,
    #[serde(default = "default_rerank_temperature")]
    pub rerank_temperature: f32,
    /// Return an error instead of an empty result when every fan-out query failed.
    #[serde(default)]
    pub surface_total_failure: bool,
}

impl RetrievalTuning {
    pub fn clamped_concurrency(&self) -> usize {
        self.concurrency.clamp(1, 8)
    }

    pub fn clamped_queries_count(&self) -> usize {
        self.queries_count.clamp(4, 12)
    }

    pub fn clamped_min_query_count(&self) -> usize {
        self.min_query_count.clamp(1, self.clamped_queries_count())
    }

    /// `max(min_per_query_k, ceil(max_docs * factor / query_count))`.
    pub fn per_query_k(&self, query_count: usize) -> usize {
        let budget = self.max_docs as f32 * self.per_query_budget_factor;
        let per_query = (budget / query_count.max(1) as f32).ceil() as usize;
        per_query.max(self.min_per_query_k)
    }

    /// Unique-hit count below which HyDE is attempted.
    pub fn hyde_trigger(&self) -> usize {
        (self.max_docs as f32 * self.hyde_recall_ratio).floor() as usize
    }
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            max_docs: default_max_docs(),
            concurrency: default_concurrency(),
            score_threshold: default_score_threshold(),
            use_hyde: true,
            hyde_recall_ratio: default_hyde_recall_ratio(),
            hyde_temperature: default_hyde_temperature(),
            min_per_query_k: default_min_per_query_k(),
            per_query_budget_factor: default_per_query_budget_factor(),
            rrf_k: default_rrf_k(),
            rrf_weight: default_rrf_weight(),
            similarity_weight: default_similarity_weight(),
            diversity_enabled: true,
            diversity_lambda: default_diversity_lambda(),
            query_similarity_min: default_query_similarity_min(),
            query_similarity_max: default_query_similarity_max(),
            queries_count: default_queries_count(),
            min_query_count: default_min_query_count(),
            planner_temperature: default_planner_temperature(),
            intent_temperature: default_intent_temperature(),
            low_gain_window: default_low_gain_window(),
            low_gain_min_new: default_low_gain_min_new(),
            rerank_enabled: true,
            rerank_min_candidates: default_rerank_min_candidates(),
            rerank_max_docs: default_rerank_max_docs(),
            rerank_preview_chars: default_rerank_preview_chars(),
            rerank_temperature: default_rerank_temperature(),
            surface_total_failure: false,
        }
    }
}

/// Wrapper containing tuning plus the strategy selected for a request.
#[derive(Debug, Clone, Default)]
pub struct RetrievalConfig {
    pub strategy: RetrievalStrategy,
    pub tuning: RetrievalTuning,
}

impl RetrievalConfig {
    pub fn new(tuning: RetrievalTuning) -> Self {
        Self {
            strategy: RetrievalStrategy::default(),
            tuning,
        }
    }

    pub fn with_strategy(strategy: RetrievalStrategy) -> Self {
        Self {
            strategy,
            tuning: RetrievalTuning::default(),
        }
    }

    pub fn with_tuning(strategy: RetrievalStrategy, tuning: RetrievalTuning) -> Self {
        Self { strategy, tuning }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_max_docs() -> usize {
    100
}

const fn default_concurrency() -> usize {
    4
}

const fn default_score_threshold() -> f32 {
    0.2
}

const fn default_hyde_recall_ratio() -> f32 {
    0.6
}

const fn default_hyde_temperature() -> f32 {
    0.7
}

const fn default_min_per_query_k() -> usize {
    20
}

const fn default_per_query_budget_factor() -> f32 {
    1.5
}

const fn default_rrf_k() -> f32 {
    60.0
}

const fn default_rrf_weight() -> f32 {
    0.8
}

const fn default_similarity_weight() -> f32 {
    0.2
}

const fn default_diversity_lambda() -> f32 {
    0.7
}

const fn default_query_similarity_min() -> f32 {
    0.15
}

const fn default_query_similarity_max() -> f32 {
    0.65
}

const fn default_queries_count() -> usize {
    6
}

const fn default_min_query_count() -> usize {
    4
}

const fn default_planner_temperature() -> f32 {
    0.7
}

const fn default_intent_temperature() -> f32 {
    0.2
}

const fn default_low_gain_window() -> usize {
    3
}

const fn default_low_gain_min_new() -> usize {
    3
}

const fn default_rerank_min_candidates() -> usize {
    5
}

const fn default_rerank_max_docs() -> usize {
    100
}

const fn default_rerank_preview_chars() -> usize {
    300
}

const fn default_rerank_temperature() -> f32 {
    0.3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_query_budget_has_a_floor() {
        let tuning = RetrievalTuning::default();
        assert_eq!(tuning.per_query_k(6), 25);
        assert_eq!(tuning.per_query_k(12), 20);
        assert_eq!(tuning.per_query_k(0), 150);
        assert_eq!(tuning.hyde_trigger(), 60);
    }

    #[test]
    fn clamps_apply() {
        let tuning = RetrievalTuning {
            concurrency: 32,
            queries_count: 2,
            min_query_count: 9,
            ..RetrievalTuning::default()
        };
        assert_eq!(tuning.clamped_concurrency(), 8);
        assert_eq!(tuning.clamped_queries_count(), 4);
        assert_eq!(tuning.clamped_min_query_count(), 4);
    }

    #[test]
    fn strategy_parses_and_displays() {
        assert_eq!("direct".parse::<RetrievalStrategy>(), Ok(RetrievalStrategy::Direct));
        assert_eq!(
            "Multi-Query".parse::<RetrievalStrategy>(),
            Ok(RetrievalStrategy::MultiQuery)
        );
        assert!("graph".parse::<RetrievalStrategy>().is_err());
        assert_eq!(RetrievalStrategy::MultiQuery.to_string(), "multi_query");
    }

    #[test]
    fn tuning_deserializes_with_defaults() {
        let tuning: RetrievalTuning =
            serde_json::from_str(r#"{ "max_docs": 10, "use_hyde": false }"#).expect("tuning");
        assert_eq!(tuning.max_docs, 10);
        assert!(!tuning.use_hyde);
        assert_eq!(tuning.concurrency, 4);
        assert!(tuning.rerank_enabled);
    }
}
