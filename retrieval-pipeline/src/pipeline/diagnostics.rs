use serde::Serialize;

use crate::{planner::PlanSource, type_filter::TypeFilter};

/// Captures instrumentation for each retrieval stage when diagnostics are enabled.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineDiagnostics {
    pub plan: Option<PlanStats>,
    pub filter: Option<TypeFilter>,
    pub fan_out: Option<FanOutStats>,
    pub hyde: Option<HydeStats>,
    pub rank: Option<RankStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanStats {
    pub source: PlanSource,
    pub used_fallback: bool,
    pub is_diverse: bool,
    pub queries: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutStats {
    pub queries: usize,
    pub attempted: usize,
    pub failed: usize,
    pub unique_documents: usize,
    pub stopped_early: bool,
    pub time_filter_relaxed: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HydeStats {
    pub triggered: bool,
    pub hits: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RankStats {
    pub fused_documents: usize,
    pub candidates: usize,
    pub reranked: bool,
    pub rerank_error: Option<String>,
    pub returned: usize,
    pub top_scores: Vec<f32>,
}
