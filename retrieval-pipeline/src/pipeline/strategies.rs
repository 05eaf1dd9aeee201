use super::{
    stages::{
        DirectPlanStage, FanOutStage, FilterStage, FuseStage, HydeStage, PipelineContext,
        PlanStage, RankStage,
    },
    BoxedStage, StrategyDriver,
};
use crate::Document;
use common::error::AppError;

pub struct MultiQueryDriver;

impl MultiQueryDriver {
    pub fn new() -> Self {
        Self
    }
}

impl StrategyDriver for MultiQueryDriver {
    type Output = Vec<Document>;

    fn stages(&self) -> Vec<BoxedStage> {
        vec![
            Box::new(PlanStage),
            Box::new(FilterStage),
            Box::new(FanOutStage),
            Box::new(HydeStage),
            Box::new(FuseStage),
            Box::new(RankStage { allow_rerank: true }),
        ]
    }

    fn finalize(&self, ctx: &mut PipelineContext<'_>) -> Result<Self::Output, AppError> {
        Ok(ctx.take_results())
    }
}

/// Single query, keyword filter, MMR; no language-model calls.
pub struct DirectDriver;

impl DirectDriver {
    pub fn new() -> Self {
        Self
    }
}

impl StrategyDriver for DirectDriver {
    type Output = Vec<Document>;

    fn stages(&self) -> Vec<BoxedStage> {
        vec![
            Box::new(DirectPlanStage),
            Box::new(FilterStage),
            Box::new(FanOutStage),
            Box::new(FuseStage),
            Box::new(RankStage {
                allow_rerank: false,
            }),
        ]
    }

    fn finalize(&self, ctx: &mut PipelineContext<'_>) -> Result<Self::Output, AppError> {
        Ok(ctx.take_results())
    }
}
