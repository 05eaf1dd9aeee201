mod config;
mod diagnostics;
mod stages;
mod strategies;

pub use config::{RetrievalConfig, RetrievalStrategy, RetrievalTuning};
pub use diagnostics::{FanOutStats, HydeStats, PipelineDiagnostics, PlanStats, RankStats};
pub use stages::{PipelineContext, RetrievalServices};

use async_trait::async_trait;
use common::error::AppError;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Document;
use strategies::{DirectDriver, MultiQueryDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Plan,
    Filter,
    FanOut,
    Hyde,
    Fuse,
    Rank,
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError>;
}

pub type BoxedStage = Box<dyn PipelineStage>;

#[async_trait]
pub trait StrategyDriver: Send + Sync {
    type Output;

    fn stages(&self) -> Vec<BoxedStage>;
    fn finalize(&self, ctx: &mut PipelineContext<'_>) -> Result<Self::Output, AppError>;
}

#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn into_vec(self) -> Vec<(StageKind, Duration)> {
        self.timings
    }

    fn get_stage_ms(&self, kind: StageKind) -> u128 {
        self.timings
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, d)| d.as_millis())
    }

    pub fn plan_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Plan)
    }

    pub fn filter_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Filter)
    }

    pub fn fan_out_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::FanOut)
    }

    pub fn hyde_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Hyde)
    }

    pub fn fuse_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Fuse)
    }

    pub fn rank_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Rank)
    }
}

pub struct PipelineRunOutput<T> {
    pub results: T,
    pub diagnostics: Option<PipelineDiagnostics>,
    pub stage_timings: PipelineStageTimings,
}

pub async fn run_pipeline(
    services: RetrievalServices<'_>,
    collection: &str,
    input_text: &str,
    config: RetrievalConfig,
    cancel: &CancellationToken,
    capture_diagnostics: bool,
) -> Result<PipelineRunOutput<Vec<Document>>, AppError> {
    let input_chars = input_text.chars().count();
    let input_preview: String = input_text.chars().take(120).collect();
    let input_preview_clean = input_preview.replace('\n', " ");
    let preview_len = input_preview_clean.chars().count();
    info!(
        %collection,
        input_chars,
        preview_truncated = input_chars > preview_len,
        preview = %input_preview_clean,
        strategy = %config.strategy,
        "Starting retrieval pipeline"
    );

    if input_text.trim().is_empty() {
        debug!("Empty query, nothing to retrieve");
        return Ok(PipelineRunOutput {
            results: Vec::new(),
            diagnostics: capture_diagnostics.then(PipelineDiagnostics::default),
            stage_timings: PipelineStageTimings::default(),
        });
    }

    let strategy = config.strategy;
    let ctx = PipelineContext::new(
        services,
        collection.to_owned(),
        input_text.trim().to_owned(),
        config,
        cancel.clone(),
    );

    match strategy {
        RetrievalStrategy::MultiQuery => {
            run_with_driver(MultiQueryDriver::new(), ctx, capture_diagnostics).await
        }
        RetrievalStrategy::Direct => {
            run_with_driver(DirectDriver::new(), ctx, capture_diagnostics).await
        }
    }
}

async fn run_with_driver<D: StrategyDriver>(
    driver: D,
    mut ctx: PipelineContext<'_>,
    capture_diagnostics: bool,
) -> Result<PipelineRunOutput<D::Output>, AppError> {
    if capture_diagnostics {
        ctx.enable_diagnostics();
    }

    for stage in driver.stages() {
        if ctx.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let start = Instant::now();
        stage.execute(&mut ctx).await?;
        ctx.record_stage_duration(stage.kind(), start.elapsed());
    }

    let diagnostics = ctx.take_diagnostics();
    let stage_timings = ctx.take_stage_timings();
    let results = driver.finalize(&mut ctx)?;

    Ok(PipelineRunOutput {
        results,
        diagnostics,
        stage_timings,
    })
}
