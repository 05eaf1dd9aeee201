pub mod ids;
pub mod pipeline;
pub mod sources;

use std::{sync::Arc, time::Duration};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient, source::SourceStore, types::sync_state::SyncStateStore,
        vector::VectorStore,
    },
    utils::embedding_service::EmbeddingService,
};
pub use ids::deterministic_id;
pub use pipeline::{IndexingConfig, IndexingJob, IndexingPipeline, IndexingReport, IndexingTuning};
use sources::{
    CalendarEvent, EmbeddingDescriptor, GithubIssue, GithubPullRequest, GithubRepository,
    GmailMessage, LinearIssue, SpotifyPlaylist, SpotifyRecentlyPlayed, SpotifyTrack,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// One pipeline per supported source table, all reading from `db` and writing
/// into the same collection.
pub fn surreal_jobs(
    db: &Arc<SurrealDbClient>,
    vectors: &Arc<dyn VectorStore>,
    embeddings: &Arc<EmbeddingService>,
    config: &IndexingConfig,
) -> Vec<Arc<dyn IndexingJob>> {
    fn job<T: EmbeddingDescriptor>(
        db: &Arc<SurrealDbClient>,
        vectors: &Arc<dyn VectorStore>,
        embeddings: &Arc<EmbeddingService>,
        config: &IndexingConfig,
    ) -> Arc<dyn IndexingJob> {
        Arc::new(IndexingPipeline::<T>::new(
            Arc::clone(db) as Arc<dyn SourceStore<T>>,
            Arc::clone(db) as Arc<dyn SyncStateStore>,
            Arc::clone(vectors),
            Arc::clone(embeddings),
            config.clone(),
        ))
    }

    vec![
        job::<SpotifyTrack>(db, vectors, embeddings, config),
        job::<SpotifyPlaylist>(db, vectors, embeddings, config),
        job::<SpotifyRecentlyPlayed>(db, vectors, embeddings, config),
        job::<GithubRepository>(db, vectors, embeddings, config),
        job::<GithubPullRequest>(db, vectors, embeddings, config),
        job::<GithubIssue>(db, vectors, embeddings, config),
        job::<LinearIssue>(db, vectors, embeddings, config),
        job::<CalendarEvent>(db, vectors, embeddings, config),
        job::<GmailMessage>(db, vectors, embeddings, config),
    ]
}

/// Runs every job once, in order. A failing job is logged and does not stop the others.
pub async fn run_round(
    jobs: &[Arc<dyn IndexingJob>],
    per_run_limit: usize,
    cancel: &CancellationToken,
) -> Result<Vec<IndexingReport>, AppError> {
    let mut reports = Vec::with_capacity(jobs.len());
    for job in jobs {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        match job.execute(per_run_limit, cancel).await {
            Ok(report) => reports.push(report),
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(err) => error!(job = job.name(), error = %err, "indexing job failed"),
        }
    }
    Ok(reports)
}

/// Periodic indexing until `cancel` fires.
pub async fn run_worker_loop(
    jobs: Vec<Arc<dyn IndexingJob>>,
    per_run_limit: usize,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(
        jobs = jobs.len(),
        per_run_limit,
        interval_secs = interval.as_secs(),
        "indexing worker started"
    );

    loop {
        match run_round(&jobs, per_run_limit, &cancel).await {
            Ok(reports) => {
                let indexed: usize = reports.iter().map(|r| r.indexed).sum();
                info!(completed = reports.len(), indexed, "indexing round finished");
            }
            Err(_) => break,
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(interval) => {}
        }
    }

    info!("indexing worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::storage::types::StoredObject;
    use tokio::sync::Mutex;

    struct RecordingJob {
        name: &'static str,
        fail: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl IndexingJob for RecordingJob {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(
            &self,
            _limit: usize,
            _cancel: &CancellationToken,
        ) -> Result<IndexingReport, AppError> {
            self.calls.lock().await.push(self.name);
            if self.fail {
                return Err(AppError::Processing("source offline".into()));
            }
            Ok(IndexingReport {
                entity_type: self.name.to_string(),
                indexed: 1,
                ..IndexingReport::default()
            })
        }
    }

    fn jobs(calls: &Arc<Mutex<Vec<&'static str>>>) -> Vec<Arc<dyn IndexingJob>> {
        [("spotify_track", false), ("gmail_message", true), ("github_pull_request", false)]
            .into_iter()
            .map(|(name, fail)| {
                Arc::new(RecordingJob {
                    name,
                    fail,
                    calls: Arc::clone(calls),
                }) as Arc<dyn IndexingJob>
            })
            .collect()
    }

    #[tokio::test]
    async fn failing_job_does_not_stop_the_round() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let reports = run_round(&jobs(&calls), 50, &CancellationToken::new())
            .await
            .expect("round");

        assert_eq!(
            *calls.lock().await,
            vec!["spotify_track", "gmail_message", "github_pull_request"]
        );
        let entities: Vec<_> = reports.iter().map(|r| r.entity_type.as_str()).collect();
        assert_eq!(entities, vec!["spotify_track", "github_pull_request"]);
    }

    #[tokio::test]
    async fn worker_loop_exits_on_cancellation() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker_loop(
            jobs(&calls),
            10,
            Duration::from_secs(3600),
            cancel.clone(),
        ));

        while calls.lock().await.len() < 3 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        worker.await.expect("worker task");

        assert_eq!(calls.lock().await.len(), 3);
    }

    const ENTITY_TYPES: [&str; 9] = [
        SpotifyTrack::ENTITY_TYPE,
        SpotifyPlaylist::ENTITY_TYPE,
        SpotifyRecentlyPlayed::ENTITY_TYPE,
        GithubRepository::ENTITY_TYPE,
        GithubPullRequest::ENTITY_TYPE,
        GithubIssue::ENTITY_TYPE,
        LinearIssue::ENTITY_TYPE,
        CalendarEvent::ENTITY_TYPE,
        GmailMessage::ENTITY_TYPE,
    ];

    #[test]
    fn one_job_per_source() {
        let names = [
            SpotifyTrack::table_name(),
            SpotifyPlaylist::table_name(),
            SpotifyRecentlyPlayed::table_name(),
            GithubRepository::table_name(),
            GithubPullRequest::table_name(),
            GithubIssue::table_name(),
            LinearIssue::table_name(),
            CalendarEvent::table_name(),
            GmailMessage::table_name(),
        ];
        assert_eq!(
            names,
            [
                "spotify_track",
                "spotify_playlist",
                "spotify_recently_played",
                "github_repository",
                "github_pull_request",
                "github_issue",
                "linear_issue",
                "google_calendar_event",
                "gmail_message"
            ]
        );
    }

    #[test]
    fn every_routed_type_has_a_source() {
        for routed in retrieval_pipeline::type_filter::routed_types() {
            assert!(
                ENTITY_TYPES.contains(&routed),
                "type filter routes to `{routed}` but no source indexes it"
            );
        }
    }

    #[test]
    fn every_indexed_type_is_known_to_retrieval() {
        for entity_type in ENTITY_TYPES {
            assert!(
                retrieval_pipeline::type_filter::KNOWN_ENTITY_TYPES.contains(&entity_type),
                "`{entity_type}` is indexed but unknown to retrieval"
            );
        }
    }
}
