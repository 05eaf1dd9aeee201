use std::{sync::Arc, time::Duration};

use clap::Parser;
use common::{
    storage::{
        db::SurrealDbClient,
        vector::{SurrealVectorStore, VectorStore},
    },
    utils::{
        config::get_config,
        embedding::EmbeddingProvider,
        embedding_service::{EmbeddingOptions, EmbeddingService},
    },
};
use indexing_pipeline::{run_round, run_worker_loop, surreal_jobs, IndexingConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Incrementally indexes source tables into the vector collection.
#[derive(Debug, Parser)]
#[command(name = "worker")]
struct Args {
    /// Run a single indexing round and print the reports as JSON.
    #[arg(long)]
    once: bool,
    /// Rows per source per round; defaults to `etl_batch_limit`.
    #[arg(long)]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let args = Args::parse();
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));
    let embedding_provider =
        Arc::new(EmbeddingProvider::from_config(&config, Some(openai_client)).await?);
    info!(
        embedding_backend = embedding_provider.backend_label(),
        embedding_dimension = embedding_provider.dimension(),
        "Embedding provider initialized"
    );
    let embeddings = Arc::new(EmbeddingService::new(
        embedding_provider,
        EmbeddingOptions::default(),
    ));

    let vectors: Arc<dyn VectorStore> = Arc::new(SurrealVectorStore::new(Arc::clone(&db)));
    let jobs = surreal_jobs(
        &db,
        &vectors,
        &embeddings,
        &IndexingConfig::new(&config.vector_collection, &config.connector_name),
    );
    let limit = args.limit.unwrap_or(config.etl_batch_limit);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });

    if args.once {
        let reports = run_round(&jobs, limit, &cancel).await?;
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    run_worker_loop(
        jobs,
        limit,
        Duration::from_secs(config.etl_interval_secs),
        cancel,
    )
    .await;
    Ok(())
}
