use std::sync::Arc;

use clap::Parser;
use common::{
    storage::{db::SurrealDbClient, vector::SurrealVectorStore},
    utils::{
        config::get_config,
        embedding::EmbeddingProvider,
        embedding_service::{EmbeddingOptions, EmbeddingService},
        llm::{LanguageModel, OpenAiLanguageModel},
    },
};
use retrieval_pipeline::{
    reranking::LlmReranker, MultiQueryRetriever, RetrievalConfig, RetrievalStrategy,
    RetrievalTuning,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Retrieves documents for a natural-language query and prints them as JSON.
#[derive(Debug, Parser)]
#[command(name = "retrieve")]
struct Args {
    query: String,
    #[arg(long, value_enum, default_value_t = RetrievalStrategy::MultiQuery)]
    strategy: RetrievalStrategy,
    /// Collection to search; defaults to `vector_collection`.
    #[arg(long)]
    collection: Option<String>,
    #[arg(long)]
    max_docs: Option<usize>,
    #[arg(long)]
    no_hyde: bool,
    /// Rerank candidates with the language model before diversity selection.
    #[arg(long)]
    rerank: bool,
    /// Include stage timings and diagnostics in the output.
    #[arg(long)]
    metrics: bool,
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

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));
    let embedding_provider = Arc::new(
        EmbeddingProvider::from_config(&config, Some(Arc::clone(&openai_client))).await?,
    );
    let embeddings = EmbeddingService::new(embedding_provider, EmbeddingOptions::default());
    let model: Arc<dyn LanguageModel> = Arc::new(OpenAiLanguageModel::new(
        openai_client,
        config.processing_model.clone(),
    ));

    let mut tuning = RetrievalTuning::default();
    if let Some(max_docs) = args.max_docs {
        tuning.max_docs = max_docs;
    }
    if args.no_hyde {
        tuning.use_hyde = false;
    }

    let mut retriever = MultiQueryRetriever::new(
        Arc::new(SurrealVectorStore::new(db)),
        embeddings,
        Arc::clone(&model),
        RetrievalConfig::with_tuning(args.strategy, tuning.clone()),
    );
    if args.rerank {
        retriever = retriever.with_reranker(Arc::new(LlmReranker::new(model, &tuning)));
    }

    let collection = args.collection.unwrap_or(config.vector_collection);
    let cancel = CancellationToken::new();

    let output = if args.metrics {
        let run = retriever
            .retrieve_with_metrics(&collection, &args.query, &cancel)
            .await?;
        let timings: Vec<_> = run
            .stage_timings
            .into_vec()
            .into_iter()
            .map(|(stage, duration)| json!({ "stage": format!("{stage:?}"), "ms": duration.as_millis() }))
            .collect();
        json!({
            "documents": run.results,
            "diagnostics": run.diagnostics,
            "stage_timings": timings,
        })
    } else {
        json!({ "documents": retriever.retrieve(&collection, &args.query, &cancel).await? })
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
