use std::{sync::Arc, time::Duration};

use futures::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    error::AppError,
    utils::{
        chunking::{ChunkerConfig, TextChunk, TextChunker},
        embedding::Embedder,
        retry::{linear_backoff, retry_with_cancel},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingOptions {
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_weight_chunks")]
    pub weight_chunks: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

const fn default_concurrency_limit() -> usize {
    2
}

const fn default_weight_chunks() -> bool {
    true
}

const fn default_max_retries() -> usize {
    3
}

const fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            concurrency_limit: default_concurrency_limit(),
            weight_chunks: default_weight_chunks(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Text to one fixed-size vector: chunk, embed each chunk with retry, combine.
#[derive(Clone)]
pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    chunker: TextChunker,
    options: EmbeddingOptions,
    expected_vector_size: usize,
}

impl EmbeddingService {
    pub fn new(embedder: Arc<dyn Embedder>, options: EmbeddingOptions) -> Self {
        let expected_vector_size = embedder.dimension();
        Self::with_expected_size(embedder, options, expected_vector_size)
    }

    pub fn with_expected_size(
        embedder: Arc<dyn Embedder>,
        options: EmbeddingOptions,
        expected_vector_size: usize,
    ) -> Self {
        Self {
            chunker: TextChunker::new(options.chunker),
            embedder,
            options,
            expected_vector_size,
        }
    }

    pub fn expected_vector_size(&self) -> usize {
        self.expected_vector_size
    }

    #[instrument(level = "trace", skip_all, fields(text_len = text.len()))]
    pub async fn generate_embeddings(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, AppError> {
        if text.trim().is_empty() {
            return Err(AppError::Validation("cannot embed empty text".to_string()));
        }

        let chunks = self.chunker.chunk_text(text);
        if !self.chunker.validate_chunks(&chunks, text) {
            return Err(AppError::Validation(
                "chunk validation failed; text may have been corrupted during preprocessing"
                    .to_string(),
            ));
        }

        let vectors = self.embed_chunks(&chunks, cancel).await?;
        let lengths: Vec<usize> = chunks.iter().map(|chunk| chunk.length).collect();
        let combined = combine_vectors(&vectors, &lengths, self.options.weight_chunks)?;

        if combined.len() != self.expected_vector_size {
            return Err(AppError::DimensionMismatch {
                expected: self.expected_vector_size,
                actual: combined.len(),
            });
        }

        debug!(
            chunk_count = chunks.len(),
            vector_size = combined.len(),
            "embedding generated"
        );

        Ok(combined)
    }

    async fn embed_chunks(
        &self,
        chunks: &[TextChunk],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, AppError> {
        if self.options.concurrency_limit <= 1 {
            let mut vectors = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                vectors.push(self.embed_chunk(chunk, cancel).await?);
            }
            return Ok(vectors);
        }

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; chunks.len()];
        let mut results = stream::iter(chunks.iter())
            .map(|chunk| async move {
                self.embed_chunk(chunk, cancel)
                    .await
                    .map(|vector| (chunk.index, vector))
            })
            .buffer_unordered(self.options.concurrency_limit)
            .boxed();

        while let Some((index, vector)) = results.try_next().await? {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(vector);
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| {
                    AppError::InternalError(format!("missing embedding for chunk {index}"))
                })
            })
            .collect()
    }

    async fn embed_chunk(
        &self,
        chunk: &TextChunk,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, AppError> {
        let expected = self.expected_vector_size;
        let delays = linear_backoff(
            Duration::from_millis(self.options.retry_delay_ms),
            self.options.max_retries.max(1),
        );

        retry_with_cancel(delays, cancel, "embed_chunk", || async {
            let vector = self.embedder.embed(&chunk.content).await?;
            if vector.len() != expected {
                return Err(AppError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
            Ok(vector)
        })
        .await
    }
}

/// Plain or length-weighted mean of equally sized vectors.
pub fn combine_vectors(
    vectors: &[Vec<f32>],
    lengths: &[usize],
    weighted: bool,
) -> Result<Vec<f32>, AppError> {
    let first = vectors
        .first()
        .ok_or_else(|| AppError::Validation("no vectors to combine".to_string()))?;
    let dimension = first.len();

    if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(AppError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        });
    }

    let total_weight: usize = lengths.iter().sum();
    let use_weights = weighted && total_weight > 0 && lengths.len() == vectors.len();

    let mut combined = vec![0.0f32; dimension];
    for (idx, vector) in vectors.iter().enumerate() {
        let weight = if use_weights {
            lengths.get(idx).copied().unwrap_or(0) as f32
        } else {
            1.0
        };
        for (slot, value) in combined.iter_mut().zip(vector) {
            *slot += value * weight;
        }
    }

    let divisor = if use_weights {
        total_weight as f32
    } else {
        vectors.len() as f32
    };
    for slot in &mut combined {
        *slot /= divisor;
    }

    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyEmbedder {
        failures_before_success: usize,
        calls: AtomicUsize,
        dimension: usize,
        returned_dimension: usize,
    }

    impl FlakyEmbedder {
        fn new(failures_before_success: usize, dimension: usize) -> Self {
            Self {
                failures_before_success,
                calls: AtomicUsize::new(0),
                dimension,
                returned_dimension: dimension,
            }
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(AppError::Processing("transient".into()));
            }
            let seed = text.len() as f32;
            Ok((0..self.returned_dimension).map(|i| seed + i as f32).collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }

    fn fast_options() -> EmbeddingOptions {
        EmbeddingOptions {
            retry_delay_ms: 1,
            ..EmbeddingOptions::default()
        }
    }

    #[test]
    fn weighted_combination_uses_chunk_lengths() {
        let combined = combine_vectors(&[vec![1.0, 0.0], vec![0.0, 1.0]], &[1, 3], true)
            .expect("combine");
        assert_eq!(combined, vec![0.25, 0.75]);
    }

    #[test]
    fn plain_mean_ignores_lengths() {
        let combined = combine_vectors(&[vec![1.0, 0.0], vec![0.0, 1.0]], &[1, 3], false)
            .expect("combine");
        assert_eq!(combined, vec![0.5, 0.5]);
    }

    #[test]
    fn combining_nothing_is_an_error() {
        assert!(combine_vectors(&[], &[], true).is_err());
    }

    #[tokio::test]
    async fn chunk_is_embedded_after_two_transient_failures() {
        let embedder = Arc::new(FlakyEmbedder::new(2, 4));
        let service = EmbeddingService::new(embedder.clone(), fast_options());

        let vector = service
            .generate_embeddings("short text", &CancellationToken::new())
            .await
            .expect("embedding succeeds on third call");

        assert_eq!(vector.len(), 4);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dimension_mismatch_fails_after_one_call() {
        let embedder = Arc::new(FlakyEmbedder {
            returned_dimension: 3,
            ..FlakyEmbedder::new(0, 4)
        });
        let service = EmbeddingService::new(embedder.clone(), fast_options());

        let err = service
            .generate_embeddings("short text", &CancellationToken::new())
            .await
            .expect_err("mismatch is fatal");

        assert!(matches!(
            err,
            AppError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_chunks_keep_their_order() {
        let options = EmbeddingOptions {
            chunker: ChunkerConfig {
                chunk_size: 40,
                chunk_overlap: 0,
                ..ChunkerConfig::default()
            },
            concurrency_limit: 3,
            weight_chunks: false,
            ..fast_options()
        };
        let text = "First sentence is here. Second sentence is longer here. Third one.";
        let sequential = EmbeddingService::new(
            Arc::new(FlakyEmbedder::new(0, 2)),
            EmbeddingOptions {
                concurrency_limit: 1,
                ..options
            },
        );
        let concurrent = EmbeddingService::new(Arc::new(FlakyEmbedder::new(0, 2)), options);
        let cancel = CancellationToken::new();

        let a = sequential.generate_embeddings(text, &cancel).await.expect("seq");
        let b = concurrent.generate_embeddings(text, &cancel).await.expect("conc");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn empty_text_fails_validation() {
        let service = EmbeddingService::new(Arc::new(FlakyEmbedder::new(0, 2)), fast_options());
        let err = service
            .generate_embeddings("   ", &CancellationToken::new())
            .await
            .expect_err("empty text");
        assert!(matches!(err, AppError::Validation(_)));
    }
}
