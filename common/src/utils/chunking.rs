use serde::{Deserialize, Serialize};
use text_splitter::{Characters, ChunkConfig, TextSplitter};
use tracing::warn;

/// One ordered piece of a chunked input string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub content: String,
    /// Length in characters.
    pub length: usize,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_true")]
    pub normalize_whitespace: bool,
    #[serde(default = "default_true")]
    pub preserve_sentences: bool,
}

const fn default_chunk_size() -> usize {
    1000
}

const fn default_chunk_overlap() -> usize {
    200
}

const fn default_true() -> bool {
    true
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            normalize_whitespace: true,
            preserve_sentences: true,
        }
    }
}

/// Splits text into overlapping character-sized chunks that break on sentence
/// boundaries where possible.
#[derive(Debug, Clone, Default)]
pub struct TextChunker {
    config: ChunkerConfig,
}

impl TextChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config: ChunkerConfig {
                chunk_size: config.chunk_size.max(1),
                ..config
            },
        }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    pub fn normalize(&self, text: &str) -> String {
        if !self.config.normalize_whitespace {
            return text.to_string();
        }
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub fn chunk_text(&self, text: &str) -> Vec<TextChunk> {
        let normalized = self.normalize(text);
        let size = self.config.chunk_size;

        if char_len(&normalized) <= size {
            return vec![make_chunk(normalized, 0)];
        }

        // One sentence per line, so the splitter's line level breaks on them first.
        let seeded = if self.config.preserve_sentences {
            split_sentences(&normalized).join("\n")
        } else {
            normalized
        };

        self.splitter()
            .chunks(&seeded)
            .map(|chunk| chunk.replace('\n', " "))
            .filter(|chunk| !chunk.is_empty())
            .enumerate()
            .map(|(index, content)| make_chunk(content, index))
            .collect()
    }

    /// Cheap corruption guard: the recombined chunks must stay close to the
    /// normalized original in length.
    pub fn validate_chunks(&self, chunks: &[TextChunk], original: &str) -> bool {
        if chunks.is_empty() {
            return false;
        }

        let original_len = char_len(&self.normalize(original)) as f64;
        let recombined = chunks
            .iter()
            .map(|chunk| chunk.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let recombined_len = char_len(&self.normalize(&recombined)) as f64;

        let tolerance = (original_len * 0.1)
            .max((self.config.chunk_overlap * chunks.len()) as f64)
            .max(1.0);

        (original_len - recombined_len).abs() < tolerance
    }

    fn effective_overlap(&self) -> usize {
        self.config.chunk_overlap.min(self.config.chunk_size / 2)
    }

    fn splitter(&self) -> TextSplitter<Characters> {
        let size = self.config.chunk_size;
        let overlap = self.effective_overlap();
        let config = ChunkConfig::new(size)
            .with_overlap(overlap)
            .unwrap_or_else(|err| {
                warn!(size, overlap, error = %err, "chunk overlap rejected, splitting without it");
                ChunkConfig::new(size)
            });
        TextSplitter::new(config)
    }
}

fn make_chunk(content: String, index: usize) -> TextChunk {
    TextChunk {
        length: char_len(&content),
        content,
        index,
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Splits after `.`, `!` or `?` when followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut prev_terminal = false;
    let mut in_gap = false;

    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if prev_terminal && !in_gap {
                let sentence = text[start..idx].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                in_gap = true;
            }
            continue;
        }
        if in_gap {
            start = idx;
            in_gap = false;
        }
        prev_terminal = matches!(ch, '.' | '!' | '?');
    }

    if !in_gap {
        let tail = text[start..].trim();
        if !tail.is_empty() {
            sentences.push(tail);
        }
    }

    sentences
}
