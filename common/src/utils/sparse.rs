use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Keyword weights keyed by a stable term index, sorted by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Dot product over shared indices.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (mut i, mut j, mut total) = (0usize, 0usize, 0f32);
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    total += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
            }
        }
        total
    }
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is", "it",
    "its", "of", "on", "or", "that", "the", "to", "was", "were", "will", "with", "i", "me", "my",
    "we", "our", "you", "your", "this", "these", "those", "have", "had", "do", "does", "did",
    "been", "being", "am", "which", "who", "whom", "what", "when", "where", "why", "how", "all",
    "each", "every", "both", "few", "more", "most", "other", "some", "such", "no", "nor", "not",
    "only", "own", "same", "so", "than", "too", "very", "can", "just", "should", "now",
];

/// BM25-style term weighting without corpus statistics.
#[derive(Debug, Clone, Copy)]
pub struct SparseEncoder {
    k1: f32,
    b: f32,
    avg_doc_length: f32,
}

impl Default for SparseEncoder {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            avg_doc_length: 100.0,
        }
    }
}

impl SparseEncoder {
    pub fn new(k1: f32, b: f32, avg_doc_length: f32) -> Self {
        Self {
            k1,
            b,
            avg_doc_length: avg_doc_length.max(1.0),
        }
    }

    pub fn encode(&self, text: &str) -> SparseVector {
        let tokens = tokenize(text);
        let doc_length = tokens.len() as f32;

        let mut term_freqs: HashMap<&str, u32> = HashMap::new();
        for token in &tokens {
            *term_freqs.entry(token.as_str()).or_insert(0) += 1;
        }

        let mut weights: BTreeMap<u32, f32> = BTreeMap::new();
        for (term, freq) in term_freqs {
            *weights.entry(term_index(term)).or_insert(0.0) += self.weight(freq as f32, doc_length);
        }

        let (indices, values) = weights.into_iter().unzip();
        SparseVector { indices, values }
    }

    fn weight(&self, term_freq: f32, doc_length: f32) -> f32 {
        let numerator = term_freq * (self.k1 + 1.0);
        let denominator =
            term_freq + self.k1 * (1.0 - self.b + self.b * (doc_length / self.avg_doc_length));
        numerator / denominator
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|token| token.chars().count() > 2)
        .filter(|token| !STOP_WORDS.contains(token))
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// 32-bit FNV-1a; stable across processes and releases.
pub fn term_index(term: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in term.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
