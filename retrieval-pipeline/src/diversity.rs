use std::collections::HashSet;

use tracing::debug;

use crate::{pipeline::RetrievalTuning, Document};

/// Maximal marginal relevance over ranked documents, plus a sanity check on
/// how varied a set of planned queries is.
#[derive(Debug, Clone, Copy)]
pub struct DiversityService {
    enabled: bool,
    lambda: f32,
    min_similarity: f32,
    max_similarity: f32,
}

impl Default for DiversityService {
    fn default() -> Self {
        Self::new(true, 0.7, 0.15, 0.65)
    }
}

impl DiversityService {
    pub fn new(enabled: bool, lambda: f32, min_similarity: f32, max_similarity: f32) -> Self {
        Self {
            enabled,
            lambda: lambda.clamp(0.0, 1.0),
            min_similarity: min_similarity.clamp(0.0, 1.0),
            max_similarity: max_similarity.clamp(0.0, 1.0),
        }
    }

    pub fn from_tuning(tuning: &RetrievalTuning) -> Self {
        Self::new(
            tuning.diversity_enabled,
            tuning.diversity_lambda,
            tuning.query_similarity_min,
            tuning.query_similarity_max,
        )
    }

    /// Average pairwise Jaccard similarity of the queries' word sets.
    pub fn average_query_similarity(queries: &[String]) -> Option<f32> {
        if queries.len() < 2 {
            return None;
        }

        let sets: Vec<HashSet<String>> = queries
            .iter()
            .map(|q| q.to_lowercase().split_whitespace().map(str::to_string).collect())
            .collect();

        let mut total = 0.0_f32;
        let mut comparisons = 0_u32;
        for (i, a) in sets.iter().enumerate() {
            for b in sets.iter().skip(i + 1) {
                total += jaccard(a, b);
                comparisons += 1;
            }
        }
        Some(total / comparisons as f32)
    }

    /// True when queries overlap enough to stay on topic but not so much that they repeat.
    pub fn validate_query_diversity(&self, queries: &[String]) -> bool {
        Self::average_query_similarity(queries).map_or(true, |avg| {
            avg >= self.min_similarity && avg <= self.max_similarity
        })
    }

    /// Keeps the first document, then greedily adds the candidate maximising
    /// `lambda * relevance + (1 - lambda) * diversity`, where relevance is the
    /// candidate's position among the remaining documents.
    pub fn apply_mmr(&self, docs: &[Document], max_docs: usize) -> Vec<Document> {
        if !self.enabled {
            return docs.iter().take(max_docs).cloned().collect();
        }

        let target = max_docs.min(docs.len());
        let Some((first, rest)) = docs.split_first() else {
            return Vec::new();
        };
        if target == 0 {
            return Vec::new();
        }

        let mut selected: Vec<(&Document, HashSet<String>)> = vec![(first, word_set(first))];
        let mut remaining: Vec<(&Document, HashSet<String>)> =
            rest.iter().map(|doc| (doc, word_set(doc))).collect();

        while selected.len() < target && !remaining.is_empty() {
            let count = remaining.len() as f32;
            let mut best: Option<(usize, f32)> = None;

            for (i, (_, tokens)) in remaining.iter().enumerate() {
                let max_similarity = selected
                    .iter()
                    .map(|(_, chosen)| token_cosine(tokens, chosen))
                    .fold(0.0_f32, f32::max);
                let relevance = 1.0 - i as f32 / count;
                let score = self.lambda * relevance + (1.0 - self.lambda) * (1.0 - max_similarity);
                if best.map_or(true, |(_, best_score)| score > best_score) {
                    best = Some((i, score));
                }
            }

            let Some((index, _)) = best else { break };
            selected.push(remaining.remove(index));
        }

        debug!(
            before = docs.len(),
            after = selected.len(),
            lambda = self.lambda,
            "MMR diversification applied"
        );

        selected.into_iter().map(|(doc, _)| doc.clone()).collect()
    }
}

/// First 100 lowercase words of the content.
fn word_set(doc: &Document) -> HashSet<String> {
    doc.page_content
        .to_lowercase()
        .split_whitespace()
        .take(100)
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

fn token_cosine(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f32;
    shared / ((a.len() * b.len()) as f32).sqrt()
}
