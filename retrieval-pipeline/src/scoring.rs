use std::{cmp::Ordering, collections::HashMap};

use serde::{Deserialize, Serialize};

use crate::{pipeline::RetrievalTuning, Document};

/// One query variant's raw hits in rank order. HyDE hits use `query_idx = -1`.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub query_idx: i32,
    pub results: Vec<(Document, f32)>,
}

/// A unique document with every appearance it made across query variants.
#[derive(Debug, Clone)]
pub struct RankedResult {
    pub doc: Document,
    pub best_score: f32,
    pub sum_score: f32,
    pub hits: usize,
    pub ranks: Vec<usize>,
    pub rrf_score: f32,
    pub final_score: f32,
}

/// Weights of the two signals blended into the final score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub rrf: f32,
    pub similarity: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            rrf: 0.8,
            similarity: 0.2,
        }
    }
}

impl FusionWeights {
    /// Rescales so the weights sum to 1; non-positive totals fall back to the defaults.
    pub fn normalized(self) -> Self {
        let total = self.rrf + self.similarity;
        if !total.is_finite() || total <= 0.0 {
            return Self::default();
        }
        if (total - 1.0).abs() > 0.001 {
            Self {
                rrf: self.rrf / total,
                similarity: self.similarity / total,
            }
        } else {
            self
        }
    }
}

/// Reciprocal rank fusion blended with the best raw similarity.
#[derive(Debug, Clone, Copy)]
pub struct RankFusion {
    k: f32,
    weights: FusionWeights,
}

impl Default for RankFusion {
    fn default() -> Self {
        Self::new(60.0, FusionWeights::default())
    }
}

impl RankFusion {
    pub fn new(k: f32, weights: FusionWeights) -> Self {
        Self {
            k: k.clamp(10.0, 100.0),
            weights: weights.normalized(),
        }
    }

    pub fn from_tuning(tuning: &RetrievalTuning) -> Self {
        Self::new(
            tuning.rrf_k,
            FusionWeights {
                rrf: tuning.rrf_weight,
                similarity: tuning.similarity_weight,
            },
        )
    }

    pub const fn k(&self) -> f32 {
        self.k
    }

    pub const fn weights(&self) -> FusionWeights {
        self.weights
    }

    /// Groups hits by document id and scores them:
    /// `rrf = Σ 1/(k + rank + 1)`, normalized by the number of query results,
    /// `final = w_rrf · rrf_norm + w_sim · best_score`. Sorted descending;
    /// ties keep first-seen order.
    pub fn fuse<F>(&self, query_results: &[QueryResult], id_of: F) -> Vec<RankedResult>
    where
        F: Fn(&Document) -> String,
    {
        if query_results.is_empty() {
            return Vec::new();
        }

        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut ranked: Vec<RankedResult> = Vec::new();

        for query in query_results {
            for (rank, (doc, score)) in query.results.iter().enumerate() {
                let id = id_of(doc);
                match positions.get(&id) {
                    Some(&pos) => {
                        if let Some(existing) = ranked.get_mut(pos) {
                            existing.hits += 1;
                            existing.sum_score += score;
                            existing.ranks.push(rank);
                            if *score > existing.best_score {
                                existing.best_score = *score;
                            }
                        }
                    }
                    None => {
                        positions.insert(id, ranked.len());
                        ranked.push(RankedResult {
                            doc: doc.clone(),
                            best_score: *score,
                            sum_score: *score,
                            hits: 1,
                            ranks: vec![rank],
                            rrf_score: 0.0,
                            final_score: 0.0,
                        });
                    }
                }
            }
        }

        let query_count = query_results.len() as f32;
        for hit in &mut ranked {
            hit.rrf_score = hit
                .ranks
                .iter()
                .map(|rank| 1.0 / (self.k + *rank as f32 + 1.0))
                .sum();
            let normalized = hit.rrf_score / query_count;
            hit.final_score =
                self.weights.rrf * normalized + self.weights.similarity * hit.best_score;
        }

        ranked.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(Ordering::Equal)
        });
        ranked
    }
}

pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}
