//! Exact top-K cosine similarity over a loaded embedding database.
//!
//! Every query is a brute-force scan of every stored vector. Norms of the
//! stored vectors are computed once at load time; vectors with zero norm
//! never take part in ranking.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;

use super::category::CategoryStore;
use super::store::{EmbeddingStore, StoreError, StoreWarning};
use super::vector::{self, VectorError};

/// A single ranked match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub category: String,
    pub item: String,
    /// Cosine similarity score in [-1.0, 1.0]
    pub score: f32,
}

/// Ranked results of one query plus everything skipped to produce them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryOutcome {
    pub results: Vec<QueryResult>,
    /// Number of stored vectors the query was ranked against
    pub eligible: usize,
    /// Categories that could not be loaded
    pub warnings: Vec<StoreWarning>,
}

impl QueryOutcome {
    /// No vector in the database could be ranked.
    pub fn is_empty_database(&self) -> bool {
        self.eligible == 0
    }
}

/// Errors that fail a single query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Query vector contains a non-finite value at position {0}")]
    NonFinite(usize),
}

impl From<VectorError> for QueryError {
    fn from(e: VectorError) -> Self {
        match e {
            VectorError::DimensionMismatch { expected, got } => {
                QueryError::DimensionMismatch { expected, got }
            }
            VectorError::NonFinite(position) => QueryError::NonFinite(position),
        }
    }
}

/// A stored vector ready for ranking.
struct Candidate {
    category: usize,
    item: String,
    embedding: Vec<f32>,
    norm: f64,
}

/// Read-only similarity engine over one database snapshot.
///
/// Immutable after construction, so a single instance can be shared across
/// threads (e.g. behind an `Arc`) and queried concurrently.
pub struct SimilarityEngine {
    categories: Vec<String>,
    /// Rankable vectors in (category, item) order
    candidates: Vec<Candidate>,
    dimensions: Option<usize>,
    total_items: usize,
    warnings: Vec<StoreWarning>,
}

impl SimilarityEngine {
    /// Load every category from `store` once.
    ///
    /// Unreadable categories are skipped and kept as warnings.
    pub fn load(store: &EmbeddingStore) -> Result<Self, StoreError> {
        let database = store.load_all()?;
        let dimensions = store.dimensions();

        Ok(Self::from_categories(database.categories, dimensions, database.warnings))
    }

    /// Build an engine from in-memory categories.
    ///
    /// `dimensions` defaults to that of the first category when `None`.
    pub fn from_categories(
        categories: BTreeMap<String, CategoryStore>,
        dimensions: Option<usize>,
        warnings: Vec<StoreWarning>,
    ) -> Self {
        let dimensions = dimensions.or_else(|| categories.values().next().map(|s| s.dimensions()));

        let mut names = Vec::with_capacity(categories.len());
        let mut candidates = Vec::new();
        let mut total_items = 0;
        let mut warnings = warnings;

        for (category_index, (name, store)) in categories.into_iter().enumerate() {
            if Some(store.dimensions()) != dimensions {
                log::warn!(
                    "Skipping category '{}': {} dimensions, database has {:?}",
                    name,
                    store.dimensions(),
                    dimensions
                );
                warnings.push(StoreWarning {
                    reason: format!(
                        "dimension mismatch: expected {}, got {}",
                        dimensions.unwrap_or_default(),
                        store.dimensions()
                    ),
                    category: name.clone(),
                });
            } else {
                total_items += store.len();
                for (item, embedding) in store.iter() {
                    let norm = vector::l2_norm(embedding);
                    if vector::is_zero_norm(norm) {
                        log::debug!("excluding zero-norm vector {}/{}", name, item);
                        continue;
                    }
                    candidates.push(Candidate {
                        category: category_index,
                        item: item.to_string(),
                        embedding: embedding.to_vec(),
                        norm,
                    });
                }
            }
            names.push(name);
        }

        Self {
            categories: names,
            candidates,
            dimensions,
            total_items,
            warnings,
        }
    }

    /// Database-wide dimension; `None` for an empty database.
    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    /// Vectors that take part in ranking.
    pub fn eligible(&self) -> usize {
        self.candidates.len()
    }

    /// All loaded vectors, including zero-norm ones.
    pub fn total_items(&self) -> usize {
        self.total_items
    }

    pub fn warnings(&self) -> &[StoreWarning] {
        &self.warnings
    }

    /// Return the `k` stored vectors most similar to `query`.
    ///
    /// Results are sorted by descending score; ties are broken by category
    /// name, then item identifier.
    pub fn query(&self, query: &[f32], k: usize) -> Result<QueryOutcome, QueryError> {
        if let Some(dimensions) = self.dimensions {
            vector::validate(query, dimensions)?;
        } else if let Some(position) = query.iter().position(|x| !x.is_finite()) {
            return Err(QueryError::NonFinite(position));
        }

        let mut outcome = QueryOutcome {
            results: Vec::new(),
            eligible: self.candidates.len(),
            warnings: self.warnings.clone(),
        };

        let query_norm = vector::l2_norm(query);
        if k == 0 || vector::is_zero_norm(query_norm) || self.candidates.is_empty() {
            return Ok(outcome);
        }

        let mut scored: Vec<(usize, f32)> = self
            .candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| {
                let score = vector::cosine_with_norms(
                    query,
                    query_norm,
                    &candidate.embedding,
                    candidate.norm,
                );
                (index, score)
            })
            .collect();

        // candidates are already in (category, item) order, so the index
        // is the tie-breaker
        let by_rank = |a: &(usize, f32), b: &(usize, f32)| -> Ordering {
            b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
        };

        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_rank);
            scored.truncate(k);
        }
        scored.sort_unstable_by(by_rank);

        outcome.results = scored
            .into_iter()
            .map(|(index, score)| {
                let candidate = &self.candidates[index];
                QueryResult {
                    category: self.categories[candidate.category].clone(),
                    item: candidate.item.clone(),
                    score,
                }
            })
            .collect();

        Ok(outcome)
    }
}
