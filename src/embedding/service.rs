//! Image search service tying the capabilities to the database.
//!
//! Provides a high-level interface over the embedding database:
//! - Builds the database with the injected preprocessor and embedder
//! - Lazily loads one immutable engine snapshot and shares it across queries
//! - Drops the snapshot after every rebuild so the next query sees fresh data

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use indicatif::ProgressBar;
use serde::Serialize;

use super::builder::{BuildError, BuildReport, IndexBuilder};
use super::engine::{QueryError, QueryOutcome, SimilarityEngine};
use super::store::{CategorySummary, EmbeddingStore, StoreError};
use crate::model::{EmbedError, Embedder, PreprocessError, Preprocessor};

/// Errors that can occur during image search operations.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Preprocessing error: {0}")]
    Preprocess(#[from] PreprocessError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbedError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// What to search with.
#[derive(Debug, Clone, Copy)]
pub enum QueryInput<'a> {
    Vector(&'a [f32]),
    Image(&'a Path),
}

/// Arg-max over the embedder's class scores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    /// `None` when the model has no classification head
    pub class_index: Option<usize>,
    pub confidence: Option<f32>,
    /// Length of the embedding produced for the image
    pub dimensions: usize,
}

/// Service for building and querying the image embedding database.
///
/// Constructed explicitly from its capabilities; holds no global state.
pub struct ImageSearchService {
    preprocessor: Arc<dyn Preprocessor>,
    embedder: Arc<dyn Embedder>,
    store: EmbeddingStore,
    parallelism: usize,
    cancel: Arc<AtomicBool>,
    /// Lazily loaded snapshot; cleared by `build_database`
    engine: Mutex<Option<Arc<SimilarityEngine>>>,
}

impl ImageSearchService {
    /// Create a service over the database in `embeddings_dir`.
    ///
    /// The store is pinned to the embedder's model and dimension, so
    /// categories written by another model are skipped on load.
    pub fn new(
        preprocessor: Arc<dyn Preprocessor>,
        embedder: Arc<dyn Embedder>,
        embeddings_dir: PathBuf,
    ) -> Self {
        let store = EmbeddingStore::open(embeddings_dir, embedder.model_id())
            .with_dimensions(embedder.dimensions());

        Self {
            preprocessor,
            embedder,
            store,
            parallelism: 1,
            cancel: Arc::new(AtomicBool::new(false)),
            engine: Mutex::new(None),
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Share a cancellation flag with the caller (e.g. a Ctrl-C handler).
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Rebuild the database from a labeled dataset.
    pub fn build_database(&self, dataset_root: &Path) -> Result<BuildReport, SearchError> {
        self.build_database_with_progress(dataset_root, ProgressBar::hidden())
    }

    pub fn build_database_with_progress(
        &self,
        dataset_root: &Path,
        progress: ProgressBar,
    ) -> Result<BuildReport, SearchError> {
        let result = IndexBuilder::new(self.preprocessor.clone(), self.embedder.clone(), &self.store)
            .with_parallelism(self.parallelism)
            .with_cancel_flag(self.cancel.clone())
            .with_progress(progress)
            .build(dataset_root);

        // even a failed build may have replaced some categories
        self.invalidate()?;

        Ok(result?)
    }

    /// Rank the database against a vector or an image.
    pub fn similarity_query(&self, input: QueryInput<'_>, k: usize) -> Result<QueryOutcome, SearchError> {
        let engine = self.engine()?;

        let outcome = match input {
            QueryInput::Vector(vector) => engine.query(vector, k)?,
            QueryInput::Image(path) => {
                let tensor = self.preprocessor.process(path)?;
                let output = self.embedder.embed(&tensor)?;
                engine.query(&output.embedding, k)?
            }
        };

        if outcome.is_empty_database() {
            log::warn!("Query ran against an empty embedding database");
        }

        Ok(outcome)
    }

    /// Predict the class of a single image.
    pub fn classify(&self, path: &Path) -> Result<Classification, SearchError> {
        let tensor = self.preprocessor.process(path)?;
        let output = self.embedder.embed(&tensor)?;

        let best = output
            .class_scores
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, score)| score.is_finite())
            .max_by(|a, b| a.1.total_cmp(&b.1));

        Ok(Classification {
            class_index: best.map(|(index, _)| index),
            confidence: best.map(|(_, score)| score),
            dimensions: output.embedding.len(),
        })
    }

    /// Item counts per persisted category, read from file headers.
    pub fn stats(&self) -> Result<Vec<CategorySummary>, SearchError> {
        Ok(self.store.stats()?)
    }

    /// The current engine snapshot, loading it on first use.
    pub fn engine(&self) -> Result<Arc<SimilarityEngine>, SearchError> {
        let mut guard = self
            .engine
            .lock()
            .map_err(|e| SearchError::Internal(format!("Lock poisoned: {}", e)))?;

        if let Some(engine) = guard.as_ref() {
            return Ok(engine.clone());
        }

        log::info!("Loading embedding database from {}", self.store.root().display());
        let engine = Arc::new(SimilarityEngine::load(&self.store)?);
        *guard = Some(engine.clone());

        Ok(engine)
    }

    fn invalidate(&self) -> Result<(), SearchError> {
        let mut guard = self
            .engine
            .lock()
            .map_err(|e| SearchError::Internal(format!("Lock poisoned: {}", e)))?;
        *guard = None;
        Ok(())
    }
}
