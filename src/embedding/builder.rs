//! Builds the embedding database from a labeled image dataset.
//!
//! Layout expected under the dataset root:
//!
//! ```text
//! dataset/
//!   cat/  a.jpg b.jpg ...
//!   dog/  c.jpg ...
//! ```
//!
//! Every immediate subdirectory is a category and every regular file inside
//! it an item. Categories are processed one at a time; within a category,
//! items are embedded on a bounded worker pool and accumulated by a single
//! writer before the category is persisted in one atomic write.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::Serialize;

use super::category::CategoryStore;
use super::store::{validate_category, EmbeddingStore, StoreError};
use crate::lock::FileLock;
use crate::model::{EmbedError, Embedder, Preprocessor};

/// Errors that stop a build entirely.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Dataset root not found: {}", .0.display())]
    DatasetNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Embedder unavailable: {0}")]
    EmbedderUnavailable(EmbedError),

    #[error("Database {} is locked by another build", .0.display())]
    Locked(PathBuf),

    #[error("Failed to start embedding workers: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// An item left out of its category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedItem {
    pub item: String,
    pub reason: String,
}

/// Outcome for one category.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategoryReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub failures: Vec<SkippedItem>,
}

impl CategoryReport {
    fn skip(&mut self, item: impl Into<String>, reason: impl Into<String>) {
        self.skipped += 1;
        self.failures.push(SkippedItem {
            item: item.into(),
            reason: reason.into(),
        });
    }
}

/// Summary of a build, one entry per persisted category.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildReport {
    pub categories: BTreeMap<String, CategoryReport>,
    /// The build stopped at a category boundary before finishing
    pub cancelled: bool,
}

impl BuildReport {
    pub fn total_succeeded(&self) -> usize {
        self.categories.values().map(|c| c.succeeded).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.categories.values().map(|c| c.skipped).sum()
    }
}

/// Per-item result coming back from the worker pool.
enum ItemOutcome {
    Embedded(Vec<f32>),
    Skipped(String),
    Fatal(EmbedError),
}

/// Walks a dataset and persists one category store per label.
pub struct IndexBuilder<'a> {
    preprocessor: Arc<dyn Preprocessor>,
    embedder: Arc<dyn Embedder>,
    store: &'a EmbeddingStore,
    parallelism: usize,
    cancel: Option<Arc<AtomicBool>>,
    progress: ProgressBar,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(
        preprocessor: Arc<dyn Preprocessor>,
        embedder: Arc<dyn Embedder>,
        store: &'a EmbeddingStore,
    ) -> Self {
        Self {
            preprocessor,
            embedder,
            store,
            parallelism: 1,
            cancel: None,
            progress: ProgressBar::hidden(),
        }
    }

    /// Number of embedding workers (at least 1).
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Flag checked between categories; setting it stops the build.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Progress bar advanced once per item.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Rebuild every category found under `dataset_root`.
    pub fn build(&self, dataset_root: &Path) -> Result<BuildReport, BuildError> {
        if !dataset_root.is_dir() {
            return Err(BuildError::DatasetNotFound(dataset_root.to_path_buf()));
        }

        let dimensions = self.embedder.dimensions();
        if dimensions == 0 {
            return Err(BuildError::EmbedderUnavailable(EmbedError::Unavailable(
                format!("model '{}' reports zero dimensions", self.embedder.model_name()),
            )));
        }

        log::debug!("scanning categories in {}", dataset_root.display());
        let categories = scan_categories(dataset_root)?;

        self.store.ensure_root()?;
        let lock = FileLock::try_acquire(self.store.root()).map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock {
                BuildError::Locked(self.store.root().to_path_buf())
            } else {
                BuildError::Io(e)
            }
        })?;
        log::debug!("holding {}", lock.path().display());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .thread_name(|i| format!("orion-embed-{}", i))
            .build()?;

        log::info!(
            "Building embedding database from {} ({} categories, {} workers)",
            dataset_root.display(),
            categories.len(),
            self.parallelism
        );

        let mut report = BuildReport::default();

        for (category, dir) in categories {
            if self.is_cancelled() {
                log::warn!("Build cancelled before category '{}'", category);
                report.cancelled = true;
                break;
            }

            let (store, category_report) = self.build_category(&pool, &category, &dir, dimensions)?;

            log::debug!("persisting category '{}'", category);
            self.store.save(&category, &store)?;

            log::info!(
                "Saved embeddings for {} ({} ok, {} skipped)",
                category,
                category_report.succeeded,
                category_report.skipped
            );
            report.categories.insert(category, category_report);
        }

        log::info!(
            "Embedding database built: {} categories, {} items, {} skipped",
            report.categories.len(),
            report.total_succeeded(),
            report.total_skipped()
        );

        Ok(report)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Embed every item of one category and accumulate the results.
    fn build_category(
        &self,
        pool: &rayon::ThreadPool,
        category: &str,
        dir: &Path,
        dimensions: usize,
    ) -> Result<(CategoryStore, CategoryReport), BuildError> {
        log::debug!("scanning items of '{}'", category);
        let (items, unreadable) = scan_items(dir)?;

        let mut report = CategoryReport::default();
        for name in unreadable {
            report.skip(name, "file name is not valid UTF-8");
        }

        self.progress.inc_length(items.len() as u64);
        self.progress.set_message(category.to_string());

        log::debug!("embedding {} items of '{}'", items.len(), category);
        let outcomes: Vec<ItemOutcome> = pool.install(|| {
            items
                .par_iter()
                .map(|(_, path)| {
                    let outcome = self.embed_item(path);
                    self.progress.inc(1);
                    outcome
                })
                .collect()
        });

        log::debug!("accumulating '{}'", category);
        let mut store = CategoryStore::new(dimensions);
        for ((item, _), outcome) in items.into_iter().zip(outcomes) {
            match outcome {
                ItemOutcome::Embedded(embedding) => match store.insert(item.clone(), embedding) {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => {
                        log::warn!("Skipping {}/{}: {}", category, item, e);
                        report.skip(item, e.to_string());
                    }
                },
                ItemOutcome::Skipped(reason) => {
                    log::warn!("Skipping {}/{}: {}", category, item, reason);
                    report.skip(item, reason);
                }
                ItemOutcome::Fatal(e) => {
                    log::error!("Embedder failed on {}/{}: {}", category, item, e);
                    return Err(BuildError::EmbedderUnavailable(e));
                }
            }
        }

        Ok((store, report))
    }

    fn embed_item(&self, path: &Path) -> ItemOutcome {
        let tensor = match self.preprocessor.process(path) {
            Ok(tensor) => tensor,
            Err(e) => return ItemOutcome::Skipped(e.to_string()),
        };

        match self.embedder.embed(&tensor) {
            Ok(output) => ItemOutcome::Embedded(output.embedding),
            Err(e) if e.is_fatal() => ItemOutcome::Fatal(e),
            Err(e) => ItemOutcome::Skipped(e.to_string()),
        }
    }
}

/// Immediate subdirectories of `root`, sorted by name.
fn scan_categories(root: &Path) -> Result<Vec<(String, PathBuf)>, BuildError> {
    let mut categories = Vec::new();

    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            log::warn!("Ignoring category directory with non UTF-8 name: {}", path.display());
            continue;
        };

        if let Err(e) = validate_category(name) {
            log::warn!("Ignoring directory {}: {}", path.display(), e);
            continue;
        }

        categories.push((name.to_string(), path));
    }

    categories.sort();
    Ok(categories)
}

/// Regular files in `dir`, sorted by name, plus names that are not UTF-8.
fn scan_items(dir: &Path) -> Result<(Vec<(String, PathBuf)>, Vec<String>), BuildError> {
    let mut items = Vec::new();
    let mut unreadable = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }

        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => items.push((name.to_string(), path)),
            None => unreadable.push(path.to_string_lossy().into_owned()),
        }
    }

    items.sort();
    unreadable.sort();
    Ok((items, unreadable))
}
