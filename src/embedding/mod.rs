//! Per-category embedding database and exact similarity retrieval.
//!
//! # Architecture
//!
//! - `vector`: cosine similarity and vector validation
//! - `category`: in-memory item -> vector mapping for one label
//! - `store`: binary file I/O, one `<category>.emb` per label
//! - `builder`: walks a labeled dataset and persists every category
//! - `engine`: brute-force top-K cosine search over a loaded snapshot
//! - `service`: high-level build / query / classify entry points

mod builder;
mod category;
mod engine;
mod service;
mod store;
pub mod vector;

pub use builder::{BuildError, BuildReport, CategoryReport, IndexBuilder, SkippedItem};
pub use category::CategoryStore;
pub use engine::{QueryError, QueryOutcome, QueryResult, SimilarityEngine};
pub use service::{Classification, ImageSearchService, QueryInput, SearchError};
pub use store::{
    CategorySummary, EmbeddingStore, LoadedDatabase, StoreError, StoreWarning,
    CATEGORY_FILE_EXTENSION,
};
