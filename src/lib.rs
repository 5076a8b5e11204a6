//! # orion - image embedding database
//!
//! Persists per-category collections of image embeddings and answers exact
//! nearest-neighbour queries by cosine similarity.
//!
//! ## Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use orion::embedding::{CategoryStore, SimilarityEngine};
//!
//! let mut cat = CategoryStore::new(2);
//! cat.insert("a.jpg", vec![1.0, 0.0]).unwrap();
//! let mut dog = CategoryStore::new(2);
//! dog.insert("b.jpg", vec![0.0, 1.0]).unwrap();
//!
//! let categories = BTreeMap::from([("cat".to_string(), cat), ("dog".to_string(), dog)]);
//! let engine = SimilarityEngine::from_categories(categories, None, Vec::new());
//!
//! let outcome = engine.query(&[1.0, 0.0], 5).unwrap();
//! assert_eq!(outcome.results[0].category, "cat");
//! assert_eq!(outcome.results[0].score, 1.0);
//! ```

pub mod config;
pub mod embedding;
mod lock;
pub mod model;

#[cfg(test)]
mod tests;
