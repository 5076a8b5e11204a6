//! In-memory mapping of item identifiers to embedding vectors for one category.

use std::collections::BTreeMap;

use super::vector::{self, VectorError};

/// Item -> embedding mapping for a single category.
///
/// Items are kept ordered by identifier so iteration and serialization are
/// deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryStore {
    dimensions: usize,
    entries: BTreeMap<String, Vec<f32>>,
}

impl CategoryStore {
    /// Create a new empty store with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            entries: BTreeMap::new(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the vector for `item`.
    ///
    /// Rejects vectors of the wrong length or with non-finite values.
    pub fn insert(&mut self, item: impl Into<String>, embedding: Vec<f32>) -> Result<(), VectorError> {
        vector::validate(&embedding, self.dimensions)?;
        self.entries.insert(item.into(), embedding);
        Ok(())
    }

    pub fn get(&self, item: &str) -> Option<&[f32]> {
        self.entries.get(item).map(Vec::as_slice)
    }

    pub fn contains(&self, item: &str) -> bool {
        self.entries.contains_key(item)
    }

    /// Iterate entries in item identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn items(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
