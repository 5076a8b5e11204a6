//! Capabilities consumed by the embedding database.
//!
//! The feature extractor and the image decoding pipeline live outside the
//! database. They are reached only through two traits:
//!
//! - [`Preprocessor`]: file path -> fixed-shape normalized image tensor
//! - [`Embedder`]: image tensor -> (class scores, embedding vector)
//!
//! Concrete implementations:
//! - `preprocess`: decoding and resizing with the `image` crate
//! - `embedder`: image embedding models served by fastembed

mod embedder;
mod preprocess;

use std::path::{Path, PathBuf};

pub use embedder::{canonical_model_name, open_embedder, FastEmbedder, SUPPORTED_MODELS};
pub use preprocess::ImagePreprocessor;

/// Number of color channels in every tensor (RGB).
pub const CHANNELS: usize = 3;

/// A decoded image laid out as height x width x channel, values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl ImageTensor {
    /// Build a tensor, checking that `data` matches the declared shape.
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self, EmbedError> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(EmbedError::ShapeMismatch {
                expected: format!("{}x{}x{} ({} values)", height, width, CHANNELS, expected),
                got: format!("{} values", data.len()),
            });
        }
        Ok(Self { width, height, data })
    }

    /// Tensor filled with a single value.
    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize * CHANNELS],
        }
    }

    /// `[height, width, channels]`
    pub fn shape(&self) -> [usize; 3] {
        [self.height as usize, self.width as usize, CHANNELS]
    }

    /// Pixel at (x, y) as an RGB triple.
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 3] {
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [self.data[offset], self.data[offset + 1], self.data[offset + 2]]
    }
}

/// Output of a single forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedOutput {
    /// Class probabilities; empty when the model has no classification head
    pub class_scores: Vec<f32>,
    /// The embedding vector (length == `Embedder::dimensions()`)
    pub embedding: Vec<f32>,
}

/// Errors raised by a [`Preprocessor`].
#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("image not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },
}

/// Errors raised by an [`Embedder`].
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("tensor shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("embedding model unavailable: {0}")]
    Unavailable(String),

    #[error("embedding generation failed: {0}")]
    Failed(String),

    #[error("invalid model name: {0}")]
    InvalidModel(String),
}

impl EmbedError {
    /// Whether the error means no further item can be embedded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EmbedError::Unavailable(_) | EmbedError::InvalidModel(_))
    }
}

/// Maps a file path to a fixed-shape image tensor.
pub trait Preprocessor: Send + Sync {
    fn process(&self, path: &Path) -> Result<ImageTensor, PreprocessError>;
}

/// Maps an image tensor to class scores and an embedding vector.
///
/// Implementations must be deterministic for fixed weights and safe to call
/// from several threads at once.
pub trait Embedder: Send + Sync {
    /// Name of the model, recorded in every persisted category file.
    fn model_name(&self) -> &str;

    /// Length of every embedding this model produces.
    fn dimensions(&self) -> usize;

    fn embed(&self, tensor: &ImageTensor) -> Result<EmbedOutput, EmbedError>;

    /// SHA256 of the model name, used to tag persisted categories.
    fn model_id(&self) -> [u8; 32] {
        model_id_hash(self.model_name())
    }
}

/// Compute SHA256 hash of a model name for storage identification.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}
