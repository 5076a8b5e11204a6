//! Image embedding model wrapper for fastembed.
//!
//! Provides the production [`Embedder`]:
//! - Explicit construction through [`open_embedder`] (no global model)
//! - Model download into a configurable cache directory on first use
//! - Dimension probing at construction time

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use ::fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions};

use super::preprocess::tensor_to_image;
use super::{EmbedError, EmbedOutput, Embedder, ImageTensor};

/// Model names accepted by [`open_embedder`].
pub const SUPPORTED_MODELS: &[&str] = &[
    "clip-vit-b-32",
    "resnet50",
    "unicom-vit-b-16",
    "unicom-vit-b-32",
    "nomic-embed-vision-v1.5",
];

/// Resolve a model name or alias to its entry in [`SUPPORTED_MODELS`].
///
/// Persisted categories are tagged with the canonical name.
pub fn canonical_model_name(name: &str) -> Result<&'static str, EmbedError> {
    let canonical = match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => "clip-vit-b-32",
        "resnet50" | "resnet-50" => "resnet50",
        "unicom-vit-b-16" | "unicomvitb16" => "unicom-vit-b-16",
        "unicom-vit-b-32" | "unicomvitb32" => "unicom-vit-b-32",
        "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => "nomic-embed-vision-v1.5",
        _ => {
            return Err(EmbedError::InvalidModel(format!(
                "Unknown model: {}. Supported models: {}",
                name,
                SUPPORTED_MODELS.join(", ")
            )))
        }
    };
    Ok(canonical)
}

/// Wrapper around fastembed's ImageEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct FastEmbedder {
    model: Mutex<ImageEmbedding>,
    model_name: String,
    dimensions: usize,
    image_size: u32,
}

/// Construct the embedder for `model_name`, caching weights under `cache_dir`.
pub fn open_embedder(
    model_name: &str,
    cache_dir: PathBuf,
    image_size: u32,
) -> Result<Arc<dyn Embedder>, EmbedError> {
    Ok(Arc::new(FastEmbedder::new(model_name, cache_dir, image_size)?))
}

impl FastEmbedder {
    /// Create a new embedder with the given model name.
    ///
    /// The model will be downloaded on first use if not cached.
    pub fn new(model_name: &str, cache_dir: PathBuf, image_size: u32) -> Result<Self, EmbedError> {
        let model_enum = Self::parse_model_name(model_name)?;

        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            EmbedError::Unavailable(format!("failed to create models directory: {}", e))
        })?;

        log::info!("Loading image model '{}' from {}", model_name, cache_dir.display());

        let options = ImageInitOptions::new(model_enum)
            .with_cache_dir(cache_dir)
            .with_show_download_progress(true);

        let model =
            ImageEmbedding::try_new(options).map_err(|e| EmbedError::Unavailable(e.to_string()))?;

        let mut embedder = Self {
            model: Mutex::new(model),
            model_name: canonical_model_name(model_name)?.to_string(),
            dimensions: 0,
            image_size,
        };
        embedder.dimensions = embedder.probe_dimensions()?;

        log::debug!(
            "model '{}' produces {}-dimensional embeddings",
            embedder.model_name,
            embedder.dimensions
        );

        Ok(embedder)
    }

    fn parse_model_name(name: &str) -> Result<ImageEmbeddingModel, EmbedError> {
        let model = match canonical_model_name(name)? {
            "clip-vit-b-32" => ImageEmbeddingModel::ClipVitB32,
            "resnet50" => ImageEmbeddingModel::Resnet50,
            "unicom-vit-b-16" => ImageEmbeddingModel::UnicomVitB16,
            "unicom-vit-b-32" => ImageEmbeddingModel::UnicomVitB32,
            _ => ImageEmbeddingModel::NomicEmbedVisionV15,
        };
        Ok(model)
    }

    /// Probe the model with a blank image to determine embedding dimensions.
    fn probe_dimensions(&self) -> Result<usize, EmbedError> {
        let blank = ImageTensor::filled(self.image_size, self.image_size, 0.5);
        let embedding = self
            .run(&blank)
            .map_err(|e| EmbedError::Unavailable(format!("failed to probe dimensions: {}", e)))?;
        Ok(embedding.len())
    }

    /// fastembed consumes image files, so the tensor is written to a
    /// temporary PNG and embedded from there.
    fn run(&self, tensor: &ImageTensor) -> Result<Vec<f32>, EmbedError> {
        let img = tensor_to_image(tensor).ok_or_else(|| EmbedError::ShapeMismatch {
            expected: format!("{}x{}x3", tensor.height, tensor.width),
            got: format!("{} values", tensor.data.len()),
        })?;

        let file = tempfile::Builder::new()
            .prefix("orion-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| EmbedError::Failed(format!("failed to create temp image: {}", e)))?;
        img.save_with_format(file.path(), image::ImageFormat::Png)
            .map_err(|e| EmbedError::Failed(format!("failed to write temp image: {}", e)))?;

        let mut model = lock_model(&self.model)?;

        let embeddings = model
            .embed(vec![file.path()], None)
            .map_err(|e| EmbedError::Failed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Failed("No embedding returned".to_string()))
    }
}

/// A poisoned lock means a forward pass panicked; the model is not reused.
fn lock_model<T>(model: &Mutex<T>) -> Result<MutexGuard<'_, T>, EmbedError> {
    model
        .lock()
        .map_err(|e| EmbedError::Unavailable(format!("model lock poisoned: {}", e)))
}

impl Embedder for FastEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, tensor: &ImageTensor) -> Result<EmbedOutput, EmbedError> {
        if tensor.width != self.image_size || tensor.height != self.image_size {
            return Err(EmbedError::ShapeMismatch {
                expected: format!("{0}x{0}x3", self.image_size),
                got: format!("{}x{}x3", tensor.height, tensor.width),
            });
        }

        let embedding = self.run(tensor)?;

        // fastembed image models are pure feature extractors
        Ok(EmbedOutput {
            class_scores: Vec::new(),
            embedding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = FastEmbedder::new("nonexistent-model", temp_dir.path().to_path_buf(), 224);
        assert!(matches!(result, Err(EmbedError::InvalidModel(_))));
    }

    #[test]
    fn test_aliases_share_canonical_name() {
        assert_eq!(canonical_model_name("ResNet-50").unwrap(), "resnet50");
        assert_eq!(canonical_model_name("clipvitb32").unwrap(), "clip-vit-b-32");
        assert_eq!(
            crate::model::model_id_hash(canonical_model_name("RESNET50").unwrap()),
            crate::model::model_id_hash("resnet50")
        );
        assert!(matches!(
            canonical_model_name("vgg16"),
            Err(EmbedError::InvalidModel(_))
        ));
    }

    #[test]
    fn test_parse_model_aliases() {
        assert!(FastEmbedder::parse_model_name("CLIP-ViT-B-32").is_ok());
        assert!(FastEmbedder::parse_model_name("resnet-50").is_ok());
        for name in SUPPORTED_MODELS {
            assert!(FastEmbedder::parse_model_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_poisoned_model_is_fatal() {
        let model = Arc::new(Mutex::new(()));
        let held = model.clone();
        let _ = std::thread::spawn(move || {
            let _guard = held.lock().unwrap();
            panic!("forward pass panicked");
        })
        .join();

        let err = lock_model(&*model).err().unwrap();
        assert!(matches!(err, EmbedError::Unavailable(_)));
        assert!(err.is_fatal());
    }

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_embedding_generation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let embedder = open_embedder("clip-vit-b-32", temp_dir.path().to_path_buf(), 224).unwrap();
        assert_eq!(embedder.dimensions(), 512);

        let tensor = ImageTensor::filled(224, 224, 0.3);
        let first = embedder.embed(&tensor).unwrap();
        let second = embedder.embed(&tensor).unwrap();

        assert_eq!(first.embedding.len(), 512);
        assert!(first.class_scores.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_wrong_tensor_size_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let embedder = open_embedder("clip-vit-b-32", temp_dir.path().to_path_buf(), 224).unwrap();

        let result = embedder.embed(&ImageTensor::filled(32, 32, 0.3));
        assert!(matches!(result, Err(EmbedError::ShapeMismatch { .. })));
    }
}
