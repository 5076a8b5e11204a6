//! Shared fixtures: a deterministic embedder and tiny on-disk datasets.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::model::{EmbedError, EmbedOutput, Embedder, ImagePreprocessor, ImageTensor};

/// Edge length of every fixture image and tensor
pub const FIXTURE_SIZE: u32 = 8;

pub const RED: [u8; 3] = [255, 0, 0];
pub const DARK_RED: [u8; 3] = [128, 0, 0];
pub const GREEN: [u8; 3] = [0, 255, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];
pub const BLACK: [u8; 3] = [0, 0, 0];

/// Embeds an image as its per-channel mean colour.
///
/// Dimension `i` is the mean of channel `i % 3`, so identical colours always
/// produce identical vectors. Class scores are the channel means normalized
/// to sum to one.
pub struct MockEmbedder {
    name: String,
    dimensions: usize,
    /// Length actually returned, to simulate a misbehaving model
    output_len: usize,
    unavailable: bool,
    calls: AtomicUsize,
    /// Set on every call, like a Ctrl-C arriving mid-build
    interrupt: Option<Arc<AtomicBool>>,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            name: "mock-mean-colour".to_string(),
            dimensions,
            output_len: dimensions,
            unavailable: false,
            calls: AtomicUsize::new(0),
            interrupt: None,
        }
    }

    pub fn rgb() -> Self {
        Self::new(3)
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::rgb()
        }
    }

    pub fn with_output_len(mut self, output_len: usize) -> Self {
        self.output_len = output_len;
        self
    }

    pub fn interrupting(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embedder for MockEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, tensor: &ImageTensor) -> Result<EmbedOutput, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(flag) = &self.interrupt {
            flag.store(true, Ordering::SeqCst);
        }

        if self.unavailable {
            return Err(EmbedError::Unavailable("weights not loaded".to_string()));
        }

        if tensor.width != FIXTURE_SIZE || tensor.height != FIXTURE_SIZE {
            return Err(EmbedError::ShapeMismatch {
                expected: format!("{0}x{0}x3", FIXTURE_SIZE),
                got: format!("{}x{}x3", tensor.height, tensor.width),
            });
        }

        let pixels = (tensor.width * tensor.height) as f32;
        let mut means = [0.0f32; 3];
        for chunk in tensor.data.chunks_exact(3) {
            for (mean, value) in means.iter_mut().zip(chunk) {
                *mean += value;
            }
        }
        means.iter_mut().for_each(|m| *m /= pixels);

        let total: f32 = means.iter().sum();
        let class_scores = if total > 0.0 {
            means.iter().map(|m| m / total).collect()
        } else {
            vec![1.0 / 3.0; 3]
        };

        Ok(EmbedOutput {
            class_scores,
            embedding: (0..self.output_len).map(|i| means[i % 3]).collect(),
        })
    }
}

pub fn preprocessor() -> Arc<ImagePreprocessor> {
    Arc::new(ImagePreprocessor::new(FIXTURE_SIZE))
}

/// Write a solid-colour PNG.
pub fn write_image(path: &Path, color: [u8; 3]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    image::RgbImage::from_pixel(FIXTURE_SIZE * 2, FIXTURE_SIZE * 2, image::Rgb(color))
        .save_with_format(path, image::ImageFormat::Png)
        .unwrap();
}

/// dataset/
///   cat/  a.jpg (red)  b.jpg (dark red)
///   dog/  c.jpg (green)
///   README.txt
pub fn pets_dataset(root: &Path) {
    write_image(&root.join("cat").join("a.jpg"), RED);
    write_image(&root.join("cat").join("b.jpg"), DARK_RED);
    write_image(&root.join("dog").join("c.jpg"), GREEN);
    std::fs::write(root.join("README.txt"), b"pets").unwrap();
}

/// Bytes of every persisted category file, in name order.
pub fn snapshot(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map(|e| e == "emb").unwrap_or(false))
        .map(|p| {
            (
                p.file_name().unwrap().to_string_lossy().into_owned(),
                std::fs::read(&p).unwrap(),
            )
        })
        .collect();
    files.sort();
    files
}
