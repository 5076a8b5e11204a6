//! Image decoding and normalization.
//!
//! Every image is decoded with the `image` crate, resized to a square of
//! `size` pixels, converted to RGB and scaled to `[0, 1]`.

use std::path::Path;

use image::imageops::FilterType;
use image::RgbImage;

use super::{ImageTensor, PreprocessError, Preprocessor, CHANNELS};

/// Default input edge length of the feature extractor
pub const DEFAULT_IMAGE_SIZE: u32 = 224;

/// Preprocessor backed by the `image` crate.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    size: u32,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_SIZE)
    }
}

impl ImagePreprocessor {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Normalize an already decoded image.
    pub fn tensor_from_image(&self, img: &image::DynamicImage) -> ImageTensor {
        let rgb = img
            .resize_exact(self.size, self.size, FilterType::Nearest)
            .to_rgb8();

        let data = rgb
            .as_raw()
            .iter()
            .map(|&channel| channel as f32 / 255.0)
            .collect();

        ImageTensor {
            width: self.size,
            height: self.size,
            data,
        }
    }
}

impl Preprocessor for ImagePreprocessor {
    fn process(&self, path: &Path) -> Result<ImageTensor, PreprocessError> {
        if !path.is_file() {
            return Err(PreprocessError::NotFound(path.to_path_buf()));
        }

        let img = image::ImageReader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|e| PreprocessError::Decode {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
            .decode()
            .map_err(|e| PreprocessError::Decode {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        Ok(self.tensor_from_image(&img))
    }
}

/// Convert a normalized tensor back into an 8-bit RGB image.
pub fn tensor_to_image(tensor: &ImageTensor) -> Option<RgbImage> {
    if tensor.data.len() != tensor.width as usize * tensor.height as usize * CHANNELS {
        return None;
    }

    let raw = tensor
        .data
        .iter()
        .map(|value| (value.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();

    RgbImage::from_raw(tensor.width, tensor.height, raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(path: &Path, width: u32, height: u32, color: [u8; 3]) {
        let img = RgbImage::from_pixel(width, height, image::Rgb(color));
        img.save(path).unwrap();
    }

    #[test]
    fn test_process_resizes_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        write_png(&path, 40, 20, [255, 0, 51]);

        let preprocessor = ImagePreprocessor::new(8);
        let tensor = preprocessor.process(&path).unwrap();

        assert_eq!(tensor.shape(), [8, 8, 3]);
        let [r, g, b] = tensor.pixel(3, 5);
        assert!((r - 1.0).abs() < 1e-6);
        assert!(g.abs() < 1e-6);
        assert!((b - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let preprocessor = ImagePreprocessor::default();
        let result = preprocessor.process(Path::new("/nonexistent/dir/img.jpg"));
        assert!(matches!(result, Err(PreprocessError::NotFound(_))));
    }

    #[test]
    fn test_garbage_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let result = ImagePreprocessor::default().process(&path);
        assert!(matches!(result, Err(PreprocessError::Decode { .. })));
    }

    #[test]
    fn test_tensor_to_image_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("teal.png");
        write_png(&path, 4, 4, [0, 128, 128]);

        let tensor = ImagePreprocessor::new(4).process(&path).unwrap();
        let img = tensor_to_image(&tensor).unwrap();
        assert_eq!(img.get_pixel(2, 2).0, [0, 128, 128]);
    }

    #[test]
    fn test_tensor_to_image_rejects_bad_shape() {
        let tensor = ImageTensor {
            width: 2,
            height: 2,
            data: vec![0.0; 5],
        };
        assert!(tensor_to_image(&tensor).is_none());
    }
}
