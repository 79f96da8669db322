//! Image embedder abstraction.
//!
//! The encoder is an opaque oracle: an RGB image goes in, a fixed-length
//! L2-normalized vector comes out, deterministically for a fixed model.
//! Index building and query serving only depend on this trait, so encoders
//! can be swapped through [`super::embedder_registry`] without touching them.

use std::path::Path;

use image::RgbImage;
use thiserror::Error;

/// Tolerance for "unit length" checks on stored and query vectors.
pub const NORM_TOLERANCE: f32 = 1e-4;

#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("unsupported or corrupt image {source_name}: {reason}")]
    UnsupportedImageFormat { source_name: String, reason: String },

    #[error("embedder '{0}' is not available: {1}")]
    ModelUnavailable(String, String),

    #[error("unknown embedder '{0}'")]
    UnknownEmbedder(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
}

pub type EmbedderResult<T> = Result<T, EmbedderError>;

/// Static description of an encoder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedderInfo {
    /// Unique id written into index headers (e.g. "clip-vit-b-32").
    pub id: String,
    /// Model architecture name (e.g. "ViT-B-32").
    pub model_name: String,
    /// Pretrained-weights tag (e.g. "openai").
    pub pretrained: String,
    pub dimension: usize,
}

pub trait ImageEmbedder: Send + Sync {
    /// Encode a decoded RGB image into a unit vector of length [`Self::dimension`].
    fn embed_image(&self, image: &RgbImage) -> EmbedderResult<Vec<f32>>;

    /// Decode and encode an image file. Encoders that can read files directly
    /// may override this; the default decodes with [`open_rgb`].
    fn embed_file(&self, path: &Path) -> EmbedderResult<Vec<f32>> {
        let image = open_rgb(path)?;
        self.embed_image(&image)
    }

    fn dimension(&self) -> usize;

    fn info(&self) -> &EmbedderInfo;

    fn id(&self) -> &str {
        &self.info().id
    }
}

/// Decode an image file to 8-bit RGB.
pub fn open_rgb(path: &Path) -> EmbedderResult<RgbImage> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| EmbedderError::UnsupportedImageFormat {
            source_name: path.display().to_string(),
            reason: e.to_string(),
        })
}

/// Decode in-memory image bytes (any supported container) to 8-bit RGB.
pub fn decode_rgb(bytes: &[u8]) -> EmbedderResult<RgbImage> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| EmbedderError::UnsupportedImageFormat {
            source_name: "<bytes>".to_string(),
            reason: e.to_string(),
        })
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

pub fn is_unit_norm(v: &[f32]) -> bool {
    (l2_norm(v) - 1.0).abs() <= NORM_TOLERANCE
}

/// Scale `v` to unit length in place. Zero vectors are left untouched and
/// reported as `false`.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if norm <= f32::EPSILON || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// Re-normalize only when `v` drifted outside [`NORM_TOLERANCE`], so vectors
/// that are already unit length keep their exact bits.
pub fn normalize_if_needed(v: &mut [f32]) -> bool {
    if is_unit_norm(v) {
        return false;
    }
    l2_normalize(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn normalize_produces_unit_vector() {
        let mut v = vec![3.0, 4.0];
        assert!(l2_normalize(&mut v));
        assert!(is_unit_norm(&v));
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_is_left_alone() {
        let mut v = vec![0.0; 4];
        assert!(!l2_normalize(&mut v));
        assert_eq!(v, vec![0.0; 4]);
    }

    #[test]
    fn normalize_if_needed_keeps_unit_bits() {
        let mut v = vec![0.6f32, 0.8];
        let before: Vec<u32> = v.iter().map(|x| x.to_bits()).collect();
        assert!(!normalize_if_needed(&mut v));
        let after: Vec<u32> = v.iter().map(|x| x.to_bits()).collect();
        assert_eq!(before, after);

        let mut drifted = vec![0.0, 2.0];
        assert!(normalize_if_needed(&mut drifted));
        assert_eq!(drifted, vec![0.0, 1.0]);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_rgb(b"definitely not an image").unwrap_err();
        assert!(matches!(err, EmbedderError::UnsupportedImageFormat { .. }));
    }

    #[test]
    fn decode_png_bytes() -> anyhow::Result<()> {
        let img: RgbImage = ImageBuffer::from_pixel(4, 3, Rgb([10, 20, 30]));
        let mut bytes = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )?;
        let decoded = decode_rgb(&bytes)?;
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(0, 0), &Rgb([10, 20, 30]));
        Ok(())
    }
}
