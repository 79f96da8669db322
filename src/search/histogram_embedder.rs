//! Joint RGB color-histogram embedder.
//!
//! Always available (no model files), fully deterministic, and cheap enough
//! to run over a whole catalog in tests. It only captures color distribution,
//! so it is a fallback for offline use rather than a substitute for CLIP.

use image::RgbImage;

use super::embedder::{EmbedderError, EmbedderInfo, EmbedderResult, ImageEmbedder, l2_normalize};

pub const DEFAULT_BINS_PER_CHANNEL: usize = 4;

#[derive(Debug, Clone)]
pub struct HistogramEmbedder {
    bins: usize,
    info: EmbedderInfo,
}

impl HistogramEmbedder {
    /// `bins` per channel, clamped to 1..=16; dimension is `bins³`.
    pub fn new(bins: usize) -> Self {
        let bins = bins.clamp(1, 16);
        let dimension = bins * bins * bins;
        Self {
            bins,
            info: EmbedderInfo {
                id: format!("rgb-histogram-{dimension}"),
                model_name: "rgb-histogram".to_string(),
                pretrained: format!("{bins}bin"),
                dimension,
            },
        }
    }

    pub fn default_dimension() -> Self {
        Self::new(DEFAULT_BINS_PER_CHANNEL)
    }

    #[inline]
    fn bin(&self, channel: u8) -> usize {
        channel as usize * self.bins / 256
    }
}

impl ImageEmbedder for HistogramEmbedder {
    fn embed_image(&self, image: &RgbImage) -> EmbedderResult<Vec<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(EmbedderError::EmbeddingFailed(
                "image has no pixels".to_string(),
            ));
        }
        let mut histogram = vec![0.0f32; self.info.dimension];
        for pixel in image.pixels() {
            let [r, g, b] = pixel.0;
            let slot = (self.bin(r) * self.bins + self.bin(g)) * self.bins + self.bin(b);
            histogram[slot] += 1.0;
        }
        l2_normalize(&mut histogram);
        Ok(histogram)
    }

    fn dimension(&self) -> usize {
        self.info.dimension
    }

    fn info(&self) -> &EmbedderInfo {
        &self.info
    }
}
