//! CLIP ViT-B/32 vision encoder backed by FastEmbed (ONNX Runtime).
//!
//! FastEmbed reads images from paths, so catalog files are handed over as-is
//! (after a decode check) and decoded query images are staged as a temporary
//! PNG. The ONNX session is not shareable across threads for `embed`, so it
//! sits behind a mutex; searches serialize only on the encoder call itself.

use std::path::{Path, PathBuf};

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions};
use image::RgbImage;
use parking_lot::Mutex;

use super::embedder::{
    EmbedderError, EmbedderInfo, EmbedderResult, ImageEmbedder, l2_normalize, open_rgb,
};

pub const CLIP_EMBEDDER_ID: &str = "clip-vit-b-32";
pub const CLIP_MODEL_NAME: &str = "ViT-B-32";
pub const CLIP_PRETRAINED: &str = "openai";
pub const CLIP_DIMENSION: usize = 512;

pub struct ClipEmbedder {
    model: Mutex<ImageEmbedding>,
    info: EmbedderInfo,
}

impl std::fmt::Debug for ClipEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipEmbedder")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl ClipEmbedder {
    /// Load (downloading on first use) the CLIP vision model into `cache_dir`.
    pub fn load(cache_dir: &Path, show_progress: bool) -> EmbedderResult<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            EmbedderError::ModelUnavailable(CLIP_EMBEDDER_ID.to_string(), e.to_string())
        })?;
        let options = ImageInitOptions::new(ImageEmbeddingModel::ClipVitB32)
            .with_cache_dir(cache_dir.to_path_buf())
            .with_show_download_progress(show_progress);
        let model = ImageEmbedding::try_new(options).map_err(|e| {
            EmbedderError::ModelUnavailable(CLIP_EMBEDDER_ID.to_string(), e.to_string())
        })?;
        tracing::info!(cache_dir = %cache_dir.display(), "loaded CLIP vision model");
        Ok(Self {
            model: Mutex::new(model),
            info: EmbedderInfo {
                id: CLIP_EMBEDDER_ID.to_string(),
                model_name: CLIP_MODEL_NAME.to_string(),
                pretrained: CLIP_PRETRAINED.to_string(),
                dimension: CLIP_DIMENSION,
            },
        })
    }

    fn embed_paths(&self, paths: Vec<PathBuf>) -> EmbedderResult<Vec<f32>> {
        let mut model = self.model.lock();
        let mut embeddings = model
            .embed(paths, None)
            .map_err(|e| EmbedderError::EmbeddingFailed(e.to_string()))?;
        drop(model);

        let mut embedding = embeddings
            .pop()
            .ok_or_else(|| EmbedderError::EmbeddingFailed("no embedding returned".to_string()))?;
        if embedding.len() != CLIP_DIMENSION {
            return Err(EmbedderError::EmbeddingFailed(format!(
                "expected {CLIP_DIMENSION} dimensions, got {}",
                embedding.len()
            )));
        }
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

impl ImageEmbedder for ClipEmbedder {
    fn embed_image(&self, image: &RgbImage) -> EmbedderResult<Vec<f32>> {
        let staged = tempfile::Builder::new()
            .prefix("sight-query-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| EmbedderError::EmbeddingFailed(format!("stage query image: {e}")))?;
        image
            .save_with_format(staged.path(), image::ImageFormat::Png)
            .map_err(|e| EmbedderError::EmbeddingFailed(format!("stage query image: {e}")))?;
        self.embed_paths(vec![staged.path().to_path_buf()])
    }

    fn embed_file(&self, path: &Path) -> EmbedderResult<Vec<f32>> {
        // Surface corrupt files as a decode error rather than an ONNX failure.
        open_rgb(path)?;
        self.embed_paths(vec![path.to_path_buf()])
    }

    fn dimension(&self) -> usize {
        CLIP_DIMENSION
    }

    fn info(&self) -> &EmbedderInfo {
        &self.info
    }
}
