//! Embedder registry for encoder selection.
//!
//! Each registered encoder carries a model name and a pretrained-weights tag.
//! Together they form the storage key for every artifact built with it, so
//! indexes from different encoders live side by side without collisions.
//!
//! # Supported Embedders
//!
//! | Name | ID | Dimension | Notes |
//! |------|-----|-----------|-------|
//! | clip | clip-vit-b-32 | 512 | Default; CLIP ViT-B/32 (OpenAI weights) via FastEmbed |
//! | histogram | rgb-histogram-64 | 64 | Color histogram, always available |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::embedder::{EmbedderError, EmbedderResult, ImageEmbedder};
use super::histogram_embedder::HistogramEmbedder;

/// Histogram embedder name (always available).
pub const HISTOGRAM_EMBEDDER: &str = "histogram";

/// CLIP embedder name.
pub const CLIP_EMBEDDER: &str = "clip";

/// Default embedder when none is configured.
#[cfg(feature = "clip")]
pub const DEFAULT_EMBEDDER: &str = CLIP_EMBEDDER;
#[cfg(not(feature = "clip"))]
pub const DEFAULT_EMBEDDER: &str = HISTOGRAM_EMBEDDER;

#[derive(Debug, Clone)]
pub struct RegisteredEmbedder {
    /// Short name for CLI/config.
    pub name: &'static str,
    /// Id written into index headers.
    pub id: &'static str,
    pub model_name: &'static str,
    pub pretrained: &'static str,
    pub dimension: usize,
    pub description: &'static str,
    /// Whether model weights must be fetched before first use.
    pub requires_model_files: bool,
}

impl RegisteredEmbedder {
    /// Storage key shared by every artifact built with this encoder.
    pub fn storage_key(&self) -> String {
        storage_key(self.model_name, self.pretrained)
    }

    /// Directory FastEmbed downloads weights into.
    pub fn model_dir(&self, data_dir: &Path) -> Option<PathBuf> {
        self.requires_model_files
            .then(|| data_dir.join("models").join(self.storage_key()))
    }

    /// Whether the encoder can be constructed in this build. Model weights
    /// may still need a first-run download.
    pub fn is_compiled_in(&self) -> bool {
        self.name != CLIP_EMBEDDER || cfg!(feature = "clip")
    }

    /// Whether weights are already present locally.
    pub fn is_cached(&self, data_dir: &Path) -> bool {
        match self.model_dir(data_dir) {
            None => true,
            Some(dir) => std::fs::read_dir(dir)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false),
        }
    }
}

pub static EMBEDDERS: &[RegisteredEmbedder] = &[
    RegisteredEmbedder {
        name: CLIP_EMBEDDER,
        id: "clip-vit-b-32",
        model_name: "ViT-B-32",
        pretrained: "openai",
        dimension: 512,
        description: "CLIP ViT-B/32 vision tower - semantic product similarity",
        requires_model_files: true,
    },
    RegisteredEmbedder {
        name: HISTOGRAM_EMBEDDER,
        id: "rgb-histogram-64",
        model_name: "rgb-histogram",
        pretrained: "4bin",
        dimension: 64,
        description: "Joint RGB color histogram - offline fallback, no model files",
        requires_model_files: false,
    },
];

/// Sanitize `{model_name}-{pretrained}` to `[A-Za-z0-9._-]`.
pub fn storage_key(model_name: &str, pretrained: &str) -> String {
    format!("{model_name}-{pretrained}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn lookup(name: &str) -> Option<&'static RegisteredEmbedder> {
    let needle = name.trim().to_lowercase();
    EMBEDDERS
        .iter()
        .find(|e| e.name == needle || e.id == needle)
}

pub fn resolve(name: Option<&str>) -> EmbedderResult<&'static RegisteredEmbedder> {
    let name = name.unwrap_or(DEFAULT_EMBEDDER);
    lookup(name).ok_or_else(|| EmbedderError::UnknownEmbedder(name.to_string()))
}

/// Construct the named encoder. `None` selects [`DEFAULT_EMBEDDER`].
pub fn get_embedder(
    data_dir: &Path,
    name: Option<&str>,
    show_progress: bool,
) -> EmbedderResult<Arc<dyn ImageEmbedder>> {
    let registered = resolve(name)?;
    match registered.name {
        HISTOGRAM_EMBEDDER => Ok(Arc::new(HistogramEmbedder::default_dimension())),
        CLIP_EMBEDDER => load_clip(registered, data_dir, show_progress),
        other => Err(EmbedderError::UnknownEmbedder(other.to_string())),
    }
}

#[cfg(feature = "clip")]
fn load_clip(
    registered: &RegisteredEmbedder,
    data_dir: &Path,
    show_progress: bool,
) -> EmbedderResult<Arc<dyn ImageEmbedder>> {
    let cache_dir = registered
        .model_dir(data_dir)
        .unwrap_or_else(|| data_dir.join("models"));
    let embedder = super::fastembed_embedder::ClipEmbedder::load(&cache_dir, show_progress)?;
    Ok(Arc::new(embedder))
}

#[cfg(not(feature = "clip"))]
fn load_clip(
    registered: &RegisteredEmbedder,
    _data_dir: &Path,
    _show_progress: bool,
) -> EmbedderResult<Arc<dyn ImageEmbedder>> {
    Err(EmbedderError::ModelUnavailable(
        registered.name.to_string(),
        "built without the `clip` feature".to_string(),
    ))
}
