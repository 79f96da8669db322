//! Query-time search over the deduplicated catalog.
//!
//! [`SearchContext`] is everything loaded from disk: index, identifiers and
//! descriptions. It is built once at startup, never mutated, and shared via
//! `Arc`, so any number of threads can call [`SearchEngine`] methods at the
//! same time without locking.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use image::RgbImage;
use thiserror::Error;

use super::embedder::{ImageEmbedder, decode_rgb, l2_normalize, open_rgb};
use super::url::{TargetSite, synthesize_url_for};
use super::vector_index::VectorIndex;
use crate::model::types::{DescriptionTable, SearchResult};
use crate::storage::artifacts::{ArtifactPaths, load_descriptions, load_identifiers_with_crc};

/// Startup failures. The engine refuses to start rather than fail per query.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("vector index not found at {0} (run `sight index` and `sight dedup` first)")]
    IndexFileNotFound(PathBuf),

    #[error("identifier list not found at {0}")]
    IdentifierListNotFound(PathBuf),

    #[error("index holds {index} vectors but identifier list holds {identifiers}")]
    MisalignedArtifacts { index: usize, identifiers: usize },

    #[error("index {index} and identifier list {identifiers} were not written together")]
    TornArtifacts { index: PathBuf, identifiers: PathBuf },

    #[error("index was built by '{index}' but the query encoder is '{embedder}'")]
    EmbedderMismatch { index: String, embedder: String },
}

/// Immutable serving state.
#[derive(Debug)]
pub struct SearchContext {
    index: VectorIndex,
    identifiers: Vec<String>,
    descriptions: DescriptionTable,
}

impl SearchContext {
    pub fn new(
        index: VectorIndex,
        identifiers: Vec<String>,
        descriptions: DescriptionTable,
    ) -> Result<Self> {
        if index.len() != identifiers.len() {
            return Err(EngineError::MisalignedArtifacts {
                index: index.len(),
                identifiers: identifiers.len(),
            }
            .into());
        }
        Ok(Self {
            index,
            identifiers,
            descriptions,
        })
    }

    /// Load every artifact up front. A missing description table is logged
    /// and replaced with an empty one.
    pub fn load(paths: &ArtifactPaths) -> Result<Self> {
        if !paths.index.is_file() {
            return Err(EngineError::IndexFileNotFound(paths.index.clone()).into());
        }
        if !paths.identifiers.is_file() {
            return Err(EngineError::IdentifierListNotFound(paths.identifiers.clone()).into());
        }
        let index = VectorIndex::load(&paths.index)
            .with_context(|| format!("load vector index {:?}", paths.index))?;
        let (identifiers, identifiers_crc) = load_identifiers_with_crc(&paths.identifiers)?;
        if index.len() != identifiers.len() {
            return Err(EngineError::MisalignedArtifacts {
                index: index.len(),
                identifiers: identifiers.len(),
            }
            .into());
        }
        if index.identifiers_crc() != identifiers_crc {
            return Err(EngineError::TornArtifacts {
                index: paths.index.clone(),
                identifiers: paths.identifiers.clone(),
            }
            .into());
        }

        let descriptions = match load_descriptions(&paths.descriptions)? {
            Some(table) => {
                tracing::info!(count = table.len(), "loaded descriptions");
                table
            }
            None => {
                tracing::warn!(
                    path = %paths.descriptions.display(),
                    "description table not found; using placeholders"
                );
                DescriptionTable::new()
            }
        };

        let context = Self::new(index, identifiers, descriptions)?;
        tracing::info!(
            vectors = context.len(),
            dimension = context.index.dimension(),
            embedder = context.index.embedder_id(),
            "search context loaded"
        );
        Ok(context)
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn descriptions(&self) -> &DescriptionTable {
        &self.descriptions
    }
}

pub struct SearchEngine {
    context: Arc<SearchContext>,
    embedder: Arc<dyn ImageEmbedder>,
    target_site: TargetSite,
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("vectors", &self.context.len())
            .field("embedder", &self.embedder.id())
            .field("target_site", &self.target_site)
            .finish()
    }
}

impl SearchEngine {
    /// Pair a loaded context with the encoder that must have built it.
    pub fn new(
        context: Arc<SearchContext>,
        embedder: Arc<dyn ImageEmbedder>,
        target_site: TargetSite,
    ) -> Result<Self> {
        let index = context.index();
        if index.embedder_id() != embedder.id() || index.dimension() != embedder.dimension() {
            return Err(EngineError::EmbedderMismatch {
                index: format!("{} ({}d)", index.embedder_id(), index.dimension()),
                embedder: format!("{} ({}d)", embedder.id(), embedder.dimension()),
            }
            .into());
        }
        Ok(Self {
            context,
            embedder,
            target_site,
        })
    }

    pub fn context(&self) -> &Arc<SearchContext> {
        &self.context
    }

    pub fn target_site(&self) -> TargetSite {
        self.target_site
    }

    pub fn search_image(&self, image: &RgbImage, k: usize) -> Result<Vec<SearchResult>> {
        let query = self.embedder.embed_image(image)?;
        self.search_vector(&query, k)
    }

    pub fn search_bytes(&self, bytes: &[u8], k: usize) -> Result<Vec<SearchResult>> {
        let image = decode_rgb(bytes)?;
        self.search_image(&image, k)
    }

    pub fn search_path(&self, path: &Path, k: usize) -> Result<Vec<SearchResult>> {
        let image = open_rgb(path)?;
        self.search_image(&image, k)
    }

    /// Rank catalog entries against an already-encoded query. The query is
    /// normalized here so callers may pass raw encoder output.
    pub fn search_vector(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        let mut query = query.to_vec();
        l2_normalize(&mut query);
        let hits = self.context.index.search(&query, k)?;
        tracing::debug!(k, hits = hits.len(), "vector search");

        Ok(hits
            .into_iter()
            .map(|hit| {
                let identifier = &self.context.identifiers[hit.row];
                let description = self.context.descriptions.describe(identifier);
                SearchResult {
                    identifier: identifier.clone(),
                    score: hit.score,
                    description: description.to_string(),
                    marketplace_url: synthesize_url_for(description, self.target_site),
                }
            })
            .collect())
    }
}
