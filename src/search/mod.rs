//! Search layer facade.
//!
//! - **[`embedder`]**: Image embedder trait plus decode/normalize helpers.
//! - **[`embedder_registry`]**: Named encoder configurations and their storage keys.
//! - **[`histogram_embedder`]**: Color-histogram encoder (deterministic, no model files).
//! - **[`fastembed_embedder`]**: FastEmbed-backed CLIP ViT-B/32 image encoder.
//! - **[`vector_index`]**: SMVI flat inner-product index.
//! - **[`dedup`]**: Greedy near-duplicate removal over an index.
//! - **[`engine`]**: Query-time search over the deduplicated catalog.
//! - **[`url`]**: Marketplace search URL synthesis from descriptions.

pub mod dedup;
pub mod embedder;
pub mod embedder_registry;
#[cfg(feature = "clip")]
pub mod fastembed_embedder;
pub mod engine;
pub mod histogram_embedder;
pub mod url;
pub mod vector_index;
