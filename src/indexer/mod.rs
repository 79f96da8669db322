//! Catalog indexing: walk the catalog, encode every image, persist the raw
//! index together with its identifier list.
//!
//! Row `i` of the built index is always the encoding of `identifiers[i]`.
//! Encoding runs in parallel, but results are gathered in traversal order,
//! so the alignment does not depend on scheduling.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::model::types::{CatalogEntry, canonical_identifier};
use crate::search::embedder::{
    EmbedderError, ImageEmbedder, NORM_TOLERANCE, l2_norm, normalize_if_needed,
};
use crate::search::vector_index::VectorIndex;
use crate::storage::artifacts::{ArtifactPaths, Generation, save_index_pair};

/// File extensions accepted as catalog images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// What to do with a catalog file that cannot be decoded or encoded.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BadImagePolicy {
    /// Abort the whole build; nothing is persisted.
    #[default]
    Abort,
    /// Log a warning, leave the image out, keep going.
    Skip,
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub catalog_root: PathBuf,
    pub data_dir: PathBuf,
    pub on_bad_image: BadImagePolicy,
    pub show_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: String,
}

/// In-memory result of encoding a catalog.
#[derive(Debug, Clone)]
pub struct BuiltIndex {
    pub index: VectorIndex,
    pub identifiers: Vec<String>,
    pub skipped: Vec<SkippedImage>,
}

impl BuiltIndex {
    pub fn entries(&self) -> impl Iterator<Item = CatalogEntry> + '_ {
        self.identifiers
            .iter()
            .zip(self.index.reconstruct_all())
            .map(|(identifier, vector)| CatalogEntry {
                identifier: identifier.clone(),
                vector,
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub embedder_id: String,
    pub indexed: usize,
    pub skipped: usize,
    pub dimension: usize,
    pub index_path: PathBuf,
    pub identifiers_path: PathBuf,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

pub fn is_catalog_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
}

/// Every catalog image under `root`, recursively. Directory entries are
/// visited in file-name order so repeated builds produce the same rows.
pub fn discover_catalog(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        bail!("catalog directory {root:?} does not exist or is not a directory");
    }
    let mut images = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("walk catalog {root:?}"))?;
        if entry.file_type().is_file() && is_catalog_image(entry.path()) {
            images.push(entry.into_path());
        }
    }
    Ok(images)
}

/// Encode `paths` in order into a fresh index.
///
/// Under [`BadImagePolicy::Abort`] the first failure stops the parallel
/// encode; images not yet started are never handed to the encoder.
pub fn build_index(
    paths: &[PathBuf],
    embedder: &dyn ImageEmbedder,
    on_bad_image: BadImagePolicy,
    progress: &ProgressBar,
) -> Result<BuiltIndex> {
    let encode = |path: &PathBuf| {
        let result = encode_one(embedder, path);
        progress.inc(1);
        result
    };

    let mut vectors = Vec::with_capacity(paths.len());
    let mut identifiers = Vec::with_capacity(paths.len());
    let mut skipped = Vec::new();
    match on_bad_image {
        BadImagePolicy::Abort => {
            let encoded = paths
                .par_iter()
                .map(|path| {
                    encode(path).with_context(|| {
                        format!("failed to encode catalog image {path:?}; aborting build")
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            vectors.extend(encoded);
            identifiers.extend(
                paths
                    .iter()
                    .map(|path| canonical_identifier(&path.to_string_lossy())),
            );
        }
        BadImagePolicy::Skip => {
            let encoded: Vec<Result<Vec<f32>, EmbedderError>> =
                paths.par_iter().map(encode).collect();
            for (path, result) in paths.iter().zip(encoded) {
                match result {
                    Ok(vector) => {
                        vectors.push(vector);
                        identifiers.push(canonical_identifier(&path.to_string_lossy()));
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping catalog image");
                        skipped.push(SkippedImage {
                            path: path.clone(),
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    if vectors.is_empty() {
        bail!(
            "no catalog image could be encoded ({} skipped)",
            skipped.len()
        );
    }

    let mut index = VectorIndex::new(embedder.id(), embedder.dimension())?;
    index.add(&vectors)?;
    Ok(BuiltIndex {
        index,
        identifiers,
        skipped,
    })
}

fn encode_one(embedder: &dyn ImageEmbedder, path: &Path) -> Result<Vec<f32>, EmbedderError> {
    let mut vector = embedder.embed_file(path)?;
    if normalize_if_needed(&mut vector) {
        tracing::debug!(path = %path.display(), "re-normalized encoder output");
    }
    let norm = l2_norm(&vector);
    if (norm - 1.0).abs() > NORM_TOLERANCE {
        return Err(EmbedderError::EmbeddingFailed(format!(
            "encoder produced a vector that cannot be normalized (norm {norm})"
        )));
    }
    Ok(vector)
}

/// Build the raw index for `opts.catalog_root` and persist it under the
/// encoder's storage key.
pub fn run_index(
    opts: &IndexOptions,
    embedder: &dyn ImageEmbedder,
    storage_key: &str,
) -> Result<BuildReport> {
    let start = Instant::now();
    let paths = discover_catalog(&opts.catalog_root)?;
    if paths.is_empty() {
        bail!("no catalog images (.jpg, .jpeg, .png) found under {:?}", opts.catalog_root);
    }
    tracing::info!(
        catalog = %opts.catalog_root.display(),
        images = paths.len(),
        embedder = embedder.id(),
        "indexing catalog"
    );

    let progress = if opts.show_progress {
        let pb = ProgressBar::new(paths.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner} encoding {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}]")
        {
            pb.set_style(style.progress_chars("██░"));
        }
        pb
    } else {
        ProgressBar::hidden()
    };
    let built = build_index(&paths, embedder, opts.on_bad_image, &progress)?;
    progress.finish_and_clear();

    let artifacts = ArtifactPaths::new(&opts.data_dir, storage_key, Generation::Raw);
    save_index_pair(&artifacts, &built.index, &built.identifiers)?;

    let report = BuildReport {
        embedder_id: embedder.id().to_string(),
        indexed: built.identifiers.len(),
        skipped: built.skipped.len(),
        dimension: built.index.dimension(),
        index_path: artifacts.index,
        identifiers_path: artifacts.identifiers,
        elapsed: start.elapsed(),
    };
    tracing::info!(
        indexed = report.indexed,
        skipped = report.skipped,
        dimension = report.dimension,
        index = %report.index_path.display(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "index built"
    );
    Ok(report)
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::embedder::{EmbedderInfo, EmbedderResult, is_unit_norm};
    use crate::search::histogram_embedder::HistogramEmbedder;
    use crate::storage::artifacts::load_index_pair;
    use image::{ImageBuffer, Rgb, RgbImage};
    use tempfile::tempdir;

    fn write_png(path: &Path, color: [u8; 3]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img: RgbImage = ImageBuffer::from_pixel(6, 6, Rgb(color));
        img.save_with_format(path, image::ImageFormat::Png).unwrap();
    }

    /// Returns an un-normalized constant vector, to exercise re-normalization.
    struct ScaledEmbedder(EmbedderInfo);

    impl ImageEmbedder for ScaledEmbedder {
        fn embed_image(&self, _image: &RgbImage) -> EmbedderResult<Vec<f32>> {
            Ok(vec![3.0, 4.0])
        }
        fn dimension(&self) -> usize {
            2
        }
        fn info(&self) -> &EmbedderInfo {
            &self.0
        }
    }

    #[test]
    fn extension_filter_is_case_insensitive() {
        assert!(is_catalog_image(Path::new("a/b.JPG")));
        assert!(is_catalog_image(Path::new("a/b.jpeg")));
        assert!(is_catalog_image(Path::new("b.Png")));
        assert!(!is_catalog_image(Path::new("b.gif")));
        assert!(!is_catalog_image(Path::new("README")));
    }

    #[test]
    fn discovery_is_recursive_and_sorted() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        write_png(&root.join("shoes/b.png"), [1, 2, 3]);
        write_png(&root.join("shoes/a.PNG"), [1, 2, 3]);
        write_png(&root.join("bags/z.png"), [1, 2, 3]);
        std::fs::write(root.join("notes.txt"), "ignore me")?;

        let found: Vec<PathBuf> = discover_catalog(root)?
            .into_iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            found,
            vec![
                PathBuf::from("bags/z.png"),
                PathBuf::from("shoes/a.PNG"),
                PathBuf::from("shoes/b.png"),
            ]
        );
        Ok(())
    }

    #[test]
    fn build_keeps_rows_aligned_with_identifiers() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        let colors = [[255, 0, 0], [0, 255, 0], [0, 0, 255], [250, 250, 250]];
        for (i, c) in colors.iter().enumerate() {
            write_png(&root.join(format!("item{i}.png")), *c);
        }
        let embedder = HistogramEmbedder::default_dimension();
        let paths = discover_catalog(root)?;
        let built = build_index(&paths, &embedder, BadImagePolicy::Abort, &ProgressBar::hidden())?;

        assert_eq!(built.index.len(), built.identifiers.len());
        for (row, entry) in built.entries().enumerate() {
            assert!(is_unit_norm(&entry.vector));
            let expected = embedder.embed_file(Path::new(&entry.identifier))?;
            assert_eq!(entry.vector, expected, "row {row} misaligned");
        }
        Ok(())
    }

    #[test]
    fn corrupt_image_aborts_by_default() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        write_png(&root.join("good.png"), [9, 9, 9]);
        std::fs::write(root.join("bad.jpg"), b"not a jpeg")?;

        let data = tempdir()?;
        let opts = IndexOptions {
            catalog_root: root.to_path_buf(),
            data_dir: data.path().to_path_buf(),
            on_bad_image: BadImagePolicy::Abort,
            show_progress: false,
        };
        let embedder = HistogramEmbedder::default_dimension();
        let err = run_index(&opts, &embedder, "k").unwrap_err();
        assert!(format!("{err:#}").contains("bad.jpg"), "{err:#}");
        assert!(
            err.chain()
                .any(|e| matches!(e.downcast_ref::<EmbedderError>(), Some(EmbedderError::UnsupportedImageFormat { .. })))
        );
        let artifacts = ArtifactPaths::new(data.path(), "k", Generation::Raw);
        assert!(!artifacts.index.exists());
        assert!(!artifacts.identifiers.exists());
        Ok(())
    }

    /// Histogram encoder that counts and slows down every successful encode.
    struct CountingEmbedder {
        inner: HistogramEmbedder,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ImageEmbedder for CountingEmbedder {
        fn embed_image(&self, image: &RgbImage) -> EmbedderResult<Vec<f32>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            self.inner.embed_image(image)
        }
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
        fn info(&self) -> &EmbedderInfo {
            self.inner.info()
        }
    }

    #[test]
    fn abort_policy_stops_encoding_after_first_failure() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        std::fs::write(root.join("000_bad.jpg"), b"not a jpeg")?;
        let good = 300;
        for i in 0..good {
            write_png(&root.join(format!("item{i:04}.png")), [i as u8, 7, 7]);
        }
        let paths = discover_catalog(root)?;
        assert!(paths[0].ends_with("000_bad.jpg"));

        let embedder = CountingEmbedder {
            inner: HistogramEmbedder::default_dimension(),
            calls: Default::default(),
        };
        let err = build_index(&paths, &embedder, BadImagePolicy::Abort, &ProgressBar::hidden())
            .unwrap_err();
        assert!(format!("{err:#}").contains("000_bad.jpg"), "{err:#}");

        let calls = embedder.calls.load(std::sync::atomic::Ordering::SeqCst);
        assert!(calls < good, "encoded {calls} of {good} images after the failure");
        Ok(())
    }

    #[test]
    fn skip_policy_indexes_the_rest() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        write_png(&root.join("a.png"), [9, 9, 9]);
        std::fs::write(root.join("b.jpg"), b"not a jpeg")?;
        write_png(&root.join("c.png"), [200, 9, 9]);

        let data = tempdir()?;
        let opts = IndexOptions {
            catalog_root: root.to_path_buf(),
            data_dir: data.path().to_path_buf(),
            on_bad_image: BadImagePolicy::Skip,
            show_progress: false,
        };
        let report = run_index(&opts, &HistogramEmbedder::default_dimension(), "k")?;
        assert_eq!(report.indexed, 2);
        assert_eq!(report.skipped, 1);

        let (index, identifiers) =
            load_index_pair(&ArtifactPaths::new(data.path(), "k", Generation::Raw))?;
        assert_eq!(index.len(), 2);
        assert!(identifiers[0].ends_with("a.png"));
        assert!(identifiers[1].ends_with("c.png"));
        Ok(())
    }

    #[test]
    fn encoder_output_is_renormalized() -> Result<()> {
        let dir = tempdir()?;
        write_png(&dir.path().join("x.png"), [0, 0, 0]);
        let embedder = ScaledEmbedder(EmbedderInfo {
            id: "scaled".into(),
            model_name: "scaled".into(),
            pretrained: "none".into(),
            dimension: 2,
        });
        let paths = discover_catalog(dir.path())?;
        let built = build_index(&paths, &embedder, BadImagePolicy::Abort, &ProgressBar::hidden())?;
        let v = built.index.reconstruct(0)?;
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn empty_catalog_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let data = tempdir()?;
        let opts = IndexOptions {
            catalog_root: dir.path().to_path_buf(),
            data_dir: data.path().to_path_buf(),
            on_bad_image: BadImagePolicy::Abort,
            show_progress: false,
        };
        let err = run_index(&opts, &HistogramEmbedder::default_dimension(), "k").unwrap_err();
        assert!(err.to_string().contains("no catalog images"), "{err}");
        Ok(())
    }
}
