//! On-disk pipeline artifacts, namespaced per encoder.
//!
//! Layout under the data dir, where `<key>` is `{model_name}-{pretrained}`:
//!
//! ```text
//! vector_index/index-<key>.smvi             raw index (IndexBuilder)
//! vector_index/index-<key>-dedup.smvi       canonical index (Deduplicator)
//! identifiers/identifiers-<key>.json        raw identifier list
//! identifiers/identifiers-<key>-dedup.json  canonical identifier list
//! descriptions/descriptions-<key>.json      identifier → description (optional)
//! ```
//!
//! An index and its identifier list are only ever written as a pair: both
//! temp files are written and fsynced first, then both are renamed into
//! place. The index header carries the CRC32 of the identifier file bytes,
//! so loaders reject a pair whose lengths or checksum disagree, including a
//! same-length stale list left behind by a crash between the two renames.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::model::types::{DescriptionTable, canonical_identifier};
use crate::search::vector_index::{VECTOR_INDEX_EXTENSION, VectorIndex, commit_temp};

pub const VECTOR_INDEX_DIR: &str = "vector_index";
pub const IDENTIFIERS_DIR: &str = "identifiers";
pub const DESCRIPTIONS_DIR: &str = "descriptions";
const DEDUP_SUFFIX: &str = "-dedup";

/// Which generation of the index a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Straight out of the builder.
    Raw,
    /// After near-duplicate removal; what the search engine serves.
    Dedup,
}

impl Generation {
    fn suffix(self) -> &'static str {
        match self {
            Self::Raw => "",
            Self::Dedup => DEDUP_SUFFIX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub index: PathBuf,
    pub identifiers: PathBuf,
    pub descriptions: PathBuf,
}

impl ArtifactPaths {
    pub fn new(data_dir: &Path, storage_key: &str, generation: Generation) -> Self {
        let suffix = generation.suffix();
        Self {
            index: data_dir
                .join(VECTOR_INDEX_DIR)
                .join(format!("index-{storage_key}{suffix}.{VECTOR_INDEX_EXTENSION}")),
            identifiers: data_dir
                .join(IDENTIFIERS_DIR)
                .join(format!("identifiers-{storage_key}{suffix}.json")),
            descriptions: data_dir
                .join(DESCRIPTIONS_DIR)
                .join(format!("descriptions-{storage_key}.json")),
        }
    }
}

/// Persist an index and its identifier list together.
pub fn save_index_pair(paths: &ArtifactPaths, index: &VectorIndex, identifiers: &[String]) -> Result<()> {
    if index.len() != identifiers.len() {
        bail!(
            "refusing to save misaligned artifacts: {} vectors, {} identifiers",
            index.len(),
            identifiers.len()
        );
    }
    for path in [&paths.index, &paths.identifiers] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create artifact dir {parent:?}"))?;
        }
    }

    let id_bytes = serde_json::to_vec(identifiers).context("serialize identifier list")?;
    let identifiers_crc = crc32fast::hash(&id_bytes);

    let index_temp = index.save_temp(&paths.index, identifiers_crc)?;
    let ids_temp = match write_identifiers_temp(&paths.identifiers, &id_bytes) {
        Ok(p) => p,
        Err(e) => {
            let _ = std::fs::remove_file(&index_temp);
            return Err(e);
        }
    };

    if let Err(e) = commit_temp(&index_temp, &paths.index) {
        let _ = std::fs::remove_file(&index_temp);
        let _ = std::fs::remove_file(&ids_temp);
        return Err(e);
    }
    commit_temp(&ids_temp, &paths.identifiers)?;
    tracing::debug!(
        index = %paths.index.display(),
        identifiers = %paths.identifiers.display(),
        count = identifiers.len(),
        "saved index pair"
    );
    Ok(())
}

fn write_identifiers_temp(path: &Path, id_bytes: &[u8]) -> Result<PathBuf> {
    let temp_path = path.with_extension("json.tmp");
    let file = File::create(&temp_path)
        .with_context(|| format!("create temp identifier list {temp_path:?}"))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(id_bytes).context("write identifier list")?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()
        .context("fsync identifier list")?;
    Ok(temp_path)
}

/// Load an identifier list along with the CRC32 of its raw file bytes.
pub fn load_identifiers_with_crc(path: &Path) -> Result<(Vec<String>, u32)> {
    let bytes = std::fs::read(path).with_context(|| format!("open identifier list {path:?}"))?;
    let crc = crc32fast::hash(&bytes);
    let identifiers: Vec<String> = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse identifier list {path:?}"))?;
    Ok((
        identifiers.iter().map(|id| canonical_identifier(id)).collect(),
        crc,
    ))
}

/// Load an index and its identifier list, checking they line up and were
/// committed together.
pub fn load_index_pair(paths: &ArtifactPaths) -> Result<(VectorIndex, Vec<String>)> {
    let index = VectorIndex::load(&paths.index)?;
    let (identifiers, identifiers_crc) = load_identifiers_with_crc(&paths.identifiers)?;
    if index.len() != identifiers.len() {
        bail!(
            "index {:?} has {} vectors but identifier list {:?} has {} entries",
            paths.index,
            index.len(),
            paths.identifiers,
            identifiers.len()
        );
    }
    if index.identifiers_crc() != identifiers_crc {
        bail!(
            "index {:?} and identifier list {:?} were not written together",
            paths.index,
            paths.identifiers
        );
    }
    Ok((index, identifiers))
}

/// Read the description table. `Ok(None)` when the file does not exist.
pub fn load_descriptions(path: &Path) -> Result<Option<DescriptionTable>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("open description table {path:?}")),
    };
    let table: DescriptionTable = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parse description table {path:?}"))?;
    Ok(Some(table.canonicalized()))
}

pub fn save_descriptions(path: &Path, table: &DescriptionTable) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("json.tmp");
    let file = File::create(&temp_path)
        .with_context(|| format!("create temp description table {temp_path:?}"))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, table)?;
    writer.flush()?;
    drop(writer);
    commit_temp(&temp_path, path)
}
