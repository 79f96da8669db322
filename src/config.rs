//! Layered configuration.
//!
//! Precedence, lowest first: built-in defaults, `config.toml`, `SIGHT_*`
//! environment variables (a `.env` file is honored), then command-line flags
//! applied by the caller before [`SightConfig::validate`].
//!
//! ```toml
//! data_dir = "/srv/sight"
//! catalog_dir = "dataset"
//! model = "clip"
//! dedup_threshold = 0.95
//! top_k = 9
//! target_site = "amazon"
//! on_bad_image = "abort"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::indexer::BadImagePolicy;
use crate::search::dedup::{DEFAULT_DEDUP_THRESHOLD, validate_threshold};
use crate::search::embedder_registry::DEFAULT_EMBEDDER;
use crate::search::url::TargetSite;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_CATALOG_DIR: &str = "dataset";
pub const DEFAULT_TOP_K: usize = 9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SightConfig {
    /// Root for index, identifier, description and model files.
    pub data_dir: PathBuf,
    /// Directory walked by `sight index`.
    pub catalog_dir: PathBuf,
    /// Registered encoder name (see `sight models`).
    pub model: String,
    pub dedup_threshold: f32,
    pub top_k: usize,
    pub target_site: TargetSite,
    pub on_bad_image: BadImagePolicy,
}

impl Default for SightConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            catalog_dir: PathBuf::from(DEFAULT_CATALOG_DIR),
            model: DEFAULT_EMBEDDER.to_string(),
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            top_k: DEFAULT_TOP_K,
            target_site: TargetSite::default(),
            on_bad_image: BadImagePolicy::default(),
        }
    }
}

impl SightConfig {
    /// Defaults, then the TOML file, then the environment.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config =
            Self::from_toml_str(&text).with_context(|| format!("parse {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `SIGHT_*` variables. Malformed values are errors, not ignored.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_var("SIGHT_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("SIGHT_CATALOG_DIR") {
            self.catalog_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("SIGHT_MODEL") {
            self.model = v;
        }
        if let Some(v) = env_var("SIGHT_DEDUP_THRESHOLD") {
            self.dedup_threshold = v
                .parse()
                .with_context(|| format!("SIGHT_DEDUP_THRESHOLD={v:?} is not a number"))?;
        }
        if let Some(v) = env_var("SIGHT_TOP_K") {
            self.top_k = v
                .parse()
                .with_context(|| format!("SIGHT_TOP_K={v:?} is not a count"))?;
        }
        if let Some(v) = env_var("SIGHT_TARGET_SITE") {
            self.target_site = v.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(v) = env_var("SIGHT_ON_BAD_IMAGE") {
            self.on_bad_image = match v.trim().to_lowercase().as_str() {
                "abort" => BadImagePolicy::Abort,
                "skip" => BadImagePolicy::Skip,
                other => bail!("SIGHT_ON_BAD_IMAGE must be abort or skip, got {other:?}"),
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.dedup_threshold)?;
        if self.top_k == 0 {
            bail!("top_k must be at least 1");
        }
        if self.model.trim().is_empty() {
            bail!("model name must not be empty");
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    dotenvy::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "sight-match", "sight-match")
}

/// Platform data dir, or `./.sight` when no home directory is known.
pub fn default_data_dir() -> PathBuf {
    project_dirs().map_or_else(|| PathBuf::from(".sight"), |dirs| dirs.data_dir().to_path_buf())
}

pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
