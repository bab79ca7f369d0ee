use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Files copied concurrently per batch by the copy engine.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Directories under the application tree that survive an update.
const DEFAULT_PRESERVED_DIRS: &[&str] = &["models", "user", "output", "input", "custom_nodes"];

/// User configuration, read from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CradleConfig {
    #[serde(default)]
    pub copy: CopySection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub update: UpdateSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CopySection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for CopySection {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ToolsSection {
    /// Use `uv` for environment creation and package listing when set.
    #[serde(default)]
    pub uv: Option<PathBuf>,
    #[serde(default)]
    pub git: Option<PathBuf>,
    /// Override for the master interpreter; normally found under `standalone-env/`.
    #[serde(default)]
    pub python: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UpdateSection {
    #[serde(default = "default_preserved_dirs")]
    pub preserved_dirs: Vec<String>,
    /// Version-controlled installations follow the newest `vX.Y.Z` tag
    /// instead of the tip of `master`.
    #[serde(default)]
    pub stable_only: bool,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            preserved_dirs: default_preserved_dirs(),
            stable_only: false,
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_preserved_dirs() -> Vec<String> {
    DEFAULT_PRESERVED_DIRS
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

impl CradleConfig {
    pub fn parse_str(content: &str) -> Result<Self, SchemaError> {
        let config: CradleConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::parse_str(&content)
    }

    /// Load from `$CRADLE_CONFIG`, else `~/.config/cradle/config.toml`.
    pub fn load_default() -> Result<Self, SchemaError> {
        match default_config_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.copy.batch_size == 0 {
            return Err(SchemaError::InvalidConfig(
                "copy.batch_size must be greater than zero".to_owned(),
            ));
        }
        for dir in &self.update.preserved_dirs {
            if dir.is_empty() || dir.contains(['/', '\\']) || dir == "." || dir == ".." {
                return Err(SchemaError::InvalidConfig(format!(
                    "update.preserved_dirs entry '{dir}' must be a single directory name"
                )));
            }
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CRADLE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config/cradle/config.toml"))
}
