//! Trainer configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables:
//!
//! | Variable               | Setting                  |
//! |------------------------|--------------------------|
//! | `PARLEY_OUTPUT_DIR`    | `training.output_dir`    |
//! | `PARLEY_NUM_WORKERS`   | `training.num_workers`   |
//! | `PARLEY_CACHE_ENABLED` | `cache.enabled`          |
//! | `PARLEY_CACHE_DIR`     | `cache.directory`        |
//! | `PARLEY_LOG_LEVEL`     | `logging.level`          |

use crate::errors::{Result, TrainerError};
use parley_engine::{ArchiveIndex, DirectoryArchiveIndex, DisabledCache, LocalTrainingCache, TrainingCache};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// Directory archives are packaged into.
    pub output_dir: PathBuf,
    /// Worker threads for graph execution.
    pub num_workers: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("models"),
            num_workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub directory: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(".parley/cache"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub training: TrainingSettings,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TrainerError::Config(format!("{key}: expected a boolean, got '{value}'"))),
    }
}

impl TrainerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| TrainerError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// File settings (or defaults) with the process environment applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PARLEY_*` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("PARLEY_OUTPUT_DIR") {
            self.training.output_dir = PathBuf::from(dir);
        }
        if let Some(workers) = lookup("PARLEY_NUM_WORKERS") {
            self.training.num_workers = workers.trim().parse().map_err(|_| {
                TrainerError::Config(format!("PARLEY_NUM_WORKERS: expected a number, got '{workers}'"))
            })?;
        }
        if let Some(enabled) = lookup("PARLEY_CACHE_ENABLED") {
            self.cache.enabled = parse_bool("PARLEY_CACHE_ENABLED", &enabled)?;
        }
        if let Some(dir) = lookup("PARLEY_CACHE_DIR") {
            self.cache.directory = PathBuf::from(dir);
        }
        if let Some(level) = lookup("PARLEY_LOG_LEVEL") {
            self.logging.level = level.trim().to_lowercase();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.training.num_workers == 0 {
            return Err(TrainerError::Config("training.num_workers must be at least 1".into()));
        }
        if self.training.output_dir.as_os_str().is_empty() {
            return Err(TrainerError::Config("training.output_dir must not be empty".into()));
        }
        if self.cache.enabled && self.cache.directory.as_os_str().is_empty() {
            return Err(TrainerError::Config("cache.directory must not be empty".into()));
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(TrainerError::Config(format!(
                "logging.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.logging.level
            )));
        }
        Ok(())
    }

    pub fn build_cache(&self) -> Result<Arc<dyn TrainingCache>> {
        if !self.cache.enabled {
            return Ok(Arc::new(DisabledCache));
        }
        Ok(Arc::new(LocalTrainingCache::open(&self.cache.directory)?))
    }

    pub fn build_index(&self) -> Arc<dyn ArchiveIndex> {
        Arc::new(DirectoryArchiveIndex::new(&self.training.output_dir))
    }
}
