use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::identity::STORAGE_ROOT;
use crate::record::RecordKind;

pub const DEFAULT_CONFIG_FILE: &str = "datacatalog.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub collections: CollectionsSection,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub indexer: IndexerSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StorageSection {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub root: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CollectionsSection {
    #[serde(default)]
    pub files: Option<String>,
    #[serde(default)]
    pub samples: Option<String>,
    #[serde(default)]
    pub measurements: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IndexerSection {
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub batch_sleep_ms: Option<u64>,
    #[serde(default)]
    pub randomize_sleep: Option<bool>,
    #[serde(default)]
    pub exclude_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub queue_depth: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub system: String,
    pub base: Utf8PathBuf,
    pub root: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collections {
    pub files: String,
    pub samples: String,
    pub measurements: String,
}

impl Collections {
    pub fn name(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::File => &self.files,
            RecordKind::Sample => &self.samples,
            RecordKind::Measurement => &self.measurements,
        }
    }

    fn with_suffix(self, suffix: &str) -> Self {
        Self {
            files: format!("{}_{suffix}", self.files),
            samples: format!("{}_{suffix}", self.samples),
            measurements: format!("{}_{suffix}", self.measurements),
        }
    }
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            files: "files".to_string(),
            samples: "samples".to_string(),
            measurements: "measurements".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexerSettings {
    /// Dispatches between two pauses.
    pub batch_size: usize,
    pub batch_sleep: Duration,
    /// Sleep a uniformly random duration in `[0, batch_sleep]` instead.
    pub randomize_sleep: bool,
    pub exclude: Vec<Regex>,
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_sleep: Duration::from_millis(1000),
            randomize_sleep: true,
            exclude: compile_patterns(&default_exclude_patterns())
                .unwrap_or_default(),
            workers: 4,
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub storage: StorageSettings,
    pub database_path: Option<Utf8PathBuf>,
    pub collections: Collections,
    pub indexer: IndexerSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CatalogError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(CatalogError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CatalogError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CatalogError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CatalogError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let system = config.storage.system.unwrap_or_else(|| "local".to_string());
        if system.trim().is_empty() {
            return Err(CatalogError::ConfigParse(
                "storage.system must not be empty".to_string(),
            ));
        }
        let storage = StorageSettings {
            system,
            base: Utf8PathBuf::from(config.storage.base.unwrap_or_else(|| ".".to_string())),
            root: config
                .storage
                .root
                .unwrap_or_else(|| STORAGE_ROOT.to_string()),
        };

        let defaults = Collections::default();
        let mut collections = Collections {
            files: config.collections.files.unwrap_or(defaults.files),
            samples: config.collections.samples.unwrap_or(defaults.samples),
            measurements: config
                .collections
                .measurements
                .unwrap_or(defaults.measurements),
        };
        if config.debug {
            collections = collections.with_suffix(&Utc::now().timestamp().to_string());
        }

        let indexer_defaults = IndexerSettings::default();
        let indexer = config.indexer;
        let batch_size = indexer.batch_size.unwrap_or(indexer_defaults.batch_size);
        let workers = indexer.workers.unwrap_or(indexer_defaults.workers);
        let queue_depth = indexer.queue_depth.unwrap_or(indexer_defaults.queue_depth);
        if batch_size == 0 || workers == 0 || queue_depth == 0 {
            return Err(CatalogError::ConfigParse(
                "indexer batch_size, workers and queue_depth must be at least 1".to_string(),
            ));
        }
        let exclude = compile_patterns(
            &indexer
                .exclude_patterns
                .unwrap_or_else(default_exclude_patterns),
        )?;

        Ok(ResolvedConfig {
            schema_version,
            storage,
            database_path: config.database.path.map(Utf8PathBuf::from),
            collections,
            indexer: IndexerSettings {
                batch_size,
                batch_sleep: indexer
                    .batch_sleep_ms
                    .map(Duration::from_millis)
                    .unwrap_or(indexer_defaults.batch_sleep),
                randomize_sleep: indexer
                    .randomize_sleep
                    .unwrap_or(indexer_defaults.randomize_sleep),
                exclude,
                workers,
                queue_depth,
            },
        })
    }
}

/// Scheduler sidecar files that are never cataloged.
pub fn default_exclude_patterns() -> Vec<String> {
    vec![r"\.(log|err|out)$".to_string()]
}

pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, CatalogError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|err| {
                CatalogError::ConfigParse(format!("invalid exclude pattern {pattern}: {err}"))
            })
        })
        .collect()
}
