use std::fmt;
use std::fs;
use std::io::Read;
use std::str::FromStr;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use regex::Regex;
use walkdir::WalkDir;

use crate::error::CatalogError;

pub const URI_SCHEME: &str = "agave://";

/// A path on a named storage system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUri {
    pub system: String,
    pub path: String,
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{URI_SCHEME}{}/{}",
            self.system,
            self.path.trim_start_matches('/')
        )
    }
}

impl FromStr for StorageUri {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let rest = value
            .trim()
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| CatalogError::Storage(format!("not a storage uri: {value}")))?;
        let (system, path) = rest.split_once('/').unwrap_or((rest, ""));
        if system.is_empty() {
            return Err(CatalogError::Storage(format!(
                "storage uri has no system: {value}"
            )));
        }
        Ok(Self {
            system: system.to_string(),
            path: path.to_string(),
        })
    }
}

/// Capability to stat, list and read objects on one storage system.
///
/// Paths are storage paths relative to the system root, e.g.
/// `uploads/ginkgo/run1/plate.csv`; a leading separator is tolerated.
pub trait StorageClient: Send + Sync {
    fn system(&self) -> &str;

    fn resolve_uri(&self, uri: &str) -> Result<StorageUri, CatalogError> {
        if !uri.trim_start().starts_with(URI_SCHEME) {
            return Ok(StorageUri {
                system: self.system().to_string(),
                path: uri.trim().to_string(),
            });
        }
        let parsed: StorageUri = uri.parse()?;
        if parsed.system != self.system() {
            return Err(CatalogError::Storage(format!(
                "uri {uri} does not belong to storage system {}",
                self.system()
            )));
        }
        Ok(parsed)
    }

    fn is_file(&self, path: &str) -> Result<bool, CatalogError>;
    fn is_dir(&self, path: &str) -> Result<bool, CatalogError>;
    fn list_directory(
        &self,
        path: &str,
        recursive: bool,
        exclude: &[Regex],
    ) -> Result<Vec<String>, CatalogError>;
    fn stat_size(&self, path: &str) -> Result<u64, CatalogError>;
    fn stat_mtime(&self, path: &str) -> Result<DateTime<Utc>, CatalogError>;
    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>, CatalogError>;
}

/// Storage system mounted on the local filesystem.
#[derive(Debug, Clone)]
pub struct PosixStorage {
    system: String,
    base: Utf8PathBuf,
}

impl PosixStorage {
    pub fn new(system: impl Into<String>, base: impl Into<Utf8PathBuf>) -> Self {
        Self {
            system: system.into(),
            base: base.into(),
        }
    }

    pub fn base(&self) -> &Utf8Path {
        &self.base
    }

    /// Filesystem path of a storage path. Parent-directory segments are
    /// refused so every object stays under `base`.
    pub fn local_path(&self, path: &str) -> Result<Utf8PathBuf, CatalogError> {
        let relative = Utf8Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| component == Utf8Component::ParentDir)
        {
            return Err(CatalogError::Storage(format!(
                "path escapes the storage root: {path}"
            )));
        }
        Ok(self.base.join(relative))
    }

    fn metadata(&self, path: &str) -> Result<fs::Metadata, CatalogError> {
        let local = self.local_path(path)?;
        fs::metadata(local.as_std_path())
            .map_err(|err| CatalogError::Storage(format!("stat {local}: {err}")))
    }
}

impl StorageClient for PosixStorage {
    fn system(&self) -> &str {
        &self.system
    }

    fn is_file(&self, path: &str) -> Result<bool, CatalogError> {
        match fs::metadata(self.local_path(path)?.as_std_path()) {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CatalogError::Storage(err.to_string())),
        }
    }

    fn is_dir(&self, path: &str) -> Result<bool, CatalogError> {
        match fs::metadata(self.local_path(path)?.as_std_path()) {
            Ok(meta) => Ok(meta.is_dir()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CatalogError::Storage(err.to_string())),
        }
    }

    fn list_directory(
        &self,
        path: &str,
        recursive: bool,
        exclude: &[Regex],
    ) -> Result<Vec<String>, CatalogError> {
        let root = self.local_path(path)?;
        let walker = WalkDir::new(root.as_std_path()).min_depth(1);
        let walker = if recursive { walker } else { walker.max_depth(1) };

        let mut items = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|err| CatalogError::Storage(err.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(self.base.as_std_path())
                .map_err(|err| CatalogError::Storage(err.to_string()))?;
            let relative = Utf8Path::from_path(relative).ok_or_else(|| {
                CatalogError::Storage(format!("non-utf8 path: {}", entry.path().display()))
            })?;
            let storage_path = relative.as_str().replace('\\', "/");
            if exclude.iter().any(|pattern| pattern.is_match(&storage_path)) {
                continue;
            }
            items.push(storage_path);
        }
        Ok(items)
    }

    fn stat_size(&self, path: &str) -> Result<u64, CatalogError> {
        Ok(self.metadata(path)?.len())
    }

    fn stat_mtime(&self, path: &str) -> Result<DateTime<Utc>, CatalogError> {
        let modified = self
            .metadata(path)?
            .modified()
            .map_err(|err| CatalogError::Storage(err.to_string()))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>, CatalogError> {
        let local = self.local_path(path)?;
        let file = fs::File::open(local.as_std_path())
            .map_err(|err| CatalogError::Storage(format!("open {local}: {err}")))?;
        Ok(Box::new(file))
    }
}
