use std::io::Read;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::CatalogError;
use crate::record::timestamp;
use crate::storage::StorageClient;

pub const CHECKSUM_BLOCK_SIZE: usize = 131_072;
const SNIFF_LEN: u64 = 8192;
pub const DEFAULT_MEDIA_TYPE: &str = "text/plaintext";

/// Physical properties of one object, each independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixitySnapshot {
    pub size: Option<i64>,
    pub checksum: Option<String>,
    pub file_type: Option<String>,
    pub file_modified: Option<DateTime<Utc>>,
    pub file_created: Option<DateTime<Utc>>,
}

impl FixitySnapshot {
    /// Present fields only, in record `properties` form.
    pub fn to_properties(&self) -> Map<String, Value> {
        let mut properties = Map::new();
        if let Some(size) = self.size {
            properties.insert("size".to_string(), Value::from(size));
        }
        if let Some(checksum) = &self.checksum {
            properties.insert("checksum".to_string(), Value::String(checksum.clone()));
        }
        if let Some(file_type) = &self.file_type {
            properties.insert("file_type".to_string(), Value::String(file_type.clone()));
        }
        if let Some(modified) = self.file_modified {
            properties.insert("file_modified".to_string(), timestamp(modified));
        }
        if let Some(created) = self.file_created {
            properties.insert("file_created".to_string(), timestamp(created));
        }
        properties
    }
}

/// Probe every fixity field of `path`. Never fails: a sub-probe that errors
/// only leaves its field empty. A failed stat leaves `size` empty as well.
pub fn probe<C: StorageClient + ?Sized>(storage: &C, path: &str) -> FixitySnapshot {
    let file_modified = storage
        .stat_mtime(path)
        .inspect_err(|err| debug!(path, %err, "mtime probe failed"))
        .ok();
    let file_type = media_type(storage, path)
        .inspect_err(|err| debug!(path, %err, "media type probe failed"))
        .ok();
    let checksum = compute_checksum(storage, path)
        .inspect_err(|err| debug!(path, %err, "checksum probe failed"))
        .ok();

    let size = Some(size_in_bytes(storage, path)).filter(|size| *size >= 0);
    if size.is_none() {
        debug!(path, "size probe failed");
    }

    FixitySnapshot {
        size,
        checksum,
        file_type,
        file_modified,
        file_created: None,
    }
}

/// Size in bytes; 0 for anything that is not a regular file, -1 when the
/// object cannot be stat'ed at all.
pub fn size_in_bytes<C: StorageClient + ?Sized>(storage: &C, path: &str) -> i64 {
    match storage.is_file(path) {
        Ok(true) => storage
            .stat_size(path)
            .ok()
            .and_then(|size| i64::try_from(size).ok())
            .unwrap_or(-1),
        Ok(false) => match storage.stat_size(path) {
            Ok(_) => 0,
            Err(_) => -1,
        },
        Err(_) => -1,
    }
}

pub fn compute_checksum<C: StorageClient + ?Sized>(
    storage: &C,
    path: &str,
) -> Result<String, CatalogError> {
    let mut reader = storage.open_read(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; CHECKSUM_BLOCK_SIZE];
    loop {
        let read = reader
            .read(&mut buf)
            .map_err(|err| CatalogError::Storage(format!("read {path}: {err}")))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn validate_checksum<C: StorageClient + ?Sized>(
    storage: &C,
    path: &str,
    known_checksum: &str,
) -> Result<bool, CatalogError> {
    Ok(compute_checksum(storage, path)? == known_checksum)
}

/// Media type sniffed from the leading bytes of the content.
pub fn media_type<C: StorageClient + ?Sized>(
    storage: &C,
    path: &str,
) -> Result<String, CatalogError> {
    let mut head = Vec::with_capacity(SNIFF_LEN as usize);
    storage
        .open_read(path)?
        .take(SNIFF_LEN)
        .read_to_end(&mut head)
        .map_err(|err| CatalogError::Storage(format!("read {path}: {err}")))?;
    Ok(infer::get(&head)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string()))
}
