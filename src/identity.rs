//! Stable identifiers for catalog records.
//!
//! Every record's `uuid` is a version 5 UUID in a fixed application
//! namespace, named by the record's normalized natural key. Measurements
//! without a lab-supplied id get a content-addressed natural key built from
//! their linked files or their scalar fields.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::CatalogId;
use crate::error::CatalogError;

pub const DNS_FOR_NAMESPACE: &str = "sd2e.org";

/// `uuid3(NAMESPACE_DNS, DNS_FOR_NAMESPACE)`.
pub const UUID_NAMESPACE: Uuid = Uuid::from_u128(0x54765aeb_44ca_374a_9a9f_eb4658383ee4);

pub const STORAGE_ROOT: &str = "uploads/";

const MEASUREMENT_ID_EXCLUDES: [&str; 3] = ["sample_ids", "files_uuids", "measurement_name"];

/// Strip one leading separator, then the storage root prefix if present.
/// The storage root itself normalizes to the empty string.
pub fn normalize_path<'a>(path: &'a str, storage_root: &str) -> &'a str {
    let path = path.strip_prefix('/').unwrap_or(path);
    if storage_root.is_empty() {
        return path;
    }
    if path == storage_root.trim_end_matches('/') {
        return "";
    }
    path.strip_prefix(storage_root).unwrap_or(path)
}

pub fn derive_path_id(path: &str, storage_root: &str) -> Result<CatalogId, CatalogError> {
    catalog_id(normalize_path(path, storage_root)).map_err(|_| {
        CatalogError::Data(format!("cannot derive an identifier from \"{path}\""))
    })
}

/// Identifier of an already normalized natural key.
pub fn catalog_id(key: &str) -> Result<CatalogId, CatalogError> {
    if key.is_empty() {
        return Err(CatalogError::Data(
            "cannot derive an identifier from an empty key".to_string(),
        ));
    }
    Ok(CatalogId::from_uuid(Uuid::new_v5(&UUID_NAMESPACE, key.as_bytes())))
}

/// Natural key of a measurement. Linked files win over scalar properties.
pub fn derive_measurement_id(
    measurement: &Map<String, Value>,
    prefix: Option<&str>,
) -> Result<String, CatalogError> {
    let file_refs = measurement
        .get("files")
        .map(file_references)
        .unwrap_or_default();
    if !file_refs.is_empty() {
        return Ok(measurement_id_from_files(file_refs, prefix));
    }
    Ok(measurement_id_from_properties(measurement, prefix))
}

fn measurement_id_from_files(mut refs: Vec<String>, prefix: Option<&str>) -> String {
    refs.sort();
    format!("{}{}", id_prefix("files:", prefix), refs.join("|"))
}

fn measurement_id_from_properties(measurement: &Map<String, Value>, prefix: Option<&str>) -> String {
    let mut keys: Vec<&String> = measurement
        .keys()
        .filter(|key| !MEASUREMENT_ID_EXCLUDES.contains(&key.as_str()))
        .collect();
    keys.sort();

    let mut pairs = Vec::with_capacity(keys.len() + 1);
    if let Some(prefix) = prefix {
        pairs.push(prefix.to_lowercase());
    }
    for key in keys {
        if let Some(text) = scalar_text(&measurement[key]) {
            pairs.push(format!("{key}:{}", slugify(&text)));
        }
    }
    format!("{}{}", id_prefix("properties:", prefix), pairs.join("|"))
}

fn id_prefix(kind: &str, prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{kind}"),
        None => kind.to_string(),
    }
}

fn file_references(files: &Value) -> Vec<String> {
    let Value::Array(items) = files else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(name) => Some(name.to_lowercase()),
            Value::Object(obj) => obj
                .get("file_id")
                .or_else(|| obj.get("name"))
                .and_then(scalar_text)
                .map(|text| text.to_lowercase()),
            _ => None,
        })
        .collect()
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Lower-case ASCII slug: alphanumeric runs joined by single dashes.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    slug
}
