//! Create-or-update with revisioning for files, samples and measurements.
//!
//! Every reconciliation derives the record's uuid from its natural key,
//! looks the record up, and either inserts a fresh revision-0 document or
//! merges the supplied fields over the stored one. An update that changes
//! anything beyond the volatile fields bumps `revision` by one and refreshes
//! `modified_date`; the write is a compare-and-swap on the revision that was
//! read, so a concurrent writer surfaces as an update failure instead of a
//! silently lost revision.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::Collections;
use crate::domain::{CatalogId, lab_from_path};
use crate::error::CatalogError;
use crate::fixity;
use crate::identity::{catalog_id, derive_measurement_id, normalize_path};
use crate::merge::{diff, filter_keys, merge_maps};
use crate::record::{BaseProperties, Record, RecordKind, dedup_sorted, timestamp};
use crate::storage::{PosixStorage, StorageClient, StorageUri};
use crate::store::{Document, DocumentStore, Filter};

const LEGACY_FILE_PROPERTIES: [&str; 5] = [
    "originator_id",
    "inferred_file_type",
    "declared_file_type",
    "state",
    "size_in_bytes",
];
const LEGACY_FILE_FIELDS: [&str; 3] = ["attributes", "variables", "annotations"];

/// One or many record uuids, de-duplicated on construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet(Vec<String>);

impl IdSet {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for IdSet {
    fn from(id: &str) -> Self {
        Self(vec![id.to_string()])
    }
}

impl From<String> for IdSet {
    fn from(id: String) -> Self {
        Self(vec![id])
    }
}

impl From<Vec<String>> for IdSet {
    fn from(ids: Vec<String>) -> Self {
        Self(dedup_sorted(ids))
    }
}

impl From<&[&str]> for IdSet {
    fn from(ids: &[&str]) -> Self {
        ids.iter().map(|id| id.to_string()).collect()
    }
}

impl FromIterator<String> for IdSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

pub struct Reconciler<S: DocumentStore, C: StorageClient> {
    store: S,
    storage: C,
    collections: Collections,
    storage_root: String,
}

impl<S: DocumentStore, C: StorageClient> Reconciler<S, C> {
    pub fn new(
        store: S,
        storage: C,
        collections: Collections,
        storage_root: impl Into<String>,
    ) -> Self {
        Self {
            store,
            storage,
            collections,
            storage_root: storage_root.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn storage(&self) -> &C {
        &self.storage
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    pub fn normalize<'a>(&self, path: &'a str) -> &'a str {
        normalize_path(path, &self.storage_root)
    }

    /// Storage path of a normalized catalog filename.
    pub fn storage_path(&self, filename: &str) -> String {
        let root = self.storage_root.as_str();
        if root.is_empty() || root.ends_with('/') {
            format!("{root}{filename}")
        } else {
            format!("{root}/{filename}")
        }
    }

    pub fn to_storage_uri(&self, filename: &str) -> String {
        StorageUri {
            system: self.storage.system().to_string(),
            path: self.storage_path(self.normalize(filename)),
        }
        .to_string()
    }

    /// Location on storage of any accepted spelling of `uri`: a storage uri,
    /// a rooted or bare storage path, or a catalog filename.
    pub fn locate(&self, uri: &str) -> Result<StorageUri, CatalogError> {
        let target = self.storage.resolve_uri(uri)?;
        let path = self.storage_path(self.normalize(&target.path));
        Ok(StorageUri {
            system: target.system,
            path,
        })
    }

    pub fn reconcile_file(&self, uri: &str) -> Result<Record, CatalogError> {
        self.reconcile_file_with_provenance(uri, &[])
    }

    /// Reconcile the file at `uri`, recording `generated_by` as provenance
    /// when non-empty. The object's fixity is re-probed on every call.
    pub fn reconcile_file_with_provenance(
        &self,
        uri: &str,
        generated_by: &[String],
    ) -> Result<Record, CatalogError> {
        let kind = RecordKind::File;
        let (filename, uuid) = self.file_identity(uri)?;
        let lab = lab_from_path(&filename)?;
        let snapshot = fixity::probe(&self.storage, &self.storage_path(&filename));
        let now = Utc::now();

        let mut properties = snapshot.to_properties();
        properties.insert("lab".to_string(), Value::String(lab.as_key().to_string()));
        if !generated_by.is_empty() {
            properties.insert(
                "generated_by".to_string(),
                string_array(dedup_sorted(generated_by.to_vec())),
            );
        }

        match self.lookup(kind, &uuid)? {
            None => {
                if snapshot.checksum.is_none() {
                    return Err(CatalogError::Data(format!(
                        "cannot compute fixity for {filename}"
                    )));
                }
                // First sighting: creation and modification coincide.
                if let Some(modified) = snapshot.file_modified {
                    properties.insert("file_created".to_string(), timestamp(modified));
                }
                properties.insert(
                    "original_filename".to_string(),
                    Value::String(filename.clone()),
                );
                let supplied = keyed_document(kind, &filename, properties);
                self.create(kind, template(kind, &uuid, &filename, now), supplied)
            }
            Some(stored) => {
                let supplied = keyed_document(kind, &filename, properties);
                self.update(kind, stored, supplied, now)
            }
        }
    }

    pub fn reconcile_sample(&self, sample: Document) -> Result<Record, CatalogError> {
        let id = match sample.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(CatalogError::Data("id missing from sample".to_string())),
        };
        self.reconcile_keyed(RecordKind::Sample, &id, sample)
    }

    /// Measurements without an `id` get a content-addressed one.
    pub fn reconcile_measurement(&self, measurement: Document) -> Result<Record, CatalogError> {
        let id = match measurement.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => derive_measurement_id(&measurement, None)?,
        };
        self.reconcile_keyed(RecordKind::Measurement, &id, measurement)
    }

    pub fn associate_files(
        &self,
        measurement_uuid: &CatalogId,
        file_ids: impl Into<IdSet>,
    ) -> Result<Record, CatalogError> {
        self.associate_ids(RecordKind::Measurement, measurement_uuid, file_ids.into())
    }

    pub fn associate_measurements(
        &self,
        sample_uuid: &CatalogId,
        measurement_ids: impl Into<IdSet>,
    ) -> Result<Record, CatalogError> {
        self.associate_ids(RecordKind::Sample, sample_uuid, measurement_ids.into())
    }

    /// Replace the reference list of an existing record. Never creates.
    pub fn associate_ids(
        &self,
        kind: RecordKind,
        uuid: &CatalogId,
        ids: IdSet,
    ) -> Result<Record, CatalogError> {
        let field = kind.references_field().ok_or_else(|| {
            CatalogError::Data(format!("{kind} records do not hold references"))
        })?;
        let Some(stored) = self.lookup(kind, uuid)? else {
            return Err(kind.update_failure(format!("nonexistent uuid specified: {uuid}")));
        };
        let mut supplied = Document::new();
        supplied.insert(field.to_string(), string_array(ids.0));
        self.update(kind, stored, supplied, Utc::now())
    }

    pub fn delete_file(&self, uri: &str) -> Result<u64, CatalogError> {
        let (_, uuid) = self.file_identity(uri)?;
        self.delete(RecordKind::File, &Filter::by_uuid(uuid.as_str()))
    }

    pub fn delete_sample(&self, id: &str) -> Result<u64, CatalogError> {
        self.delete(
            RecordKind::Sample,
            &Filter::new().and_eq("id", self.normalize(id)),
        )
    }

    pub fn delete_measurement(&self, id: &str) -> Result<u64, CatalogError> {
        self.delete(
            RecordKind::Measurement,
            &Filter::new().and_eq("id", self.normalize(id)),
        )
    }

    pub fn get_file(&self, uri: &str) -> Result<Option<Record>, CatalogError> {
        let (_, uuid) = self.file_identity(uri)?;
        self.get(RecordKind::File, &uuid)
    }

    pub fn get(&self, kind: RecordKind, uuid: &CatalogId) -> Result<Option<Record>, CatalogError> {
        self.lookup(kind, uuid)?
            .map(|document| Record::from_document(kind, document))
            .transpose()
    }

    pub fn query(&self, kind: RecordKind, filter: &Filter) -> Result<Vec<Record>, CatalogError> {
        self.store
            .find(self.collections.name(kind), filter)
            .map_err(|err| CatalogError::Query(format!("{kind} query failed: {err}")))?
            .into_iter()
            .map(|document| Record::from_document(kind, document))
            .collect()
    }

    fn file_identity(&self, uri: &str) -> Result<(String, CatalogId), CatalogError> {
        let target = self.storage.resolve_uri(uri)?;
        let filename = self.normalize(&target.path).to_string();
        let uuid = catalog_id(&filename)?;
        Ok((filename, uuid))
    }

    fn reconcile_keyed(
        &self,
        kind: RecordKind,
        key: &str,
        supplied: Document,
    ) -> Result<Record, CatalogError> {
        let key = self.normalize(key).to_string();
        let uuid = catalog_id(&key)?;
        let mut supplied = supplied;
        supplied.insert(
            kind.natural_key_field().to_string(),
            Value::String(key.clone()),
        );
        let now = Utc::now();
        match self.lookup(kind, &uuid)? {
            None => self.create(kind, template(kind, &uuid, &key, now), supplied),
            Some(stored) => self.update(kind, stored, supplied, now),
        }
    }

    fn lookup(&self, kind: RecordKind, uuid: &CatalogId) -> Result<Option<Document>, CatalogError> {
        self.store
            .find_one(self.collections.name(kind), &Filter::by_uuid(uuid.as_str()))
    }

    fn create(
        &self,
        kind: RecordKind,
        template: Document,
        supplied: Document,
    ) -> Result<Record, CatalogError> {
        let supplied = sanitize(kind, supplied)?;
        let document = merge_maps(&template, &supplied);
        let record = Record::from_document(kind, document.clone())?;
        self.store
            .insert_one(self.collections.name(kind), document)
            .map_err(|err| {
                kind.update_failure(format!("failed to create {kind} {}: {err}", record.uuid))
            })?;
        info!(kind = %kind, uuid = %record.uuid, key = %record.natural_key, "catalog record created");
        Ok(record)
    }

    fn update(
        &self,
        kind: RecordKind,
        stored: Document,
        supplied: Document,
        now: DateTime<Utc>,
    ) -> Result<Record, CatalogError> {
        let current = Record::from_document(kind, stored.clone())?;
        let supplied = sanitize(kind, supplied)?;

        let baseline = if kind == RecordKind::File {
            drop_legacy_fields(&stored)
        } else {
            stored.clone()
        };
        let mut merged = merge_maps(&baseline, &supplied);
        let material = diff(&baseline, &merged);
        if material {
            let revision = current.revision() + 1;
            if let Some(properties) = merged.get_mut("properties").and_then(Value::as_object_mut) {
                properties.insert("modified_date".to_string(), timestamp(now));
                properties.insert("revision".to_string(), Value::from(revision));
            }
        }

        if merged == stored {
            debug!(kind = %kind, uuid = %current.uuid, "catalog record unchanged");
            return Ok(current);
        }

        let filter = Filter::by_uuid(current.uuid.as_str())
            .and_eq("properties.revision", current.revision());
        let replaced = self
            .store
            .find_one_and_replace(self.collections.name(kind), &filter, merged)
            .map_err(|err| {
                kind.update_failure(format!("failed to update {kind} {}: {err}", current.uuid))
            })?
            .ok_or_else(|| {
                kind.update_failure(format!(
                    "{kind} {} was removed or revised concurrently",
                    current.uuid
                ))
            })?;
        let record = Record::from_document(kind, replaced)?;
        if material {
            info!(
                kind = %kind,
                uuid = %record.uuid,
                revision = record.revision(),
                "catalog record revised"
            );
        } else {
            debug!(kind = %kind, uuid = %record.uuid, "catalog record refreshed");
        }
        Ok(record)
    }

    fn delete(&self, kind: RecordKind, filter: &Filter) -> Result<u64, CatalogError> {
        let removed = self
            .store
            .delete_many(self.collections.name(kind), filter)
            .map_err(|err| kind.update_failure(format!("failed to delete {kind}: {err}")))?;
        info!(kind = %kind, removed, "catalog records deleted");
        Ok(removed)
    }
}

impl<S: DocumentStore> Reconciler<S, PosixStorage> {
    /// Local filesystem path of a catalog filename.
    pub fn abspath(&self, filename: &str) -> Result<Utf8PathBuf, CatalogError> {
        self.storage
            .local_path(&self.storage_path(self.normalize(filename)))
    }
}

fn template(kind: RecordKind, uuid: &CatalogId, key: &str, now: DateTime<Utc>) -> Document {
    let base = BaseProperties::new(now);
    let mut properties = Map::new();
    properties.insert("created_date".to_string(), timestamp(base.created_date));
    properties.insert("modified_date".to_string(), timestamp(base.modified_date));
    properties.insert("revision".to_string(), Value::from(base.revision));

    let mut document = keyed_document(kind, key, properties);
    document.insert("uuid".to_string(), Value::String(uuid.to_string()));
    if let Some(field) = kind.references_field() {
        document.insert(field.to_string(), Value::Array(Vec::new()));
    }
    document
}

fn keyed_document(kind: RecordKind, key: &str, properties: Map<String, Value>) -> Document {
    let mut document = Document::new();
    document.insert(
        kind.natural_key_field().to_string(),
        Value::String(key.to_string()),
    );
    document.insert("properties".to_string(), Value::Object(properties));
    document
}

/// Drop fields the caller may not set: identity, revisioning, and inlined
/// related objects. Reference lists come back sorted and de-duplicated.
fn sanitize(kind: RecordKind, supplied: Document) -> Result<Document, CatalogError> {
    let mut excluded = vec!["uuid", "_id"];
    excluded.extend(kind.inline_field());
    let mut document = filter_keys(&supplied, &excluded);

    match document.get("properties") {
        None => {}
        Some(Value::Object(properties)) => {
            let properties = filter_keys(properties, &BaseProperties::KEYS);
            document.insert("properties".to_string(), Value::Object(properties));
        }
        Some(_) => {
            return Err(CatalogError::Data(format!(
                "{kind} properties must be an object"
            )));
        }
    }

    if let Some(field) = kind.references_field() {
        let ids = match document.remove(field) {
            None => None,
            Some(Value::String(id)) => Some(vec![id]),
            Some(Value::Array(items)) => Some(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(id) => Ok(id),
                        other => Err(CatalogError::Data(format!(
                            "{kind} {field} entries must be strings, got {other}"
                        ))),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Some(other) => {
                return Err(CatalogError::Data(format!(
                    "{kind} {field} must be a list, got {other}"
                )));
            }
        };
        if let Some(ids) = ids {
            document.insert(field.to_string(), string_array(dedup_sorted(ids)));
        }
    }
    Ok(document)
}

fn drop_legacy_fields(stored: &Document) -> Document {
    let mut document = filter_keys(stored, &LEGACY_FILE_FIELDS);
    if let Some(Value::Object(properties)) = document.get("properties") {
        let properties = filter_keys(properties, &LEGACY_FILE_PROPERTIES);
        document.insert("properties".to_string(), Value::Object(properties));
    }
    document
}

fn string_array(ids: Vec<String>) -> Value {
    Value::Array(ids.into_iter().map(Value::String).collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn document(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn sanitize_strips_identity_and_dedups_references() {
        let supplied = document(json!({
            "uuid": "not-mine",
            "id": "m1",
            "files": [{"name": "a.txt"}],
            "files_ids": ["b", "a", "b"],
            "properties": {"revision": 9, "created_date": "x", "assay": "flow"}
        }));
        let clean = sanitize(RecordKind::Measurement, supplied).unwrap();
        assert!(!clean.contains_key("uuid"));
        assert!(!clean.contains_key("files"));
        assert_eq!(clean["files_ids"], json!(["a", "b"]));
        assert_eq!(clean["properties"], json!({"assay": "flow"}));
    }

    #[test]
    fn idset_dedups() {
        let ids = IdSet::from(vec!["b".to_string(), "a".to_string(), "b".to_string()]);
        assert_eq!(ids.as_slice(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn legacy_fields_dropped() {
        let stored = document(json!({
            "attributes": {"lab": "ginkgo"},
            "properties": {"size_in_bytes": 3, "size": 3}
        }));
        let cleaned = drop_legacy_fields(&stored);
        assert_eq!(cleaned, document(json!({"properties": {"size": 3}})));
    }
}
