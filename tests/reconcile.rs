use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use assert_matches::assert_matches;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Value, json};
use tempfile::TempDir;

use datacatalog::config::Collections;
use datacatalog::domain::CatalogId;
use datacatalog::error::CatalogError;
use datacatalog::identity::STORAGE_ROOT;
use datacatalog::reconcile::Reconciler;
use datacatalog::record::RecordKind;
use datacatalog::storage::{PosixStorage, StorageClient};
use datacatalog::store::{Document, DocumentStore, Filter, MemoryStore};

const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 13];
const PROTEIN: &str = "ginkgo/201808/protein.png";
const PROTEIN_UUID: &str = "2d70c856-4fe5-53be-a67b-8df65bf303a8";

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn local_catalog() -> (TempDir, Reconciler<MemoryStore, PosixStorage>) {
    let dir = tempfile::tempdir().unwrap();
    let storage = PosixStorage::new("local", dir.path().to_str().unwrap());
    let reconciler = Reconciler::new(
        MemoryStore::new(),
        storage,
        Collections::default(),
        STORAGE_ROOT,
    );
    (dir, reconciler)
}

fn write_upload(dir: &Path, filename: &str, bytes: &[u8]) {
    let path = dir.join("uploads").join(filename);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

#[test]
fn new_file_starts_at_revision_zero() {
    let (dir, catalog) = local_catalog();
    write_upload(dir.path(), PROTEIN, PNG_BYTES);

    let record = catalog.reconcile_file(PROTEIN).unwrap();
    assert_eq!(record.uuid.as_str(), PROTEIN_UUID);
    assert_eq!(record.natural_key, PROTEIN);
    assert_eq!(record.revision(), 0);
    assert_eq!(record.base.created_date, record.base.modified_date);
    assert_eq!(record.property("lab"), Some(&json!("ginkgo")));
    assert_eq!(record.property("original_filename"), Some(&json!(PROTEIN)));
    assert_eq!(record.property("file_type"), Some(&json!("image/png")));
    assert_eq!(record.property("size"), Some(&json!(PNG_BYTES.len())));
    assert_eq!(record.checksum().map(str::len), Some(40));
    assert_eq!(
        record.property("file_created"),
        record.property("file_modified")
    );
    assert_eq!(catalog.store().count("files"), 1);
}

#[test]
fn unchanged_bytes_keep_revision_and_changed_bytes_bump_it() {
    let (dir, catalog) = local_catalog();
    write_upload(dir.path(), PROTEIN, PNG_BYTES);

    let first = catalog.reconcile_file(PROTEIN).unwrap();
    let again = catalog.reconcile_file(PROTEIN).unwrap();
    assert_eq!(again.revision(), 0);
    assert_eq!(again.base.modified_date, first.base.modified_date);
    assert_eq!(again.checksum(), first.checksum());

    write_upload(dir.path(), PROTEIN, b"re-uploaded with different bytes");
    let revised = catalog.reconcile_file(PROTEIN).unwrap();
    assert_eq!(revised.revision(), 1);
    assert_eq!(revised.base.created_date, first.base.created_date);
    assert!(revised.base.modified_date >= first.base.modified_date);
    assert_ne!(revised.checksum(), first.checksum());
    assert_eq!(revised.property("file_type"), Some(&json!("text/plaintext")));
    assert_eq!(revised.property("original_filename"), Some(&json!(PROTEIN)));

    let stored = catalog.get_file(PROTEIN).unwrap().unwrap();
    assert_eq!(stored, revised);
}

#[test]
fn every_spelling_of_a_path_names_one_record() {
    let (dir, catalog) = local_catalog();
    write_upload(dir.path(), PROTEIN, PNG_BYTES);

    let a = catalog.reconcile_file(PROTEIN).unwrap();
    let b = catalog
        .reconcile_file("/uploads/ginkgo/201808/protein.png")
        .unwrap();
    let c = catalog
        .reconcile_file("agave://local/uploads/ginkgo/201808/protein.png")
        .unwrap();
    assert_eq!(a.uuid, b.uuid);
    assert_eq!(b.uuid, c.uuid);
    assert_eq!(c.revision(), 0);
    assert_eq!(catalog.store().count("files"), 1);
    assert_eq!(
        catalog.to_storage_uri("/uploads/ginkgo/201808/protein.png"),
        "agave://local/uploads/ginkgo/201808/protein.png"
    );
    assert_eq!(
        catalog
            .abspath("/uploads/ginkgo/201808/protein.png")
            .unwrap()
            .as_std_path(),
        dir.path().join("uploads/ginkgo/201808/protein.png")
    );
}

#[test]
fn unknown_lab_path_is_rejected_without_write() {
    // A bare date directory names no lab, so this common upload layout is refused.
    let (dir, catalog) = local_catalog();
    write_upload(dir.path(), "201808/protein.png", PNG_BYTES);

    assert_matches!(
        catalog.reconcile_file("201808/protein.png"),
        Err(CatalogError::Data(_))
    );
    assert_eq!(catalog.store().count("files"), 0);
}

#[test]
fn unreadable_new_file_is_a_data_error() {
    let (_dir, catalog) = local_catalog();
    assert_matches!(
        catalog.reconcile_file("ginkgo/never/uploaded.csv"),
        Err(CatalogError::Data(_))
    );
    assert_matches!(
        catalog.reconcile_file("agave://elsewhere/uploads/ginkgo/a.csv"),
        Err(CatalogError::Storage(_))
    );
    assert_eq!(catalog.store().count("files"), 0);
}

#[test]
fn vanished_file_keeps_its_stored_fixity() {
    let (dir, catalog) = local_catalog();
    write_upload(dir.path(), "ginkgo/run1/plate.csv", b"abc");
    let first = catalog.reconcile_file("ginkgo/run1/plate.csv").unwrap();

    fs::remove_file(dir.path().join("uploads/ginkgo/run1/plate.csv")).unwrap();
    let again = catalog.reconcile_file("ginkgo/run1/plate.csv").unwrap();
    assert_eq!(again.revision(), 0);
    assert_eq!(again.property("size"), Some(&json!(3)));
    assert_eq!(again.checksum(), first.checksum());
    assert_eq!(again.base.modified_date, first.base.modified_date);
}

#[test]
fn parent_segments_never_leave_the_storage_root() {
    let (dir, catalog) = local_catalog();
    fs::write(dir.path().join("secret.txt"), b"abc").unwrap();

    assert!(catalog.reconcile_file("ginkgo/../../secret.txt").is_err());
    assert_matches!(
        catalog.abspath("ginkgo/../../secret.txt"),
        Err(CatalogError::Storage(_))
    );
    assert_eq!(catalog.store().count("files"), 0);
}

#[test]
fn provenance_is_recorded_and_revises_existing_files() {
    let (dir, catalog) = local_catalog();
    write_upload(dir.path(), PROTEIN, PNG_BYTES);

    let first = catalog.reconcile_file(PROTEIN).unwrap();
    assert!(first.property("generated_by").is_none());

    let jobs = vec!["job-2".to_string(), "job-1".to_string(), "job-2".to_string()];
    let revised = catalog
        .reconcile_file_with_provenance(PROTEIN, &jobs)
        .unwrap();
    assert_eq!(revised.revision(), 1);
    assert_eq!(revised.property("generated_by"), Some(&json!(["job-1", "job-2"])));
}

#[test]
fn legacy_fields_are_dropped_without_a_revision() {
    let (dir, catalog) = local_catalog();
    write_upload(dir.path(), PROTEIN, PNG_BYTES);
    let record = catalog.reconcile_file(PROTEIN).unwrap();

    let mut legacy = record.to_document();
    legacy.insert("attributes".to_string(), json!({"lab": "ginkgo"}));
    legacy
        .get_mut("properties")
        .and_then(Value::as_object_mut)
        .unwrap()
        .insert("size_in_bytes".to_string(), json!(12));
    catalog
        .store()
        .find_one_and_replace("files", &Filter::by_uuid(PROTEIN_UUID), legacy)
        .unwrap()
        .unwrap();

    let cleaned = catalog.reconcile_file(PROTEIN).unwrap();
    assert_eq!(cleaned.revision(), 0);
    assert!(!cleaned.extra.contains_key("attributes"));
    assert!(cleaned.property("size_in_bytes").is_none());

    let stored = catalog
        .store()
        .find_one("files", &Filter::by_uuid(PROTEIN_UUID))
        .unwrap()
        .unwrap();
    assert!(!stored.contains_key("attributes"));
}

#[test]
fn delete_file_counts_removed_records() {
    let (dir, catalog) = local_catalog();
    write_upload(dir.path(), PROTEIN, PNG_BYTES);
    catalog.reconcile_file(PROTEIN).unwrap();

    assert_eq!(
        catalog
            .delete_file("/uploads/ginkgo/201808/protein.png")
            .unwrap(),
        1
    );
    assert_eq!(catalog.delete_file(PROTEIN).unwrap(), 0);
    assert!(catalog.get_file(PROTEIN).unwrap().is_none());
}

#[test]
fn sample_lifecycle() {
    let (_dir, catalog) = local_catalog();
    let sample = doc(json!({
        "id": "sample.1",
        "uuid": "00000000-0000-0000-0000-000000000000",
        "lab_sample_id": "r1c4",
        "measurements": [{"measurement_type": "FLOW"}],
        "measurements_ids": ["m2", "m1", "m2"],
        "properties": {"strain": "UWBF_7376", "revision": 40}
    }));

    let created = catalog.reconcile_sample(sample.clone()).unwrap();
    assert_eq!(created.uuid.as_str(), "fb6730d4-9513-5853-866b-8676e3778218");
    assert_eq!(created.revision(), 0);
    assert_eq!(created.references, vec!["m1", "m2"]);
    assert_eq!(created.property("strain"), Some(&json!("UWBF_7376")));
    assert_eq!(created.extra.get("lab_sample_id"), Some(&json!("r1c4")));
    assert!(!created.extra.contains_key("measurements"));

    let unchanged = catalog.reconcile_sample(sample).unwrap();
    assert_eq!(unchanged.revision(), 0);
    assert_eq!(unchanged.base.modified_date, created.base.modified_date);

    let revised = catalog
        .reconcile_sample(doc(json!({"id": "sample.1", "properties": {"strain": "UWBF_6390"}})))
        .unwrap();
    assert_eq!(revised.revision(), 1);
    assert_eq!(revised.base.created_date, created.base.created_date);
    assert_eq!(revised.references, vec!["m1", "m2"]);
    assert_eq!(revised.extra.get("lab_sample_id"), Some(&json!("r1c4")));

    let associated = catalog
        .associate_measurements(&revised.uuid, vec!["m3".to_string()])
        .unwrap();
    assert_eq!(associated.references, vec!["m3"]);
    assert_eq!(associated.revision(), 2);

    assert_eq!(catalog.delete_sample("sample.1").unwrap(), 1);
    assert_eq!(catalog.delete_sample("sample.1").unwrap(), 0);
}

#[test]
fn sample_requires_an_id() {
    let (_dir, catalog) = local_catalog();
    assert_matches!(
        catalog.reconcile_sample(doc(json!({"properties": {"strain": "x"}}))),
        Err(CatalogError::Data(_))
    );
    assert_matches!(
        catalog.reconcile_sample(doc(json!({"id": "s", "properties": "flat"}))),
        Err(CatalogError::Data(_))
    );
    assert_eq!(catalog.store().count("samples"), 0);
}

#[test]
fn measurement_without_id_is_content_addressed() {
    let (_dir, catalog) = local_catalog();
    let measurement = doc(json!({
        "measurement_type": "FLOW",
        "files": [{"name": "B.fcs"}, {"name": "a.fcs"}]
    }));

    let record = catalog.reconcile_measurement(measurement.clone()).unwrap();
    assert_eq!(record.natural_key, "files:a.fcs|b.fcs");
    assert_eq!(record.uuid.as_str(), "cf17d814-195a-5c42-9252-0f28aaf65fda");
    assert!(!record.extra.contains_key("files"));
    assert_eq!(record.extra.get("measurement_type"), Some(&json!("FLOW")));
    assert!(record.references.is_empty());

    let again = catalog.reconcile_measurement(measurement).unwrap();
    assert_eq!(again.uuid, record.uuid);
    assert_eq!(again.revision(), 0);

    let linked = catalog.associate_files(&record.uuid, "f-1").unwrap();
    assert_eq!(linked.references, vec!["f-1"]);
    assert_eq!(linked.revision(), 1);

    assert_eq!(catalog.delete_measurement("files:a.fcs|b.fcs").unwrap(), 1);
}

#[test]
fn nested_domain_changes_are_material() {
    let (_dir, catalog) = local_catalog();
    let first = catalog
        .reconcile_measurement(doc(json!({
            "id": "m1",
            "properties": {"reagent": {"id": "R1", "lot": "x"}}
        })))
        .unwrap();
    assert_eq!(first.revision(), 0);

    let revised = catalog
        .reconcile_measurement(doc(json!({
            "id": "m1",
            "properties": {"reagent": {"id": "R2", "lot": "x"}}
        })))
        .unwrap();
    assert_eq!(revised.revision(), 1);
    assert_eq!(revised.property("reagent"), Some(&json!({"id": "R2", "lot": "x"})));
    assert!(revised.base.modified_date >= first.base.modified_date);
}

#[test]
fn associate_never_creates() {
    let (_dir, catalog) = local_catalog();
    let missing: CatalogId = "fb6730d4-9513-5853-866b-8676e3778218".parse().unwrap();

    assert_matches!(
        catalog.associate_measurements(&missing, "m1"),
        Err(CatalogError::SampleUpdateFailure(_))
    );
    assert_matches!(
        catalog.associate_files(&missing, "f1"),
        Err(CatalogError::MeasurementUpdateFailure(_))
    );
    assert_matches!(
        catalog.associate_ids(RecordKind::File, &missing, "x".into()),
        Err(CatalogError::Data(_))
    );
    assert_eq!(catalog.store().count("samples"), 0);
    assert_eq!(catalog.store().count("measurements"), 0);
}

#[test]
fn query_filters_by_dotted_path() {
    let (_dir, catalog) = local_catalog();
    for (id, strain) in [("s1", "a"), ("s2", "b"), ("s3", "a")] {
        catalog
            .reconcile_sample(doc(json!({"id": id, "properties": {"strain": strain}})))
            .unwrap();
    }
    let found = catalog
        .query(RecordKind::Sample, &Filter::new().and_eq("properties.strain", "a"))
        .unwrap();
    let mut ids: Vec<_> = found.iter().map(|r| r.natural_key.as_str()).collect();
    ids.sort();
    assert_eq!(ids, ["s1", "s3"]);
}

/// Storage whose reads can be switched off after the first probe.
struct FlakyStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    reads_fail: AtomicBool,
}

impl FlakyStorage {
    fn with(path: &str, bytes: &[u8]) -> Self {
        let mut objects = HashMap::new();
        objects.insert(path.to_string(), bytes.to_vec());
        Self {
            objects: Mutex::new(objects),
            reads_fail: AtomicBool::new(false),
        }
    }

    fn bytes(&self, path: &str) -> Result<Vec<u8>, CatalogError> {
        self.objects
            .lock()
            .unwrap()
            .get(path.trim_start_matches('/'))
            .cloned()
            .ok_or_else(|| CatalogError::Storage(format!("no such object {path}")))
    }
}

impl StorageClient for FlakyStorage {
    fn system(&self) -> &str {
        "mock"
    }

    fn is_file(&self, path: &str) -> Result<bool, CatalogError> {
        Ok(self.bytes(path).is_ok())
    }

    fn is_dir(&self, _path: &str) -> Result<bool, CatalogError> {
        Ok(false)
    }

    fn list_directory(
        &self,
        _path: &str,
        _recursive: bool,
        _exclude: &[Regex],
    ) -> Result<Vec<String>, CatalogError> {
        Ok(Vec::new())
    }

    fn stat_size(&self, path: &str) -> Result<u64, CatalogError> {
        Ok(self.bytes(path)?.len() as u64)
    }

    fn stat_mtime(&self, _path: &str) -> Result<DateTime<Utc>, CatalogError> {
        Ok(DateTime::from_timestamp(1_533_081_600, 0).unwrap())
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>, CatalogError> {
        if self.reads_fail.load(Ordering::SeqCst) {
            return Err(CatalogError::Storage("read timed out".to_string()));
        }
        Ok(Box::new(Cursor::new(self.bytes(path)?)))
    }
}

#[test]
fn failed_reprobe_keeps_stored_fixity() {
    let storage = FlakyStorage::with("uploads/transcriptic/run1/plate.csv", b"abc");
    let catalog = Reconciler::new(MemoryStore::new(), storage, Collections::default(), STORAGE_ROOT);

    let first = catalog.reconcile_file("transcriptic/run1/plate.csv").unwrap();
    assert_eq!(
        first.checksum(),
        Some("a9993e364706816aba3e25717850c26c9cd0d89d")
    );
    assert_eq!(first.property("size"), Some(&json!(3)));
    assert_eq!(
        first.property("file_modified"),
        Some(&json!("2018-08-01T00:00:00.000000Z"))
    );

    catalog.storage().reads_fail.store(true, Ordering::SeqCst);
    let again = catalog.reconcile_file("transcriptic/run1/plate.csv").unwrap();
    assert_eq!(again.revision(), 0);
    assert_eq!(again.checksum(), first.checksum());
    assert_eq!(again.property("file_type"), first.property("file_type"));
}

#[test]
fn new_file_without_checksum_is_not_created() {
    let storage = FlakyStorage::with("uploads/emerald/a.txt", b"abc");
    storage.reads_fail.store(true, Ordering::SeqCst);
    let catalog = Reconciler::new(MemoryStore::new(), storage, Collections::default(), STORAGE_ROOT);

    assert_matches!(
        catalog.reconcile_file("emerald/a.txt"),
        Err(CatalogError::Data(_))
    );
    assert_eq!(catalog.store().count("files"), 0);
}

/// Store that lets another writer revise a record between read and replace.
#[derive(Default)]
struct RacingStore {
    inner: MemoryStore,
    interleave: AtomicBool,
}

impl DocumentStore for RacingStore {
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, CatalogError> {
        self.inner.find_one(collection, filter)
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, CatalogError> {
        self.inner.find(collection, filter)
    }

    fn insert_one(&self, collection: &str, document: Document) -> Result<String, CatalogError> {
        self.inner.insert_one(collection, document)
    }

    fn find_one_and_replace(
        &self,
        collection: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<Option<Document>, CatalogError> {
        if self.interleave.swap(false, Ordering::SeqCst) {
            let uuid = document["uuid"].as_str().unwrap().to_string();
            let by_uuid = Filter::by_uuid(&uuid);
            let mut concurrent = self.inner.find_one(collection, &by_uuid)?.unwrap();
            concurrent["properties"]["revision"] = json!(5);
            self.inner
                .find_one_and_replace(collection, &by_uuid, concurrent)?;
        }
        self.inner.find_one_and_replace(collection, filter, document)
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, CatalogError> {
        self.inner.delete_many(collection, filter)
    }
}

#[test]
fn concurrent_revision_surfaces_as_update_failure() {
    let (_dir, storage_catalog) = local_catalog();
    let storage = storage_catalog.storage().clone();
    let catalog = Reconciler::new(
        RacingStore::default(),
        storage,
        Collections::default(),
        STORAGE_ROOT,
    );

    catalog
        .reconcile_sample(doc(json!({"id": "s1", "properties": {"strain": "a"}})))
        .unwrap();
    catalog.store().interleave.store(true, Ordering::SeqCst);

    let err = catalog
        .reconcile_sample(doc(json!({"id": "s1", "properties": {"strain": "b"}})))
        .unwrap_err();
    assert_matches!(err, CatalogError::SampleUpdateFailure(_));
    assert!(err.is_update_failure());

    let stored = catalog
        .store()
        .find_one("samples", &Filter::new().and_eq("id", "s1"))
        .unwrap()
        .unwrap();
    assert_eq!(stored["properties"]["strain"], json!("a"));
    assert_eq!(stored["properties"]["revision"], json!(5));
}

/// Store whose writes can be switched to fail.
#[derive(Default)]
struct BrokenStore {
    inner: MemoryStore,
    writes_fail: AtomicBool,
}

impl BrokenStore {
    fn check(&self) -> Result<(), CatalogError> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Err(CatalogError::Database("connection reset".to_string()));
        }
        Ok(())
    }
}

impl DocumentStore for BrokenStore {
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, CatalogError> {
        self.inner.find_one(collection, filter)
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, CatalogError> {
        self.inner.find(collection, filter)
    }

    fn insert_one(&self, collection: &str, document: Document) -> Result<String, CatalogError> {
        self.check()?;
        self.inner.insert_one(collection, document)
    }

    fn find_one_and_replace(
        &self,
        collection: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<Option<Document>, CatalogError> {
        self.check()?;
        self.inner.find_one_and_replace(collection, filter, document)
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, CatalogError> {
        self.check()?;
        self.inner.delete_many(collection, filter)
    }
}

#[test]
fn write_errors_surface_as_update_failures() {
    let (dir, storage_catalog) = local_catalog();
    write_upload(dir.path(), PROTEIN, PNG_BYTES);
    let catalog = Reconciler::new(
        BrokenStore::default(),
        storage_catalog.storage().clone(),
        Collections::default(),
        STORAGE_ROOT,
    );
    catalog
        .reconcile_sample(doc(json!({"id": "s1", "properties": {"strain": "a"}})))
        .unwrap();
    catalog
        .reconcile_measurement(doc(json!({"id": "m1", "measurement_type": "FLOW"})))
        .unwrap();
    catalog.store().writes_fail.store(true, Ordering::SeqCst);

    assert_matches!(
        catalog.reconcile_file(PROTEIN),
        Err(CatalogError::FileUpdateFailure(_))
    );
    assert_matches!(
        catalog.reconcile_sample(doc(json!({"id": "s1", "properties": {"strain": "b"}}))),
        Err(CatalogError::SampleUpdateFailure(_))
    );
    assert_matches!(
        catalog.delete_measurement("m1"),
        Err(CatalogError::MeasurementUpdateFailure(_))
    );
    assert_matches!(
        catalog.delete_file(PROTEIN),
        Err(CatalogError::FileUpdateFailure(_))
    );
}
