use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde_json::{Map, Value};
use tempfile::Builder;

use crate::error::CatalogError;

pub type Document = Map<String, Value>;

/// Conjunction of equality predicates over dotted field paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    terms: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and_eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push((path.into(), value.into()));
        self
    }

    pub fn by_uuid(uuid: &str) -> Self {
        Self::new().and_eq("uuid", uuid)
    }

    pub fn from_json(value: &Value) -> Result<Self, CatalogError> {
        let Value::Object(map) = value else {
            return Err(CatalogError::Query(format!(
                "query was not resolvable as an object: {value}"
            )));
        };
        Ok(Self {
            terms: map
                .iter()
                .map(|(path, value)| (path.clone(), value.clone()))
                .collect(),
        })
    }

    /// The uuid this filter pins, when it has a string `uuid` term.
    pub fn uuid(&self) -> Option<&str> {
        self.terms
            .iter()
            .find(|(path, _)| path == "uuid")
            .and_then(|(_, value)| value.as_str())
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.terms
            .iter()
            .all(|(path, expected)| lookup(document, path) == Some(expected))
    }
}

fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Document database capability. Collections are disjoint and addressed by
/// name; every document carries a unique `uuid`.
pub trait DocumentStore: Send + Sync {
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, CatalogError>;
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, CatalogError>;
    /// Returns the inserted document's uuid.
    fn insert_one(&self, collection: &str, document: Document) -> Result<String, CatalogError>;
    /// Atomically replaces the first match, returning the stored replacement,
    /// or `None` when nothing matched.
    fn find_one_and_replace(
        &self,
        collection: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<Option<Document>, CatalogError>;
    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, CatalogError>;
}

fn usable_uuid(uuid: &str) -> bool {
    !uuid.is_empty() && uuid.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
}

fn document_uuid(document: &Document) -> Result<String, CatalogError> {
    match document.get("uuid") {
        Some(Value::String(uuid)) if usable_uuid(uuid) => Ok(uuid.clone()),
        _ => Err(CatalogError::Database(
            "document has no usable uuid".to_string(),
        )),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, CatalogError> {
    mutex
        .lock()
        .map_err(|_| CatalogError::Database("store lock poisoned".to_string()))
}

/// In-process store, mainly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .map(|guard| guard.get(collection).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl DocumentStore for MemoryStore {
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, CatalogError> {
        let guard = lock(&self.collections)?;
        Ok(guard
            .get(collection)
            .and_then(|docs| docs.iter().find(|doc| filter.matches(doc)))
            .cloned())
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, CatalogError> {
        let guard = lock(&self.collections)?;
        Ok(guard
            .get(collection)
            .map(|docs| docs.iter().filter(|doc| filter.matches(doc)).cloned().collect())
            .unwrap_or_default())
    }

    fn insert_one(&self, collection: &str, document: Document) -> Result<String, CatalogError> {
        let uuid = document_uuid(&document)?;
        let mut guard = lock(&self.collections)?;
        let docs = guard.entry(collection.to_string()).or_default();
        if docs.iter().any(|doc| doc.get("uuid") == document.get("uuid")) {
            return Err(CatalogError::Database(format!(
                "duplicate key in {collection}: uuid {uuid}"
            )));
        }
        docs.push(document);
        Ok(uuid)
    }

    fn find_one_and_replace(
        &self,
        collection: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<Option<Document>, CatalogError> {
        document_uuid(&document)?;
        let mut guard = lock(&self.collections)?;
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(None);
        };
        let Some(index) = docs.iter().position(|doc| filter.matches(doc)) else {
            return Ok(None);
        };
        let clashes = docs
            .iter()
            .enumerate()
            .any(|(i, doc)| i != index && doc.get("uuid") == document.get("uuid"));
        if clashes {
            return Err(CatalogError::Database(format!(
                "duplicate key in {collection}: replacement uuid already stored"
            )));
        }
        docs[index] = document.clone();
        Ok(Some(document))
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, CatalogError> {
        let mut guard = lock(&self.collections)?;
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|doc| !filter.matches(doc));
        Ok((before - docs.len()) as u64)
    }
}

/// Store persisted as one directory per collection holding one JSON file per
/// document, named after the document's uuid.
#[derive(Debug)]
pub struct JsonDirStore {
    root: Utf8PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDirStore {
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, CatalogError> {
        let root = root.into();
        fs::create_dir_all(root.as_std_path())
            .map_err(|err| CatalogError::Database(format!("open store {root}: {err}")))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// `<user data dir>/datacatalog`.
    pub fn default_root() -> Result<Utf8PathBuf, CatalogError> {
        BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("datacatalog")).ok())
            .ok_or_else(|| {
                CatalogError::Database("unable to resolve data directory".to_string())
            })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> Result<Utf8PathBuf, CatalogError> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !valid {
            return Err(CatalogError::Database(format!(
                "invalid collection name: {collection}"
            )));
        }
        Ok(self.root.join(collection))
    }

    fn document_path(&self, collection: &str, uuid: &str) -> Result<Utf8PathBuf, CatalogError> {
        Ok(self.collection_dir(collection)?.join(format!("{uuid}.json")))
    }

    fn load_all(&self, collection: &str) -> Result<Vec<(Utf8PathBuf, Document)>, CatalogError> {
        let dir = self.collection_dir(collection)?;
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| CatalogError::Database(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| CatalogError::Database(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if path.extension() == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(document) = Self::read_document(&path)? {
                documents.push((path, document));
            }
        }
        Ok(documents)
    }

    /// `None` when the file is gone, e.g. deleted by another writer.
    fn read_document(path: &Utf8Path) -> Result<Option<Document>, CatalogError> {
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CatalogError::Database(format!("read {path}: {err}"))),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| CatalogError::Database(format!("parse {path}: {err}")))
    }

    /// Documents that can match `filter`. A uuid term reads the one file named
    /// after it; anything else scans the collection.
    fn candidates(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<(Utf8PathBuf, Document)>, CatalogError> {
        let Some(uuid) = filter.uuid() else {
            return self.load_all(collection);
        };
        if !usable_uuid(uuid) {
            return Ok(Vec::new());
        }
        let path = self.document_path(collection, uuid)?;
        Ok(Self::read_document(&path)?
            .map(|document| (path, document))
            .into_iter()
            .collect())
    }

    fn write_atomic(path: &Utf8Path, document: &Document) -> Result<(), CatalogError> {
        let parent = path
            .parent()
            .ok_or_else(|| CatalogError::Database(format!("invalid document path {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| CatalogError::Database(err.to_string()))?;
        let content = serde_json::to_vec_pretty(document)
            .map_err(|err| CatalogError::Database(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".datacatalog-doc")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| CatalogError::Database(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| CatalogError::Database(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| CatalogError::Database(err.to_string()))?;
        Ok(())
    }
}

impl DocumentStore for JsonDirStore {
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, CatalogError> {
        Ok(self
            .candidates(collection, filter)?
            .into_iter()
            .map(|(_, doc)| doc)
            .find(|doc| filter.matches(doc)))
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, CatalogError> {
        Ok(self
            .candidates(collection, filter)?
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|doc| filter.matches(doc))
            .collect())
    }

    fn insert_one(&self, collection: &str, document: Document) -> Result<String, CatalogError> {
        let uuid = document_uuid(&document)?;
        let path = self.document_path(collection, &uuid)?;
        let _guard = lock(&self.write_lock)?;
        if path.as_std_path().exists() {
            return Err(CatalogError::Database(format!(
                "duplicate key in {collection}: uuid {uuid}"
            )));
        }
        Self::write_atomic(&path, &document)?;
        Ok(uuid)
    }

    fn find_one_and_replace(
        &self,
        collection: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<Option<Document>, CatalogError> {
        let uuid = document_uuid(&document)?;
        let target = self.document_path(collection, &uuid)?;
        let _guard = lock(&self.write_lock)?;
        let Some((current, _)) = self
            .candidates(collection, filter)?
            .into_iter()
            .find(|(_, doc)| filter.matches(doc))
        else {
            return Ok(None);
        };
        if current != target && target.as_std_path().exists() {
            return Err(CatalogError::Database(format!(
                "duplicate key in {collection}: uuid {uuid}"
            )));
        }
        Self::write_atomic(&target, &document)?;
        if current != target {
            fs::remove_file(current.as_std_path())
                .map_err(|err| CatalogError::Database(err.to_string()))?;
        }
        Ok(Some(document))
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, CatalogError> {
        let _guard = lock(&self.write_lock)?;
        let mut removed = 0;
        for (path, doc) in self.candidates(collection, filter)? {
            if !filter.matches(&doc) {
                continue;
            }
            match fs::remove_file(path.as_std_path()) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(CatalogError::Database(err.to_string())),
            }
        }
        Ok(removed)
    }
}
