use serde::Serialize;

use crate::config::{Collections, IndexerSettings, ResolvedConfig};
use crate::domain::CatalogId;
use crate::error::CatalogError;
use crate::indexer::{DispatchSummary, IndexSummary, Indexer, TaskDispatcher};
use crate::reconcile::{IdSet, Reconciler};
use crate::record::{Record, RecordKind};
use crate::storage::StorageClient;
use crate::store::{Document, DocumentStore, Filter};

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub kind: RecordKind,
    pub key: String,
    pub deleted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub kind: RecordKind,
    pub count: usize,
    pub records: Vec<Record>,
}

/// Entry point for callers: reconciliation, association, deletion, lookup
/// and recursive indexing against one document store and storage system.
pub struct Catalog<S: DocumentStore, C: StorageClient> {
    reconciler: Reconciler<S, C>,
    indexer: IndexerSettings,
}

impl<S: DocumentStore, C: StorageClient> Catalog<S, C> {
    pub fn new(store: S, storage: C, config: &ResolvedConfig) -> Self {
        Self::with_settings(
            store,
            storage,
            config.collections.clone(),
            config.storage.root.clone(),
            config.indexer.clone(),
        )
    }

    pub fn with_settings(
        store: S,
        storage: C,
        collections: Collections,
        storage_root: String,
        indexer: IndexerSettings,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store, storage, collections, storage_root),
            indexer,
        }
    }

    pub fn reconciler(&self) -> &Reconciler<S, C> {
        &self.reconciler
    }

    pub fn reconcile_file(&self, uri: &str) -> Result<Record, CatalogError> {
        self.reconciler.reconcile_file(uri)
    }

    pub fn reconcile_sample(&self, sample: Document) -> Result<Record, CatalogError> {
        self.reconciler.reconcile_sample(sample)
    }

    pub fn reconcile_measurement(&self, measurement: Document) -> Result<Record, CatalogError> {
        self.reconciler.reconcile_measurement(measurement)
    }

    pub fn associate_files(
        &self,
        measurement_uuid: &CatalogId,
        file_ids: impl Into<IdSet>,
    ) -> Result<Record, CatalogError> {
        self.reconciler.associate_files(measurement_uuid, file_ids)
    }

    pub fn associate_measurements(
        &self,
        sample_uuid: &CatalogId,
        measurement_ids: impl Into<IdSet>,
    ) -> Result<Record, CatalogError> {
        self.reconciler
            .associate_measurements(sample_uuid, measurement_ids)
    }

    pub fn delete_file(&self, path: &str) -> Result<DeleteResult, CatalogError> {
        Ok(DeleteResult {
            kind: RecordKind::File,
            key: self.reconciler.normalize(path).to_string(),
            deleted: self.reconciler.delete_file(path)?,
        })
    }

    pub fn delete_sample(&self, id: &str) -> Result<DeleteResult, CatalogError> {
        Ok(DeleteResult {
            kind: RecordKind::Sample,
            key: id.to_string(),
            deleted: self.reconciler.delete_sample(id)?,
        })
    }

    pub fn delete_measurement(&self, id: &str) -> Result<DeleteResult, CatalogError> {
        Ok(DeleteResult {
            kind: RecordKind::Measurement,
            key: id.to_string(),
            deleted: self.reconciler.delete_measurement(id)?,
        })
    }

    pub fn show_file(&self, path: &str) -> Result<Option<Record>, CatalogError> {
        self.reconciler.get_file(path)
    }

    pub fn query(&self, kind: RecordKind, filter: &Filter) -> Result<QueryResult, CatalogError> {
        let records = self.reconciler.query(kind, filter)?;
        Ok(QueryResult {
            kind,
            count: records.len(),
            records,
        })
    }

    /// Index everything under `uri` with the local worker pool.
    pub fn dispatch_indexing(
        &self,
        uri: &str,
        generated_by: &[String],
    ) -> Result<IndexSummary, CatalogError> {
        Indexer::new(&self.reconciler, &self.indexer).run_pool(uri, generated_by)
    }

    /// Fan out through an external task transport instead of the pool.
    pub fn dispatch_with(
        &self,
        uri: &str,
        generated_by: &[String],
        dispatcher: &dyn TaskDispatcher,
    ) -> Result<DispatchSummary, CatalogError> {
        Indexer::new(&self.reconciler, &self.indexer).dispatch(uri, generated_by, dispatcher)
    }
}
