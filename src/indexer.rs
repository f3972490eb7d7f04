use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::IndexerSettings;
use crate::error::CatalogError;
use crate::reconcile::Reconciler;
use crate::storage::{StorageClient, StorageUri};
use crate::store::DocumentStore;

/// Payload of one per-file indexing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub uri: String,
    #[serde(default)]
    pub generated_by: Vec<String>,
}

/// Sends an indexing task back to the indexing entry point. Returns the
/// execution id when the transport assigns one.
pub trait TaskDispatcher: Send + Sync {
    fn send(&self, task: DispatchTask) -> Result<Option<String>, CatalogError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub uri: String,
    /// The target was a single file and was reconciled in place.
    pub direct: bool,
    pub listed: usize,
    pub dispatched: usize,
    pub dispatch_failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    #[serde(flatten)]
    pub dispatch: DispatchSummary,
    pub reconciled: usize,
    pub reconcile_failures: usize,
}

pub struct Indexer<'a, S: DocumentStore, C: StorageClient> {
    reconciler: &'a Reconciler<S, C>,
    settings: &'a IndexerSettings,
}

impl<'a, S: DocumentStore, C: StorageClient> Indexer<'a, S, C> {
    pub fn new(reconciler: &'a Reconciler<S, C>, settings: &'a IndexerSettings) -> Self {
        Self {
            reconciler,
            settings,
        }
    }

    /// A file target is reconciled directly. A directory target is listed
    /// recursively, shuffled, and fanned out one task per file through
    /// `dispatcher`, pausing after every `batch_size` sends. Failed sends are
    /// logged and skipped.
    pub fn dispatch(
        &self,
        uri: &str,
        generated_by: &[String],
        dispatcher: &dyn TaskDispatcher,
    ) -> Result<DispatchSummary, CatalogError> {
        let storage = self.reconciler.storage();
        let target = self.reconciler.locate(uri)?;
        let mut summary = DispatchSummary {
            uri: uri.to_string(),
            ..DispatchSummary::default()
        };

        if storage.is_file(&target.path)? {
            self.reconciler
                .reconcile_file_with_provenance(uri, generated_by)?;
            summary.direct = true;
            summary.listed = 1;
            return Ok(summary);
        }
        if !storage.is_dir(&target.path)? {
            return Err(CatalogError::Storage(format!(
                "{uri} is neither a file nor a directory"
            )));
        }

        let mut files = storage.list_directory(&target.path, true, &self.settings.exclude)?;
        files.shuffle(&mut rand::rng());
        summary.listed = files.len();
        info!(uri, files = files.len(), "fanning out indexing tasks");

        let batch_size = self.settings.batch_size.max(1);
        let total = files.len();
        for (index, path) in files.into_iter().enumerate() {
            let task = DispatchTask {
                uri: StorageUri {
                    system: target.system.clone(),
                    path,
                }
                .to_string(),
                generated_by: generated_by.to_vec(),
            };
            let task_uri = task.uri.clone();
            match dispatcher.send(task) {
                Ok(execution) => {
                    summary.dispatched += 1;
                    debug!(uri = %task_uri, execution = ?execution, "indexing task dispatched");
                }
                Err(err) => {
                    summary.dispatch_failures += 1;
                    error!(critical = true, uri = %task_uri, %err, "failed to dispatch indexing task");
                }
            }
            let sent = index + 1;
            if sent % batch_size == 0 && sent < total {
                self.pause();
            }
        }
        Ok(summary)
    }

    /// Fan out into a bounded queue drained by a pool of worker threads that
    /// reconcile each file. Blocks until every queued file is handled.
    pub fn run_pool(&self, uri: &str, generated_by: &[String]) -> Result<IndexSummary, CatalogError> {
        let (sender, receiver) = mpsc::sync_channel::<DispatchTask>(self.settings.queue_depth.max(1));
        let receiver = Mutex::new(receiver);
        let reconciled = AtomicUsize::new(0);
        let failures = AtomicUsize::new(0);

        let dispatch = thread::scope(|scope| {
            for worker in 0..self.settings.workers.max(1) {
                let receiver = &receiver;
                let reconciled = &reconciled;
                let failures = &failures;
                scope.spawn(move || {
                    loop {
                        let next = match receiver.lock() {
                            Ok(guard) => guard.recv(),
                            Err(_) => break,
                        };
                        let Ok(task) = next else { break };
                        match self
                            .reconciler
                            .reconcile_file_with_provenance(&task.uri, &task.generated_by)
                        {
                            Ok(record) => {
                                reconciled.fetch_add(1, Ordering::Relaxed);
                                debug!(worker, uuid = %record.uuid, revision = record.revision(), "file reconciled");
                            }
                            Err(err) => {
                                failures.fetch_add(1, Ordering::Relaxed);
                                error!(worker, uri = %task.uri, %err, "file reconciliation failed");
                            }
                        }
                    }
                });
            }

            let queue = QueueDispatcher { sender };
            self.dispatch(uri, generated_by, &queue)
        })?;

        let mut summary = IndexSummary {
            reconciled: reconciled.into_inner(),
            reconcile_failures: failures.into_inner(),
            dispatch,
        };
        if summary.dispatch.direct {
            summary.reconciled += 1;
        }
        if summary.reconcile_failures > 0 {
            warn!(
                uri,
                failures = summary.reconcile_failures,
                "indexing finished with failures"
            );
        }
        Ok(summary)
    }

    fn pause(&self) {
        let millis = u64::try_from(self.settings.batch_sleep.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return;
        }
        let millis = if self.settings.randomize_sleep {
            rand::rng().random_range(0..=millis)
        } else {
            millis
        };
        debug!(millis, "pausing between dispatch batches");
        thread::sleep(Duration::from_millis(millis));
    }
}

/// Feeds the worker pool; blocks while the queue is full.
struct QueueDispatcher {
    sender: SyncSender<DispatchTask>,
}

impl TaskDispatcher for QueueDispatcher {
    fn send(&self, task: DispatchTask) -> Result<Option<String>, CatalogError> {
        self.sender
            .send(task)
            .map_err(|err| CatalogError::Dispatch(format!("worker queue closed: {}", err.0.uri)))?;
        Ok(None)
    }
}
