//! Filesystem → index synchronization.
//!
//! The [`Synchronizer`] applies [`ChangeEvent`]s to the [`Store`], one unit
//! of work per path at a time:
//!
//! ```text
//! read bytes ─► hash unchanged? ─► done (no mutation, no notification)
//!        │
//!        ▼
//!      parse ─► ok ─────────────► upsert (retried) ─► IndexEvent ─► queue embedding
//!        │
//!        └─► error ─► previous record?  yes: keep it, record the error
//!                                       no:  commit the lenient record
//! ```
//!
//! Units for the same path are serialized through a lock table; different
//! paths run concurrently. In watch mode events are dispatched to a fixed
//! pool of workers by `hash(path) % workers`, so each path sees its events
//! in arrival order.
//!
//! Embedding runs on a separate queue after the commit; a slow provider
//! delays vectors, never indexing.

use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pmo_index_core::models::{ChangeEvent, ChangeKind, DocType};
use pmo_index_core::parse::{content_hash, parse_bytes, parse_lenient};
use pmo_index_core::store::{DeleteOutcome, Store, UpsertOutcome};

use crate::config::{SyncConfig, WatchConfig};
use crate::embedding::{EmbeddingIndex, EmbeddingQueue};
use crate::scan::{normalize_rel, sweep_events, PathFilter};
use crate::watcher::ChangeDetector;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store operation failed after {attempts} attempts: {source:#}")]
    Store {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("workspace scan failed: {0:#}")]
    Scan(#[source] anyhow::Error),
    #[error("path is not a tracked document: {0}")]
    NotTracked(String),
    #[error("cancelled")]
    Cancelled,
}

/// Per-path unit of work state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathState {
    Idle,
    Parsing,
    Committing,
    /// The last unit hit an I/O or store error. Stays until the next unit
    /// for the path starts. A parse failure that keeps the previous record
    /// is not one: it is recorded as a warning and the path returns to `Idle`.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SyncOutcome {
    Indexed(UpsertOutcome),
    /// Content hash matched; nothing was touched.
    Unchanged,
    /// The file failed to parse; the previous record was kept.
    Retained,
    Removed(DeleteOutcome),
}

/// Broadcast after every committed store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum IndexEvent {
    Upserted {
        path: String,
        doc_type: DocType,
        identifier: String,
    },
    Removed {
        path: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub retained: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub elapsed_ms: u128,
}

pub struct Synchronizer {
    store: Arc<dyn Store>,
    embeddings: Option<EmbeddingQueue>,
    filter: Arc<PathFilter>,
    sync: SyncConfig,
    watch: WatchConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    states: Mutex<HashMap<String, PathState>>,
    events: broadcast::Sender<IndexEvent>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn Store>,
        embeddings: Option<EmbeddingIndex>,
        filter: PathFilter,
        sync: SyncConfig,
        watch: WatchConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(watch.queue_capacity.max(16));
        Self {
            store,
            embeddings: embeddings.map(EmbeddingQueue::new),
            filter: Arc::new(filter),
            sync,
            watch,
            locks: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    pub fn state_of(&self, path: &str) -> PathState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(path).copied())
            .unwrap_or(PathState::Idle)
    }

    fn set_state(&self, path: &str, state: PathState) {
        if let Ok(mut states) = self.states.lock() {
            if state == PathState::Idle {
                states.remove(path);
            } else {
                states.insert(path.to_string(), state);
            }
        }
    }

    fn path_lock(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(path.to_string()).or_default()),
            Err(poisoned) => Arc::clone(poisoned.into_inner().entry(path.to_string()).or_default()),
        }
    }

    fn prune_lock(&self, path: &str) {
        if let Ok(mut locks) = self.locks.lock() {
            if locks.get(path).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(path);
            }
        }
    }

    /// Run `unit` while holding the lock for `path`.
    async fn serialized<T, F, Fut>(&self, path: &str, unit: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.path_lock(path);
        let result = {
            let _guard = lock.lock().await;
            unit().await
        };
        drop(lock);
        self.prune_lock(path);
        result
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.sync.store_retries => {
                    let delay = Duration::from_millis(self.sync.retry_backoff_ms << attempt.min(10));
                    warn!(op, attempt = attempt + 1, error = %e, "store operation failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(SyncError::Store {
                        attempts: attempt + 1,
                        source: e,
                    })
                }
            }
        }
    }

    /// Apply one change event.
    pub async fn apply_event(&self, event: &ChangeEvent) -> Result<SyncOutcome, SyncError> {
        match &event.kind {
            ChangeKind::Created | ChangeKind::Modified => self.index_path(&event.path).await,
            ChangeKind::Deleted => self.remove_path(&event.path).await,
            ChangeKind::Renamed { from } => {
                self.remove_path(from).await?;
                self.index_path(&event.path).await
            }
        }
    }

    async fn index_path(&self, path: &str) -> Result<SyncOutcome, SyncError> {
        self.serialized(path, || self.index_locked(path)).await
    }

    async fn remove_path(&self, path: &str) -> Result<SyncOutcome, SyncError> {
        self.serialized(path, || self.remove_locked(path)).await
    }

    async fn index_locked(&self, path: &str) -> Result<SyncOutcome, SyncError> {
        self.set_state(path, PathState::Parsing);
        let result = self.index_unit(path).await;
        match &result {
            Ok(_) => self.set_state(path, PathState::Idle),
            Err(_) => self.set_state(path, PathState::Failed),
        }
        result
    }

    async fn index_unit(&self, path: &str) -> Result<SyncOutcome, SyncError> {
        let abs = self.filter.absolute(path);
        let bytes = match tokio::fs::read(&abs).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path, "file vanished before indexing");
                return self.remove_unit(path).await;
            }
            Err(source) => {
                return Err(SyncError::Io {
                    path: path.to_string(),
                    source,
                })
            }
        };

        let hash = content_hash(&bytes);
        let previous = self
            .with_retry("content_hash", || self.store.content_hash(path))
            .await?;
        if previous.as_deref() == Some(hash.as_str()) {
            debug!(path, "content unchanged");
            return Ok(SyncOutcome::Unchanged);
        }

        let doc_type = DocType::from_path(path);
        let doc = match parse_bytes(&bytes, doc_type, path) {
            Ok(doc) => doc,
            Err(err) if previous.is_some() => {
                warn!(path, error = %err, "parse failed, keeping previous record");
                let diagnostic = err.to_diagnostic();
                self.with_retry("record_error", || self.store.record_error(path, &diagnostic))
                    .await?;
                return Ok(SyncOutcome::Retained);
            }
            Err(err) => {
                warn!(path, error = %err, "parse failed, indexing body only");
                parse_lenient(&bytes, doc_type, path)
            }
        };

        self.set_state(path, PathState::Committing);
        let outcome = self.with_retry("upsert", || self.store.upsert(&doc)).await?;
        if let Some(conflict) = &outcome.conflict {
            warn!(
                path,
                identifier = %conflict.identifier,
                owner = %conflict.owner_path,
                "identifier collision"
            );
        }
        debug!(path, identifier = %doc.identifier, "indexed");
        let _ = self.events.send(IndexEvent::Upserted {
            path: doc.path.clone(),
            doc_type: doc.doc_type,
            identifier: doc.identifier.clone(),
        });

        if let Some(embeddings) = &self.embeddings {
            if let Some(promoted) = &outcome.promoted {
                embeddings.refresh(promoted);
            }
            if outcome.owns_identifier {
                embeddings.upsert(doc);
            } else {
                embeddings.remove(path);
            }
        }

        Ok(SyncOutcome::Indexed(outcome))
    }

    async fn remove_locked(&self, path: &str) -> Result<SyncOutcome, SyncError> {
        self.set_state(path, PathState::Committing);
        let result = self.remove_unit(path).await;
        match &result {
            Ok(_) => self.set_state(path, PathState::Idle),
            Err(_) => self.set_state(path, PathState::Failed),
        }
        result
    }

    async fn remove_unit(&self, path: &str) -> Result<SyncOutcome, SyncError> {
        let outcome = self.with_retry("delete", || self.store.delete(path)).await?;
        if outcome.existed {
            debug!(path, "removed");
            let _ = self.events.send(IndexEvent::Removed {
                path: path.to_string(),
            });
        }
        if let Some(embeddings) = &self.embeddings {
            // Orders after any vector job still queued for this path.
            embeddings.remove(path);
            if let Some(promoted) = &outcome.promoted {
                embeddings.refresh(promoted);
            }
        }
        Ok(SyncOutcome::Removed(outcome))
    }

    /// Wait until queued embedding work has finished. Returns at once when
    /// embeddings are disabled.
    pub async fn embeddings_idle(&self) {
        if let Some(embeddings) = &self.embeddings {
            embeddings.wait_idle().await;
        }
    }

    fn tracked_path(&self, path: &str) -> Result<String, SyncError> {
        let rel = normalize_rel(path).ok_or_else(|| SyncError::NotTracked(path.to_string()))?;
        if !self.filter.accepts(&rel) {
            return Err(SyncError::NotTracked(rel));
        }
        Ok(rel)
    }

    /// Re-index `path` now, after a write made outside the watcher's view.
    ///
    /// The watcher event for the same write arrives later and is a no-op.
    pub async fn notify_external_write(&self, path: &str) -> Result<SyncOutcome, SyncError> {
        let rel = self.tracked_path(path)?;
        self.index_path(&rel).await
    }

    /// Replace the content of `path` atomically and re-index it.
    ///
    /// The new content goes to a temporary file in the same directory that
    /// is then renamed over the target. With `backup`, the previous content
    /// is kept at `<file>.bak`.
    pub async fn apply_patch(
        &self,
        path: &str,
        content: &str,
        backup: bool,
    ) -> Result<SyncOutcome, SyncError> {
        let rel = self.tracked_path(path)?;
        let abs = self.filter.absolute(&rel);
        self.serialized(&rel, || async {
            write_atomic(&abs, content.as_bytes(), backup)
                .await
                .map_err(|source| SyncError::Io {
                    path: rel.clone(),
                    source,
                })?;
            info!(path = %rel, backup, "patch applied");
            self.index_locked(&rel).await
        })
        .await
    }

    /// Bring the index in line with disk: every file is (re)indexed in path
    /// order and indexed paths missing on disk are removed.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<ReconcileReport, SyncError> {
        let started = Instant::now();
        let indexed = self.with_retry("paths", || self.store.paths()).await?;
        let filter = Arc::clone(&self.filter);
        let events = tokio::task::spawn_blocking(move || sweep_events(&filter, &indexed))
            .await
            .map_err(|e| SyncError::Scan(e.into()))?
            .map_err(SyncError::Scan)?;

        let mut report = ReconcileReport::default();
        for event in &events {
            if cancel.is_cancelled() {
                info!(processed = report.scanned, "reconcile cancelled");
                return Err(SyncError::Cancelled);
            }
            report.scanned += 1;
            match self.apply_event(event).await {
                Ok(SyncOutcome::Indexed(outcome)) => {
                    report.indexed += 1;
                    if outcome.conflict.is_some() {
                        report.conflicts += 1;
                    }
                }
                Ok(SyncOutcome::Unchanged) => report.unchanged += 1,
                Ok(SyncOutcome::Retained) => report.retained += 1,
                Ok(SyncOutcome::Removed(_)) => report.removed += 1,
                Err(e @ SyncError::Store { .. }) => return Err(e),
                Err(e) => {
                    warn!(path = %event.path, error = %e, "reconcile skipped path");
                    report.failed += 1;
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis();
        info!(
            scanned = report.scanned,
            indexed = report.indexed,
            removed = report.removed,
            unchanged = report.unchanged,
            "reconcile complete"
        );
        Ok(report)
    }

    /// Reconcile, then follow live filesystem changes until `cancel` fires.
    /// In-flight units finish before this returns.
    pub async fn watch(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        match self.reconcile(&cancel).await {
            Ok(_) => {}
            Err(SyncError::Cancelled) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let capacity = self.watch.queue_capacity;
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(capacity);
        let detector = ChangeDetector::new(Arc::clone(&self.filter), Arc::clone(&self.store), &self.watch);
        let detector = tokio::spawn(detector.run(tx, cancel.clone()));

        let mut senders = Vec::with_capacity(self.watch.workers);
        let mut workers = Vec::with_capacity(self.watch.workers);
        for id in 0..self.watch.workers {
            let (wtx, mut wrx) = mpsc::channel::<ChangeEvent>(capacity);
            let sync = Arc::clone(&self);
            workers.push(tokio::spawn(async move {
                while let Some(event) = wrx.recv().await {
                    match sync.apply_event(&event).await {
                        Ok(outcome) => debug!(worker = id, path = %event.path, ?outcome, "applied"),
                        Err(e) => warn!(worker = id, path = %event.path, error = %e, "sync failed"),
                    }
                }
            }));
            senders.push(wtx);
        }

        while let Some(event) = rx.recv().await {
            let worker = worker_for(&event.path, senders.len());
            if senders[worker].send(event).await.is_err() {
                warn!(worker, "worker stopped unexpectedly");
                break;
            }
        }

        drop(senders);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker task failed");
            }
        }
        detector.await??;
        Ok(())
    }
}

fn worker_for(path: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

async fn write_atomic(target: &Path, content: &[u8], backup: bool) -> std::io::Result<()> {
    let parent = target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&parent).await?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if backup && tokio::fs::try_exists(target).await? {
        tokio::fs::copy(target, parent.join(format!("{}.bak", file_name))).await?;
    }

    let tmp = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));
    {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
    }
    if let Err(e) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
