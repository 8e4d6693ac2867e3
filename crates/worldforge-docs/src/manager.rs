//! Document identity cache and batched persistence
//!
//! The manager keeps exactly one live instance per document id. Documents
//! report mutations through their change subscription; the manager queues
//! those notifications and a single background worker drains the queue in
//! batches, keeps the newest entry per document, and saves each dirty
//! document under a concurrency cap. A batch closes when it reaches the
//! batch size, when the batch window has elapsed, or as soon as the queue
//! is empty; the window only caps how long a batch fills and never delays
//! a save.
//!
//! A save takes the document's save lock, then captures the projection
//! along with the mutation version it reflects. Saves of one document are
//! therefore serialized and an older state can never overwrite a newer one.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, OnceCell, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use worldforge_common::config::ManagerConfig;
use worldforge_common::{DocumentId, DocumentKind, Error, Result};

use crate::backend::StorageBackend;
use crate::document::{ChangeListener, Document, DocumentContext, DocumentType, ExportSummary};
use crate::registry::DocumentRegistry;

/// A live document plus its save serialization lock
struct CachedDocument {
    doc: Arc<dyn Document>,
    save_lock: AsyncMutex<()>,
}

/// Identity cache entry; initialized exactly once
struct Slot {
    cell: OnceCell<Arc<CachedDocument>>,
}

/// A queued change notification
struct QueuedUpdate {
    id: DocumentId,
    document: Arc<CachedDocument>,
    seq: u64,
    queued_at: Instant,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    deduplicated: AtomicU64,
    batches: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    queue_full: AtomicU64,
    fallback_saves: AtomicU64,
}

/// Snapshot of manager counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub open_documents: usize,
    /// Notifications accepted into the queue
    pub enqueued: u64,
    /// Queued notifications discarded because a newer one was in the same batch
    pub deduplicated: u64,
    /// Batches taken from the queue
    pub batches: u64,
    /// Successful saves
    pub persisted: u64,
    pub persist_failures: u64,
    /// Notifications that found the queue full
    pub queue_full: u64,
    /// Saves performed directly after a queue retry failed
    pub fallback_saves: u64,
}

/// Outcome of flushing dirty documents
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub saved: Vec<DocumentId>,
    pub failed: Vec<DocumentId>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Change subscriber registered on every managed document
struct Intake {
    inner: Weak<Inner>,
}

impl ChangeListener for Intake {
    fn document_changed(&self, id: &DocumentId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.enqueue(id);
        }
    }
}

struct Inner {
    backend: Arc<dyn StorageBackend>,
    context: DocumentContext,
    registry: DocumentRegistry,
    config: ManagerConfig,
    cache: DashMap<DocumentId, Arc<Slot>>,
    saves: Semaphore,
    cancel: CancellationToken,
    accepting: AtomicBool,
    tx: mpsc::Sender<QueuedUpdate>,
    listener: Arc<dyn ChangeListener>,
    runtime: Handle,
    seq: AtomicU64,
    counters: Counters,
}

impl Inner {
    fn cached(&self, id: &DocumentId) -> Option<Arc<CachedDocument>> {
        self.cache.get(id).and_then(|slot| slot.cell.get().cloned())
    }

    fn live_documents(&self) -> Vec<Arc<CachedDocument>> {
        self.cache
            .iter()
            .filter_map(|entry| entry.value().cell.get().cloned())
            .collect()
    }

    /// Load a document from storage, or create and store a new one
    async fn load(&self, id: &DocumentId, kind: DocumentKind) -> Result<Arc<CachedDocument>> {
        let doc = self.registry.create(id.clone(), kind)?;

        match self.backend.get_document(id).await? {
            Some(stored) => {
                if stored.kind != kind {
                    return Err(Error::IdentityConflict {
                        id: id.to_string(),
                        expected: kind,
                        actual: stored.kind,
                    });
                }
                doc.load_projection(&stored.blob);
                doc.on_loaded(&self.context).await?;
                doc.tracker().mark_clean();
                info!("Loaded {kind} document {id} (revision {})", stored.revision);
            }
            None => {
                doc.initialize(&self.context).await?;
                let projection = doc.projection()?;
                self.backend
                    .create_document(id, kind, projection.bytes)
                    .await?;
                doc.tracker().mark_saved(projection.version);
                info!("Created {kind} document {id}");
            }
        }

        doc.tracker().subscribe(Arc::clone(&self.listener));
        Ok(Arc::new(CachedDocument {
            doc,
            save_lock: AsyncMutex::new(()),
        }))
    }

    /// Queue a change notification without blocking the caller
    fn enqueue(self: &Arc<Self>, id: &DocumentId) {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!("Not queueing {id}: shutting down");
            return;
        }
        let Some(document) = self.cached(id) else {
            debug!("Ignoring change for {id}: not open");
            return;
        };

        let update = QueuedUpdate {
            id: id.clone(),
            document,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            queued_at: Instant::now(),
        };
        match self.tx.try_send(update) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(update)) => {
                self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
                warn!("Update queue full, retrying {id} in the background");
                self.spawn_retry(update);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Update queue closed, {id} stays dirty until flushed");
            }
        }
    }

    /// Retry a queue insert; save directly if that fails or is cancelled
    fn spawn_retry(self: &Arc<Self>, update: QueuedUpdate) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let id = update.id.clone();
            let document = Arc::clone(&update.document);
            let wait = inner.config.enqueue_retry_timeout();

            let sent = tokio::select! {
                () = inner.cancel.cancelled() => false,
                sent = tokio::time::timeout(wait, inner.tx.send(update)) => matches!(sent, Ok(Ok(()))),
            };
            if sent {
                inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                return;
            }

            inner.counters.fallback_saves.fetch_add(1, Ordering::Relaxed);
            warn!("Could not queue {id}, saving it directly");
            if let Err(e) = inner.persist(&document).await {
                inner.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                error!("Direct save of {id} failed: {e}");
            }
        });
    }

    /// Save one document if it is dirty. Returns whether anything was written.
    async fn persist(&self, cached: &CachedDocument) -> Result<bool> {
        let _permit = self
            .saves
            .acquire()
            .await
            .map_err(|_| Error::ShuttingDown)?;
        let _guard = cached.save_lock.lock().await;

        let tracker = cached.doc.tracker();
        if !tracker.is_dirty() {
            return Ok(false);
        }
        let projection = cached.doc.projection()?;
        self.backend
            .update_document(cached.doc.id(), projection.bytes)
            .await?;
        tracker.mark_saved(projection.version);
        self.counters.persisted.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Keep the newest notification per document, then save them concurrently
    async fn persist_batch(&self, batch: Vec<QueuedUpdate>) {
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        let received = batch.len();
        let mut latest: HashMap<DocumentId, QueuedUpdate> = HashMap::with_capacity(received);
        for update in batch {
            match latest.entry(update.id.clone()) {
                Entry::Occupied(mut slot) => {
                    if update.seq > slot.get().seq {
                        slot.insert(update);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(update);
                }
            }
        }
        let distinct: Vec<QueuedUpdate> = latest.into_values().collect();
        self.counters
            .deduplicated
            .fetch_add((received - distinct.len()) as u64, Ordering::Relaxed);

        let results = join_all(distinct.iter().map(|u| self.persist(&u.document))).await;

        let mut saved = 0usize;
        for (update, result) in distinct.iter().zip(results) {
            match result {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => {
                    self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Failed to save {} (queued {:?} ago): {e}",
                        update.id,
                        update.queued_at.elapsed()
                    );
                }
            }
        }
        debug!(
            "Saved {saved}/{} documents from {received} queued updates",
            distinct.len()
        );
    }

    /// Save every dirty live document now
    async fn flush_dirty(&self) -> FlushReport {
        let dirty: Vec<_> = self
            .live_documents()
            .into_iter()
            .filter(|cached| cached.doc.is_dirty())
            .collect();

        let results = join_all(dirty.iter().map(|cached| self.persist(cached))).await;

        let mut report = FlushReport::default();
        for (cached, result) in dirty.iter().zip(results) {
            let id = cached.doc.id().clone();
            match result {
                Ok(true) => report.saved.push(id),
                Ok(false) => {}
                Err(e) => {
                    self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Failed to flush {id}: {e}");
                    report.failed.push(id);
                }
            }
        }
        report
    }
}

/// Background batching loop; runs until cancelled, then drains the queue
async fn run_batches(inner: Arc<Inner>, mut rx: mpsc::Receiver<QueuedUpdate>) {
    let batch_size = inner.config.batch_size;
    let window = inner.config.batch_window();

    loop {
        let first = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(update) => update,
                None => break,
            },
        };

        let started = Instant::now();
        let mut batch = Vec::with_capacity(batch_size);
        batch.push(first);
        // flush what is there once the queue runs dry
        while batch.len() < batch_size && started.elapsed() < window {
            match rx.try_recv() {
                Ok(update) => batch.push(update),
                Err(_) => break,
            }
        }
        inner.persist_batch(batch).await;
    }

    rx.close();
    let mut remaining = Vec::new();
    while let Ok(update) = rx.try_recv() {
        remaining.push(update);
    }
    if !remaining.is_empty() {
        info!("Draining {} queued updates", remaining.len());
        inner.persist_batch(remaining).await;
    }
    debug!("Batch worker stopped");
}

/// Identity cache and persistence mediator for all open documents
pub struct DocumentManager {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: OnceCell<FlushReport>,
}

impl DocumentManager {
    /// Create a manager and start its batch worker.
    ///
    /// Must be called from within a tokio runtime; the worker and any queue
    /// retries run on that runtime.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        context: DocumentContext,
        registry: DocumentRegistry,
        config: ManagerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| Error::internal("document manager requires a tokio runtime"))?;
        let (tx, rx) = mpsc::channel(config.queue_capacity);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            backend,
            context,
            registry,
            cache: DashMap::new(),
            saves: Semaphore::new(config.max_concurrent_saves),
            config,
            cancel: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            tx,
            listener: Arc::new(Intake {
                inner: weak.clone(),
            }),
            runtime: runtime.clone(),
            seq: AtomicU64::new(0),
            counters: Counters::default(),
        });

        let worker = runtime.spawn(run_batches(Arc::clone(&inner), rx));
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
            shutdown: OnceCell::new(),
        })
    }

    /// Shared collaborators given to documents
    pub fn context(&self) -> &DocumentContext {
        &self.inner.context
    }

    /// Open a document of a statically known type
    pub async fn get_or_create<T: DocumentType>(&self, id: &DocumentId) -> Result<Arc<T>> {
        let doc = self.get_or_create_dyn(id, T::KIND).await?;
        doc.into_any()
            .downcast::<T>()
            .map_err(|_| Error::internal(format!("document {id} is not a {}", T::KIND)))
    }

    /// Return the live instance for `id`, loading or creating it on first use.
    ///
    /// Concurrent first requests share one load. A cached instance of a
    /// different kind is an `IdentityConflict`; backend failures surface as
    /// `Unavailable`. Once shutdown has begun, including while a load is in
    /// flight, the result is `ShuttingDown`.
    pub async fn get_or_create_dyn(
        &self,
        id: &DocumentId,
        kind: DocumentKind,
    ) -> Result<Arc<dyn Document>> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let slot = self
            .inner
            .cache
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    cell: OnceCell::new(),
                })
            })
            .value()
            .clone();

        let cached = match slot.cell.get_or_try_init(|| self.inner.load(id, kind)).await {
            Ok(cached) => Arc::clone(cached),
            Err(e) => {
                // drop the empty slot unless another caller is still using it
                self.inner.cache.remove_if(id, |_, s| {
                    Arc::ptr_eq(s, &slot) && !s.cell.initialized() && Arc::strong_count(s) == 2
                });
                if !self.inner.accepting.load(Ordering::SeqCst) {
                    return Err(Error::ShuttingDown);
                }
                return Err(match e {
                    e @ (Error::IdentityConflict { .. } | Error::UnknownKind(_)) => e,
                    other => {
                        warn!("Document {id} not available: {other}");
                        Error::unavailable(id.as_str(), &other)
                    }
                });
            }
        };

        // a load that finished after shutdown flushed the cache is never handed out
        if !self.inner.accepting.load(Ordering::SeqCst) {
            cached.doc.tracker().unsubscribe();
            self.inner.cache.remove_if(id, |_, s| Arc::ptr_eq(s, &slot));
            debug!("Discarding {id} loaded during shutdown");
            return Err(Error::ShuttingDown);
        }

        let actual = cached.doc.kind();
        if actual != kind {
            return Err(Error::IdentityConflict {
                id: id.to_string(),
                expected: kind,
                actual,
            });
        }
        Ok(Arc::clone(&cached.doc))
    }

    /// Evict a document, saving it first if dirty. Returns whether it was open.
    ///
    /// A failed final save is logged, not returned.
    pub async fn close_document(&self, id: &DocumentId) -> bool {
        let Some((_, slot)) = self.inner.cache.remove_if(id, |_, s| s.cell.initialized()) else {
            return false;
        };
        let Some(cached) = slot.cell.get().cloned() else {
            return false;
        };

        cached.doc.tracker().unsubscribe();
        if cached.doc.is_dirty() {
            if let Err(e) = self.inner.persist(&cached).await {
                self.inner
                    .counters
                    .persist_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Final save of {id} failed: {e}");
            }
        }
        info!("Closed document {id}");
        true
    }

    /// Save one open document now, reporting failure to the caller
    pub async fn save_document(&self, id: &DocumentId) -> Result<bool> {
        let cached = self
            .inner
            .cached(id)
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;
        self.inner.persist(&cached).await
    }

    /// Save every dirty open document now
    pub async fn flush(&self) -> FlushReport {
        self.inner.flush_dirty().await
    }

    /// Export one open document to the asset archive
    pub async fn export(&self, id: &DocumentId, iteration: u32) -> Result<ExportSummary> {
        let cached = self
            .inner
            .cached(id)
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;
        cached
            .doc
            .export(self.inner.context.archive.as_ref(), iteration)
            .await
    }

    /// Ids of all live documents, sorted
    pub fn open_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<_> = self
            .inner
            .live_documents()
            .iter()
            .map(|cached| cached.doc.id().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_open(&self, id: &DocumentId) -> bool {
        self.inner.cached(id).is_some()
    }

    pub fn stats(&self) -> ManagerStats {
        let counters = &self.inner.counters;
        ManagerStats {
            open_documents: self.inner.live_documents().len(),
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            deduplicated: counters.deduplicated.load(Ordering::Relaxed),
            batches: counters.batches.load(Ordering::Relaxed),
            persisted: counters.persisted.load(Ordering::Relaxed),
            persist_failures: counters.persist_failures.load(Ordering::Relaxed),
            queue_full: counters.queue_full.load(Ordering::Relaxed),
            fallback_saves: counters.fallback_saves.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, drain the queue, save every dirty document and
    /// dispose the backend. Later calls return the first call's report.
    pub async fn shutdown(&self) -> FlushReport {
        self.shutdown
            .get_or_init(|| self.shutdown_inner())
            .await
            .clone()
    }

    async fn shutdown_inner(&self) -> FlushReport {
        let started = Instant::now();
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let limit = self.inner.config.shutdown_timeout();
            match tokio::time::timeout(limit, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Batch worker failed: {e}"),
                Err(_) => warn!("Batch worker did not drain within {limit:?}"),
            }
        }

        let report = self.inner.flush_dirty().await;

        let open = self.inner.live_documents();
        for cached in &open {
            cached.doc.tracker().unsubscribe();
        }
        self.inner.cache.clear();

        if let Err(e) = self.inner.backend.dispose().await {
            warn!("Failed to dispose storage backend: {e}");
        }
        info!(
            "Document manager stopped in {:?}: {} documents closed, {} saved, {} failed",
            started.elapsed(),
            open.len(),
            report.saved.len(),
            report.failed.len()
        );
        report
    }
}

impl Drop for DocumentManager {
    fn drop(&mut self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();
    }
}
