//! Acquisition engine
//!
//! The supervisory component: owns the pending queue, the map of live
//! torrent handles, the peer client (and its replacement when it dies),
//! and the bounded worker pool that drains the queue. Everything here is a
//! single-writer discipline — workers and the cancellation path are the
//! only mutators; the streaming handler just takes snapshots.

use crate::client::{ClientFactory, PeerClient, TorrentHandle};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::layout;
use crate::store::{Store, StoreAdapter};
use crate::types::{Download, DownloadEvent, DownloadPatch, DownloadStatus, ItemDownloadPatch};
use crate::worker;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum number of events to buffer for subscribers
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One entry in the live-torrent map.
///
/// The cancellation token is the external kill switch for the worker; the
/// done token flips when the worker has fully wound down, which is what
/// [`Engine::stop_downloading`] awaits. The handle appears once the peer
/// client has produced one.
#[derive(Clone)]
pub(crate) struct ActiveTorrent {
    pub magnet_url: Option<String>,
    pub handle: Option<Arc<dyn TorrentHandle>>,
    pub cancel: CancellationToken,
    pub done: CancellationToken,
}

/// The download queue and worker supervisor
pub struct Engine {
    config: EngineConfig,
    adapter: StoreAdapter,
    client: RwLock<Arc<dyn PeerClient>>,
    client_factory: ClientFactory,
    /// Cancelled wholesale when the client is torn down; workers holding
    /// the old token requeue instead of failing
    generation: Mutex<CancellationToken>,
    pending: Mutex<Vec<Download>>,
    active: Mutex<HashMap<String, ActiveTorrent>>,
    background: AtomicBool,
    slots: Arc<Semaphore>,
    event_tx: broadcast::Sender<DownloadEvent>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Create a new engine with the given configuration, store and peer
    /// client factory
    pub async fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        client_factory: ClientFactory,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let client = (client_factory)().await?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let engine = Arc::new(Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            adapter: StoreAdapter::new(store),
            client: RwLock::new(client),
            client_factory,
            generation: Mutex::new(CancellationToken::new()),
            pending: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            background: AtomicBool::new(false),
            event_tx,
            shutdown: CancellationToken::new(),
        });

        Self::start_error_supervisor(Arc::clone(&engine));

        Ok(engine)
    }

    /// Watch the peer client's fatal error channel; any message means the
    /// client must be torn down and rebuilt
    fn start_error_supervisor(engine: Arc<Self>) {
        let shutdown = engine.shutdown.clone();
        tokio::spawn(async move {
            loop {
                // re-subscribe each pass so a rebuilt client is picked up
                let mut errors = engine.client().fatal_errors();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = errors.recv() => match received {
                        Ok(message) => engine.rebuild_client(message).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    },
                }
            }
        });
    }

    /// Tear down the broken client, rebuild it, and re-drive every pending
    /// record from the store. Mid-flight handles are considered lost.
    async fn rebuild_client(self: &Arc<Self>, message: String) {
        warn!("Peer client fatal error: {}; rebuilding", message);

        // stop the batch loop from dispatching against the dead client
        self.pending.lock().clear();

        // retire the worker generation: active workers requeue themselves
        let old_generation = {
            let mut generation = self.generation.lock();
            std::mem::replace(&mut *generation, CancellationToken::new())
        };
        old_generation.cancel();

        let entries: Vec<ActiveTorrent> = self.active.lock().values().cloned().collect();
        for entry in entries {
            entry.done.cancelled().await;
        }
        self.active.lock().clear();

        match (self.client_factory)().await {
            Ok(client) => *self.client.write() = client,
            Err(err) => {
                error!("Failed to rebuild peer client: {}", err);
                return;
            }
        }

        match self.adapter.pending_downloads().await {
            Ok(records) => {
                info!("Re-driving {} download(s) after client rebuild", records.len());
                *self.pending.lock() = records;
            }
            Err(err) => warn!("Could not reload pending downloads: {}", err),
        }
        self.start_downloads().await;
    }

    /// Append a download to the queue. No deduplication; callers must not
    /// double-enqueue.
    pub async fn add_download(&self, download: Download) {
        let id = download.id.clone();
        let queue_len = {
            let mut pending = self.pending.lock();
            pending.push(download);
            pending.len()
        };
        debug!("Enqueued download {} (queue length {})", id, queue_len);
        self.emit(DownloadEvent::Queued { id });
    }

    /// Dispatch workers over the current snapshot of the queue, bounded by
    /// `max_concurrent`. No-op while a batch is already running or the
    /// queue is empty. Items enqueued mid-batch are picked up when the
    /// running batch drains.
    pub async fn start_downloads(self: &Arc<Self>) {
        if self.pending.lock().is_empty() {
            return;
        }
        if self.background.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let batch: Vec<Download> = engine.pending.lock().clone();
                if batch.is_empty() {
                    break;
                }
                let mut tasks = Vec::with_capacity(batch.len());
                for download in batch {
                    let engine = Arc::clone(&engine);
                    tasks.push(tokio::spawn(async move {
                        let Ok(_permit) = engine.slots.clone().acquire_owned().await else {
                            return;
                        };
                        // the download may have been stopped or finished
                        // while it waited for a slot
                        if !engine.is_pending(&download.id) {
                            return;
                        }
                        worker::run(Arc::clone(&engine), download).await;
                    }));
                }
                for task in tasks {
                    let _ = task.await;
                }
            }
            engine.background.store(false, Ordering::SeqCst);
        });
    }

    /// Cancel a download. Destroys the live handle if there is one, then
    /// waits for the worker to wind down. Idempotent.
    pub async fn stop_downloading(&self, id: &str) {
        let entry = self.active.lock().get(id).cloned();
        if let Some(entry) = entry {
            if let Some(handle) = &entry.handle {
                handle.destroy().await;
            }
            entry.cancel.cancel();
            entry.done.cancelled().await;
            return;
        }

        // never claimed by a worker: drop it from the queue directly
        if !self.remove_pending(id) {
            return;
        }
        if let Ok(Some(mut download)) = self.adapter.find_download(id).await {
            self.adapter
                .update_download(
                    &mut download,
                    DownloadPatch {
                        status: Some(DownloadStatus::Removed),
                        ..Default::default()
                    },
                )
                .await;
            if let Ok(Some(mut item)) = self.adapter.find_item(&download).await {
                self.adapter
                    .update_item_download(
                        &mut item,
                        ItemDownloadPatch {
                            download_status: Some(DownloadStatus::Removed),
                            downloading: Some(false),
                            ..Default::default()
                        },
                    )
                    .await;
            }
        }
        self.emit(DownloadEvent::Removed { id: id.to_string() });
    }

    /// On process start: reload every record still owed work and start
    /// processing it. Records stuck in connecting/downloading from a prior
    /// crash are re-driven from scratch.
    pub async fn rehydrate_on_start(self: &Arc<Self>) {
        match self.adapter.pending_downloads().await {
            Ok(records) => {
                if records.is_empty() {
                    debug!("No pending downloads to rehydrate");
                    return;
                }
                info!("Rehydrating {} pending download(s)", records.len());
                for download in records {
                    self.add_download(download).await;
                }
                self.start_downloads().await;
            }
            Err(err) => warn!("Could not load pending downloads: {}", err),
        }
    }

    /// Delete the store record, drop the download from the queue, and
    /// remove its directory. Safe to call on unknown ids.
    pub async fn clean_up_download(&self, id: &str) {
        match self.adapter.find_download(id).await {
            Ok(Some(_)) => {
                if let Err(err) = self.adapter.delete_download(id).await {
                    warn!("Could not delete download record {}: {}", id, err);
                }
            }
            Ok(None) => {}
            Err(err) => warn!("Could not look up download {}: {}", id, err),
        }

        {
            let mut pending = self.pending.lock();
            pending.retain(|d| d.id != id);
            debug!("Removed {} from queue ({} remaining)", id, pending.len());
        }

        layout::remove_dir_logged(&self.dir_for(id)).await;
    }

    /// The live torrent handle for an id, if one exists. The streaming
    /// handler uses this to prefer the in-flight torrent over the disk.
    pub fn live_handle(&self, id: &str) -> Option<Arc<dyn TorrentHandle>> {
        self.active.lock().get(id).and_then(|entry| entry.handle.clone())
    }

    /// Subscribe to download events
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    /// Number of downloads still in the queue
    pub fn queue_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of live torrent entries
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The per-download directory under the configured root
    pub fn dir_for(&self, id: &str) -> PathBuf {
        layout::dir_for(&self.config.download_dir, id)
    }

    /// Graceful shutdown: stop supervision and detach every live handle
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let entries: Vec<ActiveTorrent> = self.active.lock().values().cloned().collect();
        for entry in entries {
            if let Some(handle) = &entry.handle {
                handle.destroy().await;
            }
            entry.cancel.cancel();
        }
    }

    // ---- worker support -------------------------------------------------

    pub(crate) fn adapter(&self) -> &StoreAdapter {
        &self.adapter
    }

    pub(crate) fn client(&self) -> Arc<dyn PeerClient> {
        self.client.read().clone()
    }

    pub(crate) fn generation(&self) -> CancellationToken {
        self.generation.lock().clone()
    }

    pub(crate) fn emit(&self, event: DownloadEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Register a claim on a download. Returns false when another live
    /// entry already exists for the id — at most one handle per download.
    pub(crate) fn register_active(
        &self,
        id: &str,
        cancel: CancellationToken,
        done: CancellationToken,
    ) -> bool {
        let mut active = self.active.lock();
        if active.contains_key(id) {
            return false;
        }
        active.insert(
            id.to_string(),
            ActiveTorrent {
                magnet_url: None,
                handle: None,
                cancel,
                done,
            },
        );
        true
    }

    pub(crate) fn attach_handle(
        &self,
        id: &str,
        magnet_url: &str,
        handle: Arc<dyn TorrentHandle>,
    ) {
        if let Some(entry) = self.active.lock().get_mut(id) {
            entry.magnet_url = Some(magnet_url.to_string());
            entry.handle = Some(handle);
        }
    }

    /// Drop the handle from an entry so readers stop seeing it, keeping
    /// the worker's tokens in place
    pub(crate) fn detach_handle(&self, id: &str) {
        if let Some(entry) = self.active.lock().get_mut(id) {
            entry.handle = None;
            entry.magnet_url = None;
        }
    }

    pub(crate) fn unregister_active(&self, id: &str) {
        self.active.lock().remove(id);
    }

    pub(crate) fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().iter().any(|d| d.id == id)
    }

    pub(crate) fn remove_pending(&self, id: &str) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|d| d.id != id);
        before != pending.len()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
