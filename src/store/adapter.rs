//! Store adapter
//!
//! The write side of the engine's persistence. All mutation goes through
//! the merge operations here, which stamp `updated_at`, serialize writes to
//! the same record, and treat persistence failures as lost telemetry: the
//! merged in-memory record is returned either way, and the caller carries
//! on. Losing one progress write must never abort a download.

use super::Store;
use crate::error::Result;
use crate::types::{
    now_millis, CatalogItem, Download, DownloadPatch, ItemDownloadPatch, ItemKind,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Typed CRUD plus merge-update over the three catalog collections
pub struct StoreAdapter {
    store: Arc<dyn Store>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StoreAdapter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The per-record write lock, created on first use
    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn find_download(&self, id: &str) -> Result<Option<Download>> {
        self.store.find_download(id).await
    }

    pub async fn pending_downloads(&self) -> Result<Vec<Download>> {
        self.store.pending_downloads().await
    }

    /// Route to the movies or episodes collection by the download's kind
    pub async fn find_item(&self, download: &Download) -> Result<Option<CatalogItem>> {
        match download.item_kind {
            ItemKind::Movie => Ok(self
                .store
                .find_movie(&download.id)
                .await?
                .map(CatalogItem::Movie)),
            ItemKind::Episode => Ok(self
                .store
                .find_episode(&download.id)
                .await?
                .map(CatalogItem::Episode)),
        }
    }

    /// Merge a patch into a download record and persist it.
    ///
    /// Always stamps `updated_at`. Persistence is best effort: on store
    /// failure the merged record stays authoritative in memory and the
    /// error is only logged.
    pub async fn update_download(&self, download: &mut Download, patch: DownloadPatch) {
        let lock = self.lock_for(&download.id);
        let _guard = lock.lock().await;

        patch.apply(download);
        download.updated_at = now_millis();

        if let Err(err) = self.store.save_download(download).await {
            warn!("Failed to persist download {}: {}", download.id, err);
        }
    }

    /// Merge a patch into an item's `download` sub-document and persist the
    /// item. Merging only touches the sub-document; the rest of the catalog
    /// record is untouched. Same best-effort policy as
    /// [`update_download`](Self::update_download).
    pub async fn update_item_download(&self, item: &mut CatalogItem, patch: ItemDownloadPatch) {
        let lock = self.lock_for(item.id());
        let _guard = lock.lock().await;

        patch.apply(&mut item.doc_mut().download);

        let result = match item {
            CatalogItem::Movie(doc) => self.store.save_movie(doc).await,
            CatalogItem::Episode(doc) => self.store.save_episode(doc).await,
        };
        if let Err(err) = result {
            warn!("Failed to persist item {}: {}", item.id(), err);
        }
    }

    /// Hard-delete a download record
    pub async fn delete_download(&self, id: &str) -> Result<()> {
        self.store.delete_download(id).await
    }
}
