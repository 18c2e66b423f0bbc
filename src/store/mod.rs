//! Catalog store
//!
//! Persistence for the three collections the engine touches: downloads,
//! movies and episodes. The trait keeps the engine independent of the
//! backend; [`SqliteStore`] is the production implementation and
//! [`MemoryStore`] backs the tests.

pub mod adapter;
pub mod sqlite;

pub use adapter::StoreAdapter;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::{Download, ItemDoc};
use async_trait::async_trait;

/// Storage trait over the catalog collections
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a download record
    async fn save_download(&self, download: &Download) -> Result<()>;

    /// Load a download by id
    async fn find_download(&self, id: &str) -> Result<Option<Download>>;

    /// Load every download still owed work (queued, connecting or
    /// downloading), in insertion order
    async fn pending_downloads(&self) -> Result<Vec<Download>>;

    /// Hard-delete a download record
    async fn delete_download(&self, id: &str) -> Result<()>;

    /// Load a movie document by id
    async fn find_movie(&self, id: &str) -> Result<Option<ItemDoc>>;

    /// Insert or update a movie document
    async fn save_movie(&self, doc: &ItemDoc) -> Result<()>;

    /// Load an episode document by id
    async fn find_episode(&self, id: &str) -> Result<Option<ItemDoc>>;

    /// Insert or update an episode document
    async fn save_episode(&self, doc: &ItemDoc) -> Result<()>;
}

/// In-memory store for testing.
///
/// Downloads keep insertion order so queue rehydration behaves like the
/// SQLite backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    downloads: parking_lot::RwLock<Vec<Download>>,
    movies: parking_lot::RwLock<std::collections::HashMap<String, ItemDoc>>,
    episodes: parking_lot::RwLock<std::collections::HashMap<String, ItemDoc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_download(&self, download: &Download) -> Result<()> {
        let mut downloads = self.downloads.write();
        match downloads.iter_mut().find(|d| d.id == download.id) {
            Some(existing) => *existing = download.clone(),
            None => downloads.push(download.clone()),
        }
        Ok(())
    }

    async fn find_download(&self, id: &str) -> Result<Option<Download>> {
        Ok(self.downloads.read().iter().find(|d| d.id == id).cloned())
    }

    async fn pending_downloads(&self) -> Result<Vec<Download>> {
        Ok(self
            .downloads
            .read()
            .iter()
            .filter(|d| d.status.is_pending())
            .cloned()
            .collect())
    }

    async fn delete_download(&self, id: &str) -> Result<()> {
        self.downloads.write().retain(|d| d.id != id);
        Ok(())
    }

    async fn find_movie(&self, id: &str) -> Result<Option<ItemDoc>> {
        Ok(self.movies.read().get(id).cloned())
    }

    async fn save_movie(&self, doc: &ItemDoc) -> Result<()> {
        self.movies.write().insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn find_episode(&self, id: &str) -> Result<Option<ItemDoc>> {
        Ok(self.episodes.read().get(id).cloned())
    }

    async fn save_episode(&self, doc: &ItemDoc) -> Result<()> {
        self.episodes.write().insert(doc.id.clone(), doc.clone());
        Ok(())
    }
}
