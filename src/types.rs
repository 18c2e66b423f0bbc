//! Core types for reelvault
//!
//! This module contains the persisted record types shared with the catalog
//! (downloads, movies, episodes) and the patch types the store adapter
//! merges into them.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current epoch time in milliseconds, the timestamp unit of the catalog.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Round a progress percentage to one decimal place.
pub fn round_progress(progress: f64) -> f64 {
    (progress * 10.0).round() / 10.0
}

/// Which catalog collection a download belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Movie,
    Episode,
}

/// Whether the user asked for background acquisition or on-demand streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Download,
    Stream,
}

/// Lifecycle state of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Waiting for a worker slot
    Queued,
    /// A torrent has been handed to the peer client, no bytes yet
    Connecting,
    /// Receiving pieces from the swarm
    Downloading,
    /// Payload fully acquired and verified
    Complete,
    /// Terminal failure (missing magnet, dead swarm, client error)
    Failed,
    /// Cancelled by the operator
    Removed,
}

impl DownloadStatus {
    /// States the queue considers outstanding work
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::Connecting | Self::Downloading)
    }

    /// States with (or about to have) a live torrent handle
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Downloading)
    }

    /// States a download never leaves
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Removed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Connecting => "connecting",
            Self::Downloading => "downloading",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "connecting" => Ok(Self::Connecting),
            "downloading" => Ok(Self::Downloading),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "removed" => Ok(Self::Removed),
            other => Err(format!("Invalid download status: {}", other)),
        }
    }
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Episode => "episode",
        }
    }
}

impl std::str::FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "movie" => Ok(Self::Movie),
            "episode" => Ok(Self::Episode),
            other => Err(format!("Invalid item kind: {}", other)),
        }
    }
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Stream => "stream",
        }
    }
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "download" => Ok(Self::Download),
            "stream" => Ok(Self::Stream),
            other => Err(format!("Invalid delivery mode: {}", other)),
        }
    }
}

/// One requested acquisition, persisted in the `Downloads` collection.
///
/// The id is shared with the parent movie or episode record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub id: String,
    #[serde(rename = "itemType")]
    pub item_kind: ItemKind,
    pub quality: String,
    #[serde(rename = "type")]
    pub mode: DeliveryMode,
    pub status: DownloadStatus,
    /// Percent complete, 0–100, one decimal
    #[serde(default)]
    pub progress: f64,
    /// Bytes per second, None when not active
    #[serde(default)]
    pub speed: Option<u64>,
    /// Milliseconds, None when not active
    #[serde(default)]
    pub time_remaining: Option<u64>,
    #[serde(default)]
    pub num_peers: Option<u32>,
    /// Epoch milliseconds of the last write
    #[serde(default)]
    pub updated_at: i64,
}

/// One available magnet on a catalog item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentSource {
    pub quality: String,
    pub url: String,
    #[serde(default)]
    pub seeds: u32,
    #[serde(default)]
    pub peers: u32,
    #[serde(default)]
    pub size: Option<u64>,
}

/// The `download` sub-document embedded in a movie or episode record.
///
/// Mirrors the state of the corresponding [`Download`] so catalog readers
/// never have to join against the downloads collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDownload {
    #[serde(default)]
    pub download_status: Option<DownloadStatus>,
    #[serde(default)]
    pub downloading: bool,
    #[serde(default)]
    pub download_complete: bool,
    /// Epoch milliseconds at completion
    #[serde(default)]
    pub downloaded_on: Option<i64>,
}

/// A movie or episode document.
///
/// The engine only interprets `id`, `torrents` and `download`; everything
/// else the catalog put on the record rides along untouched in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDoc {
    pub id: String,
    #[serde(default)]
    pub torrents: Vec<TorrentSource>,
    #[serde(default)]
    pub download: ItemDownload,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ItemDoc {
    /// Create a bare document with no torrents (mostly for tests)
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            torrents: Vec::new(),
            download: ItemDownload::default(),
            extra: serde_json::Map::new(),
        }
    }
}

/// A catalog item routed by collection
#[derive(Debug, Clone)]
pub enum CatalogItem {
    Movie(ItemDoc),
    Episode(ItemDoc),
}

impl CatalogItem {
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::Movie(_) => ItemKind::Movie,
            Self::Episode(_) => ItemKind::Episode,
        }
    }

    pub fn doc(&self) -> &ItemDoc {
        match self {
            Self::Movie(doc) | Self::Episode(doc) => doc,
        }
    }

    pub fn doc_mut(&mut self) -> &mut ItemDoc {
        match self {
            Self::Movie(doc) | Self::Episode(doc) => doc,
        }
    }

    pub fn id(&self) -> &str {
        &self.doc().id
    }

    /// Exact-match lookup of a magnet by quality label
    pub fn torrent_for_quality(&self, quality: &str) -> Option<&TorrentSource> {
        self.doc().torrents.iter().find(|t| t.quality == quality)
    }
}

/// Field-wise patch merged into a [`Download`] by the store adapter.
///
/// Nullable fields use a double `Option` so "set to null" and "leave
/// unchanged" are both expressible.
#[derive(Debug, Clone, Default)]
pub struct DownloadPatch {
    pub status: Option<DownloadStatus>,
    pub progress: Option<f64>,
    pub speed: Option<Option<u64>>,
    pub time_remaining: Option<Option<u64>>,
    pub num_peers: Option<Option<u32>>,
}

impl DownloadPatch {
    /// Apply the patch to a record in memory. Does not touch `updated_at`;
    /// the adapter stamps that on every write.
    pub fn apply(&self, download: &mut Download) {
        if let Some(status) = self.status {
            download.status = status;
        }
        if let Some(progress) = self.progress {
            download.progress = round_progress(progress);
        }
        if let Some(speed) = self.speed {
            download.speed = speed;
        }
        if let Some(time_remaining) = self.time_remaining {
            download.time_remaining = time_remaining;
        }
        if let Some(num_peers) = self.num_peers {
            download.num_peers = num_peers;
        }
    }
}

/// Field-wise patch merged into an item's `download` sub-document.
///
/// Merging never replaces the sub-document wholesale: fields absent from
/// the patch keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ItemDownloadPatch {
    pub download_status: Option<DownloadStatus>,
    pub downloading: Option<bool>,
    pub download_complete: Option<bool>,
    pub downloaded_on: Option<Option<i64>>,
}

impl ItemDownloadPatch {
    pub fn apply(&self, download: &mut ItemDownload) {
        if let Some(status) = self.download_status {
            download.download_status = Some(status);
        }
        if let Some(downloading) = self.downloading {
            download.downloading = downloading;
        }
        if let Some(complete) = self.download_complete {
            download.download_complete = complete;
        }
        if let Some(on) = self.downloaded_on {
            download.downloaded_on = on;
        }
    }
}

/// Events emitted by the engine so callers can observe downloads without
/// polling the store
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// Download was appended to the queue
    Queued { id: String },
    /// A worker claimed the download and handed it to the peer client
    Started { id: String },
    /// A coalesced progress update was persisted
    Progress {
        id: String,
        progress: f64,
        num_peers: Option<u32>,
    },
    /// Download finished and its files remain on disk
    Completed { id: String },
    /// Download failed terminally
    Failed { id: String, reason: String },
    /// Download was cancelled by the operator
    Removed { id: String },
}
