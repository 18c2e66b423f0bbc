//! Peer client facade
//!
//! A thin seam over the BitTorrent implementation. The engine only ever
//! talks to these traits: workers consume the typed event stream of a
//! handle, the streaming handler asks a handle for byte ranges, and the
//! supervisor watches the client-wide fatal error channel so it can tear
//! the client down and rebuild it.

pub mod rqbit;

pub use rqbit::RqbitClient;

use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, mpsc};

/// Boxed byte reader handed to the HTTP response body
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Where a no-peers report came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    /// The distributed hash table — an empty DHT means the swarm is dead
    Dht,
    /// A tracker; informational only
    Tracker,
    /// Local peer discovery; informational only
    Local,
}

/// Events a torrent handle delivers to its worker
#[derive(Debug, Clone)]
pub enum TorrentEvent {
    /// A peer source came up empty. Fatal only when the source is the DHT.
    NoPeers { source: PeerSource },
    /// Progress tick; the worker coalesces these before persisting
    Progress {
        /// Percent complete, 0–100
        progress: f64,
        /// Bytes per second
        speed: u64,
        /// Estimated milliseconds remaining
        time_remaining: Option<u64>,
        num_peers: u32,
    },
    /// Payload fully acquired and verified
    Done,
    /// Fatal for this handle
    Error(String),
}

/// The file a handle selected as its payload
#[derive(Debug, Clone)]
pub struct ChosenFile {
    /// Index within the torrent's file list
    pub index: usize,
    /// Path relative to the download directory
    pub path: PathBuf,
    pub length: u64,
}

/// One active participation in a swarm
#[async_trait]
pub trait TorrentHandle: Send + Sync {
    /// Take the event stream. Yields `Some` exactly once; the worker owns
    /// the receiver for the handle's lifetime.
    fn take_events(&self) -> Option<mpsc::Receiver<TorrentEvent>>;

    /// The selected payload file, once metadata is known
    fn chosen_file(&self) -> Option<ChosenFile>;

    /// Open a read stream over `[start, end]` of the chosen file. The
    /// implementation prioritizes those bytes in swarm scheduling.
    async fn read_range(&self, start: u64, end: u64) -> Result<ByteReader>;

    /// Detach from the swarm and stop emitting events. Idempotent.
    async fn destroy(&self);
}

/// The peer-to-peer client owning all swarm participation
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Join the swarm behind a magnet URI, writing payload into
    /// `target_dir`. Resolves once metadata is received and the payload
    /// file has been selected.
    async fn add(&self, magnet_uri: &str, target_dir: &Path) -> Result<Arc<dyn TorrentHandle>>;

    /// Detach from a swarm previously joined with [`add`](Self::add).
    /// Safe to call after the handle finished or failed.
    async fn remove(&self, magnet_uri: &str) -> Result<()>;

    /// Client-wide fatal errors. Any message means the client is broken
    /// and must be rebuilt; outstanding handles are lost.
    fn fatal_errors(&self) -> broadcast::Receiver<String>;
}

/// Future returned by a [`ClientFactory`]
pub type ClientFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn PeerClient>>> + Send>>;

/// Builds (and rebuilds) the peer client. Owned by the engine supervisor
/// so recovery from a fatal client error is not a worker concern.
pub type ClientFactory = Arc<dyn Fn() -> ClientFuture + Send + Sync>;
