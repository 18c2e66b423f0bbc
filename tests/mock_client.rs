//! Scripted mock peer client
//!
//! Stands in for the BitTorrent stack in integration tests. Each `add`
//! consumes the next script for that magnet and replays it on the handle's
//! event channel with small delays; a magnet without a script stalls with
//! the channel held open, which is how tests model a swarm that never
//! finishes. The client records adds and removes and tracks how many
//! handles were ever live at once.

// compiled both standalone and as a module of each integration test crate
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use reelvault::client::{ByteReader, ChosenFile, PeerClient, TorrentEvent, TorrentHandle};
use reelvault::error::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Delay between scripted events, enough for the worker to interleave
const EVENT_DELAY: Duration = Duration::from_millis(10);

pub struct MockPeerClient {
    /// magnet URI → queue of scripts, one consumed per `add`
    scripts: Mutex<HashMap<String, VecDeque<Vec<TorrentEvent>>>>,
    /// bytes served by every handle's `read_range`
    content: Mutex<Vec<u8>>,
    added: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    live: Arc<Mutex<HashSet<String>>>,
    max_live: AtomicUsize,
    fatal_tx: broadcast::Sender<String>,
}

impl MockPeerClient {
    pub fn new() -> Arc<Self> {
        let (fatal_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            content: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            live: Arc::new(Mutex::new(HashSet::new())),
            max_live: AtomicUsize::new(0),
            fatal_tx,
        })
    }

    /// Queue a script for the next `add` of this magnet
    pub fn script(&self, magnet: &str, events: Vec<TorrentEvent>) {
        self.scripts
            .lock()
            .entry(magnet.to_string())
            .or_default()
            .push_back(events);
    }

    /// Bytes every handle serves for range reads
    pub fn set_content(&self, bytes: Vec<u8>) {
        *self.content.lock() = bytes;
    }

    /// Magnets handed to `add`, in call order
    pub fn added(&self) -> Vec<String> {
        self.added.lock().clone()
    }

    pub fn removed_count(&self, magnet: &str) -> usize {
        self.removed.lock().iter().filter(|m| *m == magnet).count()
    }

    /// The highest number of simultaneously live handles observed
    pub fn max_live_seen(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Simulate a client-wide fatal error
    pub fn inject_fatal(&self, message: &str) {
        let _ = self.fatal_tx.send(message.to_string());
    }

    fn mark_live(&self, magnet: &str) {
        let mut live = self.live.lock();
        live.insert(magnet.to_string());
        self.max_live.fetch_max(live.len(), Ordering::SeqCst);
    }

    fn mark_gone(&self, magnet: &str) {
        self.live.lock().remove(magnet);
    }
}

#[async_trait]
impl PeerClient for MockPeerClient {
    async fn add(&self, magnet_uri: &str, _target_dir: &Path) -> Result<Arc<dyn TorrentHandle>> {
        self.added.lock().push(magnet_uri.to_string());
        self.mark_live(magnet_uri);

        let script = self
            .scripts
            .lock()
            .get_mut(magnet_uri)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(16);
        let replay_tx = tx.clone();
        tokio::spawn(async move {
            for event in script {
                tokio::time::sleep(EVENT_DELAY).await;
                if replay_tx.send(event).await.is_err() {
                    return;
                }
            }
            // channel stays open through the handle's keeper sender
        });

        let content = self.content.lock().clone();
        Ok(Arc::new(MockHandle {
            magnet: magnet_uri.to_string(),
            length: content.len() as u64,
            content,
            events: Mutex::new(Some(rx)),
            live: Arc::clone(&self.live),
            _keep: tx,
        }))
    }

    async fn remove(&self, magnet_uri: &str) -> Result<()> {
        self.removed.lock().push(magnet_uri.to_string());
        self.mark_gone(magnet_uri);
        Ok(())
    }

    fn fatal_errors(&self) -> broadcast::Receiver<String> {
        self.fatal_tx.subscribe()
    }
}

pub struct MockHandle {
    magnet: String,
    content: Vec<u8>,
    length: u64,
    events: Mutex<Option<mpsc::Receiver<TorrentEvent>>>,
    live: Arc<Mutex<HashSet<String>>>,
    /// keeps the event channel open when a script runs dry
    _keep: mpsc::Sender<TorrentEvent>,
}

#[async_trait]
impl TorrentHandle for MockHandle {
    fn take_events(&self) -> Option<mpsc::Receiver<TorrentEvent>> {
        self.events.lock().take()
    }

    fn chosen_file(&self) -> Option<ChosenFile> {
        Some(ChosenFile {
            index: 0,
            path: PathBuf::from("movie.mp4"),
            length: self.length,
        })
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<ByteReader> {
        let content = &self.content;
        let start = (start as usize).min(content.len());
        let end = ((end + 1) as usize).clamp(start, content.len());
        let slice = content[start..end].to_vec();
        Ok(Box::pin(std::io::Cursor::new(slice)))
    }

    async fn destroy(&self) {
        self.live.lock().remove(&self.magnet);
    }
}

/// Shorthand for a progress tick
pub fn progress(percent: f64) -> TorrentEvent {
    TorrentEvent::Progress {
        progress: percent,
        speed: 1_000_000,
        time_remaining: Some(30_000),
        num_peers: 4,
    }
}
