//! librqbit-backed peer client
//!
//! Wraps a [`librqbit::Session`]. librqbit exposes polling-style stats
//! rather than callbacks, so each handle runs a small poll task that
//! translates the stats snapshots into the typed event stream the worker
//! consumes: progress ticks while bytes arrive, `Done` when the torrent
//! verifies complete, `Error` when the session reports one, and a
//! synthesized DHT no-peers report when the swarm stays empty past the
//! configured window.

use super::{ByteReader, ChosenFile, PeerClient, PeerSource, TorrentEvent, TorrentHandle};
use crate::error::{EngineError, Result};
use crate::media;
use async_trait::async_trait;
use librqbit::api::TorrentIdOrHash;
use librqbit::{AddTorrent, AddTorrentOptions, ManagedTorrent, Session};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// How often handle stats are sampled for the event stream
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Event channel depth per handle; the worker drains faster than the poll
/// task fills, so this never matters in practice
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Peer client over a shared librqbit session
pub struct RqbitClient {
    session: Arc<Session>,
    fatal_tx: broadcast::Sender<String>,
    /// magnet URI → torrent id, for `remove` after the handle is gone
    torrents: Mutex<HashMap<String, usize>>,
    no_peers_timeout: Duration,
}

impl RqbitClient {
    /// Create a client with its session rooted at `session_root`.
    ///
    /// Per-download output folders are passed in [`add`](PeerClient::add);
    /// the session root only holds librqbit's own state.
    pub async fn new(session_root: PathBuf, no_peers_timeout: Duration) -> Result<Arc<Self>> {
        let session = Session::new(session_root)
            .await
            .map_err(|err| EngineError::client(format!("failed to start session: {err:#}")))?;
        let (fatal_tx, _) = broadcast::channel(16);

        Ok(Arc::new(Self {
            session,
            fatal_tx,
            torrents: Mutex::new(HashMap::new()),
            no_peers_timeout,
        }))
    }
}

#[async_trait]
impl PeerClient for RqbitClient {
    async fn add(&self, magnet_uri: &str, target_dir: &Path) -> Result<Arc<dyn TorrentHandle>> {
        let options = AddTorrentOptions {
            output_folder: Some(target_dir.to_string_lossy().into_owned()),
            overwrite: true,
            ..Default::default()
        };

        let response = self
            .session
            .add_torrent(AddTorrent::from_url(magnet_uri), Some(options))
            .await
            .map_err(|err| EngineError::client(format!("add_torrent failed: {err:#}")))?;

        let handle = response
            .into_handle()
            .ok_or_else(|| EngineError::client("add_torrent returned no handle"))?;

        handle
            .wait_until_initialized()
            .await
            .map_err(|err| EngineError::client(format!("torrent initialization failed: {err:#}")))?;

        let chosen = select_payload_file(&handle)?;
        let only: HashSet<usize> = [chosen.index].into_iter().collect();
        if let Err(err) = self.session.update_only_files(&handle, &only).await {
            warn!(
                "Could not narrow file selection for {}: {err:#}",
                magnet_uri
            );
        }

        self.torrents
            .lock()
            .insert(magnet_uri.to_string(), handle.id());

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let poll_task = tokio::spawn(poll_stats(
            handle.clone(),
            event_tx,
            self.no_peers_timeout,
        ));

        Ok(Arc::new(RqbitHandle {
            session: self.session.clone(),
            handle,
            chosen,
            events: Mutex::new(Some(event_rx)),
            poll_task: Mutex::new(Some(poll_task)),
        }))
    }

    async fn remove(&self, magnet_uri: &str) -> Result<()> {
        let id = self.torrents.lock().remove(magnet_uri);
        let Some(id) = id else {
            debug!("remove for unknown magnet {}", magnet_uri);
            return Ok(());
        };

        self.session
            .delete(TorrentIdOrHash::Id(id), false)
            .await
            .map_err(|err| EngineError::client(format!("delete failed: {err:#}")))
    }

    fn fatal_errors(&self) -> broadcast::Receiver<String> {
        self.fatal_tx.subscribe()
    }
}

/// Pick the largest playable file and record it as the payload
fn select_payload_file(handle: &ManagedTorrent) -> Result<ChosenFile> {
    let metadata = handle.metadata.load();
    let metadata = metadata
        .as_ref()
        .ok_or_else(|| EngineError::client("torrent metadata not available"))?;

    let files: Vec<(PathBuf, u64)> = metadata
        .info
        .iter_file_details()
        .map_err(|err| EngineError::client(format!("file listing failed: {err:#}")))?
        .filter_map(|file| {
            file.filename
                .to_string()
                .ok()
                .map(|name| (PathBuf::from(name), file.len))
        })
        .collect();

    let (index, matched) = media::select_primary(&files)
        .ok_or_else(|| EngineError::client("torrent contains no files"))?;
    if !matched {
        warn!(
            "No playable file in torrent; falling back to {:?}",
            files[index].0
        );
    }

    let (path, length) = files[index].clone();
    Ok(ChosenFile {
        index,
        path,
        length,
    })
}

/// Translate stats polling into the typed event stream
async fn poll_stats(
    handle: Arc<ManagedTorrent>,
    events: mpsc::Sender<TorrentEvent>,
    no_peers_timeout: Duration,
) {
    let started = tokio::time::Instant::now();
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let mut seen_any_peer = false;

    loop {
        interval.tick().await;

        let stats = handle.stats();

        if let Some(error) = stats.error {
            let _ = events.send(TorrentEvent::Error(error)).await;
            return;
        }

        if stats.finished {
            let _ = events.send(TorrentEvent::Done).await;
            return;
        }

        let mut num_peers = 0u32;
        let mut speed = 0u64;
        if let Some(live) = stats.live.as_ref() {
            num_peers = live.snapshot.peer_stats.live as u32;
            speed = (live.download_speed.mbps * 125_000.0) as u64;
        }
        if num_peers > 0 {
            seen_any_peer = true;
        }

        if stats.progress_bytes > 0 && stats.total_bytes > 0 {
            let progress = stats.progress_bytes as f64 / stats.total_bytes as f64 * 100.0;
            let remaining = stats.total_bytes - stats.progress_bytes;
            let time_remaining = if speed > 0 {
                Some(remaining * 1000 / speed)
            } else {
                None
            };
            if events
                .send(TorrentEvent::Progress {
                    progress,
                    speed,
                    time_remaining,
                    num_peers,
                })
                .await
                .is_err()
            {
                return;
            }
        } else if !seen_any_peer && started.elapsed() > no_peers_timeout {
            // nothing downloaded, nobody ever showed up: the DHT has no
            // peers for this swarm
            let _ = events
                .send(TorrentEvent::NoPeers {
                    source: PeerSource::Dht,
                })
                .await;
            return;
        }
    }
}

struct RqbitHandle {
    session: Arc<Session>,
    handle: Arc<ManagedTorrent>,
    chosen: ChosenFile,
    events: Mutex<Option<mpsc::Receiver<TorrentEvent>>>,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl TorrentHandle for RqbitHandle {
    fn take_events(&self) -> Option<mpsc::Receiver<TorrentEvent>> {
        self.events.lock().take()
    }

    fn chosen_file(&self) -> Option<ChosenFile> {
        Some(self.chosen.clone())
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<ByteReader> {
        let mut stream = self
            .handle
            .clone()
            .stream(self.chosen.index)
            .map_err(|err| EngineError::client(format!("stream failed: {err:#}")))?;
        stream
            .seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(EngineError::Io)?;
        Ok(Box::pin(stream.take(end - start + 1)))
    }

    async fn destroy(&self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
        if let Err(err) = self
            .session
            .delete(TorrentIdOrHash::Id(self.handle.id()), false)
            .await
        {
            debug!("destroy: session delete failed: {err:#}");
        }
    }
}
