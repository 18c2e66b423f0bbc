//! Download worker
//!
//! Drives one download end to end: resolve the catalog item, pick the
//! magnet, hand it to the peer client, then run a single event loop until a
//! terminal state. The latches the loop carries (`updated_item_once`, last
//! pushed progress/peers) keep parent updates one-shot and progress writes
//! coalesced. The worker never returns an error; every terminal outcome is
//! recorded in the store and the queue moves on.

use crate::client::{PeerSource, TorrentEvent};
use crate::engine::Engine;
use crate::types::{
    now_millis, round_progress, CatalogItem, Download, DownloadEvent, DownloadPatch,
    DownloadStatus, ItemDownloadPatch,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Progress must advance this many percentage points (or the peer count
/// must change) before another store write goes out
const PROGRESS_PUSH_THRESHOLD: f64 = 0.5;

/// Claim a download and drive it to a terminal state.
pub(crate) async fn run(engine: Arc<Engine>, mut download: Download) {
    let id = download.id.clone();
    let cancel = CancellationToken::new();
    let done = CancellationToken::new();

    if !engine.register_active(&id, cancel.clone(), done.clone()) {
        warn!("Download {} already has a live torrent; not claiming it", id);
        return;
    }

    let generation = engine.generation();
    drive(&engine, &mut download, &cancel, &generation).await;

    engine.unregister_active(&id);
    done.cancel();
}

async fn drive(
    engine: &Arc<Engine>,
    download: &mut Download,
    cancel: &CancellationToken,
    generation: &CancellationToken,
) {
    // resolve the catalog item
    let item = match engine.adapter().find_item(download).await {
        Ok(item) => item,
        Err(err) => {
            warn!("Could not load item for {}: {}", download.id, err);
            None
        }
    };
    let Some(mut item) = item else {
        warn!("Catalog item {} not found; failing download", download.id);
        engine
            .adapter()
            .update_download(download, failed_patch())
            .await;
        engine.remove_pending(&download.id);
        engine.emit(DownloadEvent::Failed {
            id: download.id.clone(),
            reason: "catalog item not found".to_string(),
        });
        return;
    };

    // pick the magnet: exact quality match, no fallback
    let Some(source) = item.torrent_for_quality(&download.quality).cloned() else {
        info!(
            "No torrent with quality {} on {}; failing download",
            download.quality, download.id
        );
        engine
            .adapter()
            .update_download(download, failed_patch())
            .await;
        engine
            .adapter()
            .update_item_download(&mut item, failed_item_patch())
            .await;
        engine.remove_pending(&download.id);
        engine.emit(DownloadEvent::Failed {
            id: download.id.clone(),
            reason: format!("no torrent with quality {}", download.quality),
        });
        return;
    };

    // connecting
    engine
        .adapter()
        .update_download(
            download,
            DownloadPatch {
                status: Some(DownloadStatus::Connecting),
                speed: Some(None),
                time_remaining: Some(None),
                num_peers: Some(None),
                ..Default::default()
            },
        )
        .await;
    engine
        .adapter()
        .update_item_download(
            &mut item,
            ItemDownloadPatch {
                download_status: Some(DownloadStatus::Connecting),
                downloading: Some(true),
                ..Default::default()
            },
        )
        .await;
    engine.emit(DownloadEvent::Started {
        id: download.id.clone(),
    });

    let target_dir = engine.dir_for(&download.id);
    let client = engine.client();
    let handle = tokio::select! {
        _ = cancel.cancelled() => {
            finish_removed(engine, download, &mut item).await;
            return;
        }
        _ = generation.cancelled() => {
            requeue(engine, download, &mut item).await;
            return;
        }
        result = client.add(&source.url, &target_dir) => match result {
            Ok(handle) => handle,
            Err(err) => {
                warn!("Peer client rejected {}: {}", source.url, err);
                fail_active(engine, download, &mut item, &source.url).await;
                return;
            }
        }
    };

    engine.attach_handle(&download.id, &source.url, handle.clone());

    let Some(mut events) = handle.take_events() else {
        warn!("Torrent handle for {} has no event stream", download.id);
        fail_active(engine, download, &mut item, &source.url).await;
        return;
    };

    // per-download latches for the event loop
    let mut updated_item_once = false;
    let mut last_pushed_progress = 0.0f64;
    let mut last_pushed_peers: Option<u32> = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                finish_removed(engine, download, &mut item).await;
                return;
            }
            _ = generation.cancelled() => {
                requeue(engine, download, &mut item).await;
                return;
            }
            event = events.recv() => event,
        };

        match event {
            Some(TorrentEvent::Progress {
                progress,
                speed,
                time_remaining,
                num_peers,
            }) => {
                // 100.0 is reserved for the complete state
                let progress = round_progress(progress.clamp(0.0, 100.0)).min(99.9);
                let first = download.status == DownloadStatus::Connecting;
                let advanced = progress - last_pushed_progress >= PROGRESS_PUSH_THRESHOLD;
                let peers_changed = last_pushed_peers != Some(num_peers);

                if !(first || advanced || peers_changed) {
                    continue;
                }

                engine
                    .adapter()
                    .update_download(
                        download,
                        DownloadPatch {
                            status: Some(DownloadStatus::Downloading),
                            progress: Some(progress),
                            speed: Some(Some(speed)),
                            time_remaining: Some(time_remaining),
                            num_peers: Some(Some(num_peers)),
                        },
                    )
                    .await;
                if !updated_item_once {
                    engine
                        .adapter()
                        .update_item_download(
                            &mut item,
                            ItemDownloadPatch {
                                download_status: Some(DownloadStatus::Downloading),
                                downloading: Some(true),
                                ..Default::default()
                            },
                        )
                        .await;
                    updated_item_once = true;
                }
                last_pushed_progress = progress;
                last_pushed_peers = Some(num_peers);
                engine.emit(DownloadEvent::Progress {
                    id: download.id.clone(),
                    progress,
                    num_peers: Some(num_peers),
                });
            }
            Some(TorrentEvent::NoPeers {
                source: PeerSource::Dht,
            }) => {
                info!("DHT has no peers for {}; failing download", download.id);
                fail_active(engine, download, &mut item, &source.url).await;
                return;
            }
            Some(TorrentEvent::NoPeers { source: other }) => {
                debug!("No peers reported by {:?} for {}", other, download.id);
            }
            Some(TorrentEvent::Done) => {
                finish_complete(engine, download, &mut item, &source.url).await;
                return;
            }
            Some(TorrentEvent::Error(message)) => {
                warn!("Torrent error for {}: {}", download.id, message);
                fail_active(engine, download, &mut item, &source.url).await;
                return;
            }
            None => {
                warn!("Event stream for {} closed unexpectedly", download.id);
                fail_active(engine, download, &mut item, &source.url).await;
                return;
            }
        }
    }
}

fn failed_patch() -> DownloadPatch {
    DownloadPatch {
        status: Some(DownloadStatus::Failed),
        speed: Some(None),
        time_remaining: Some(None),
        num_peers: Some(None),
        ..Default::default()
    }
}

fn failed_item_patch() -> ItemDownloadPatch {
    ItemDownloadPatch {
        download_status: Some(DownloadStatus::Failed),
        downloading: Some(false),
        ..Default::default()
    }
}

/// Terminal failure of a download that reached the peer client: the record
/// and the download directory are cleaned up and the swarm is detached.
async fn fail_active(
    engine: &Arc<Engine>,
    download: &mut Download,
    item: &mut CatalogItem,
    magnet_url: &str,
) {
    engine
        .adapter()
        .update_download(download, failed_patch())
        .await;
    engine
        .adapter()
        .update_item_download(item, failed_item_patch())
        .await;

    engine.detach_handle(&download.id);
    engine.clean_up_download(&download.id).await;
    if let Err(err) = engine.client().remove(magnet_url).await {
        debug!("Swarm detach for {} failed: {}", download.id, err);
    }

    engine.emit(DownloadEvent::Failed {
        id: download.id.clone(),
        reason: "download failed".to_string(),
    });
}

async fn finish_complete(
    engine: &Arc<Engine>,
    download: &mut Download,
    item: &mut CatalogItem,
    magnet_url: &str,
) {
    engine
        .adapter()
        .update_download(
            download,
            DownloadPatch {
                status: Some(DownloadStatus::Complete),
                progress: Some(100.0),
                speed: Some(None),
                time_remaining: Some(None),
                num_peers: Some(None),
            },
        )
        .await;
    engine
        .adapter()
        .update_item_download(
            item,
            ItemDownloadPatch {
                download_status: Some(DownloadStatus::Complete),
                downloading: Some(false),
                download_complete: Some(true),
                downloaded_on: Some(Some(now_millis())),
            },
        )
        .await;

    engine.detach_handle(&download.id);
    engine.remove_pending(&download.id);
    if let Err(err) = engine.client().remove(magnet_url).await {
        debug!("Swarm detach for {} failed: {}", download.id, err);
    }

    // the media files stay on disk for streaming
    info!("Download {} complete", download.id);
    engine.emit(DownloadEvent::Completed {
        id: download.id.clone(),
    });
}

/// Operator cancellation. Partial bytes stay on disk until an explicit
/// cleanup.
async fn finish_removed(engine: &Arc<Engine>, download: &mut Download, item: &mut CatalogItem) {
    engine
        .adapter()
        .update_download(
            download,
            DownloadPatch {
                status: Some(DownloadStatus::Removed),
                speed: Some(None),
                time_remaining: Some(None),
                num_peers: Some(None),
                ..Default::default()
            },
        )
        .await;
    engine
        .adapter()
        .update_item_download(
            item,
            ItemDownloadPatch {
                download_status: Some(DownloadStatus::Removed),
                downloading: Some(false),
                ..Default::default()
            },
        )
        .await;

    engine.remove_pending(&download.id);
    info!("Download {} removed", download.id);
    engine.emit(DownloadEvent::Removed {
        id: download.id.clone(),
    });
}

/// The peer client died underneath us; put the download back in line so the
/// rebuilt client can re-drive it from scratch.
async fn requeue(engine: &Arc<Engine>, download: &mut Download, item: &mut CatalogItem) {
    engine
        .adapter()
        .update_download(
            download,
            DownloadPatch {
                status: Some(DownloadStatus::Queued),
                speed: Some(None),
                time_remaining: Some(None),
                num_peers: Some(None),
                ..Default::default()
            },
        )
        .await;
    engine
        .adapter()
        .update_item_download(
            item,
            ItemDownloadPatch {
                download_status: Some(DownloadStatus::Queued),
                downloading: Some(false),
                ..Default::default()
            },
        )
        .await;
    debug!("Requeued {} after client teardown", download.id);
}
