//! Integration tests for the acquisition engine
//!
//! Driven end to end against a scripted mock peer client and an in-memory
//! store: queue processing, the worker state machine, crash rehydration,
//! cancellation, and client rebuild after a fatal error.

mod mock_client;

use mock_client::{progress, MockPeerClient};
use reelvault::client::{ClientFactory, ClientFuture, PeerClient, PeerSource, TorrentEvent};
use reelvault::store::{MemoryStore, Store};
use reelvault::types::{DownloadEvent, DownloadStatus, ItemKind};
use reelvault::Engine;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_helpers::{build_engine, download, movie_with_torrent, wait_for_event, RecordingStore};

const MAGNET: &str = "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn completed(id: &'static str) -> impl Fn(&DownloadEvent) -> bool {
    move |event| matches!(event, DownloadEvent::Completed { id: event_id } if event_id == id)
}

fn failed(id: &'static str) -> impl Fn(&DownloadEvent) -> bool {
    move |event| matches!(event, DownloadEvent::Failed { id: event_id, .. } if event_id == id)
}

#[tokio::test]
async fn test_happy_path_completes() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .save_download(&download("m1", ItemKind::Movie, "1080p", DownloadStatus::Queued))
        .await
        .unwrap();
    store
        .save_movie(&movie_with_torrent("m1", "1080p", MAGNET))
        .await
        .unwrap();

    let client = MockPeerClient::new();
    client.script(
        MAGNET,
        vec![progress(10.0), progress(50.0), progress(95.0), TorrentEvent::Done],
    );

    let engine = build_engine(store.clone(), client.clone(), temp_dir.path(), 1).await;
    let mut events = engine.subscribe();
    engine.rehydrate_on_start().await;

    let done = wait_for_event(&mut events, completed("m1"), Duration::from_secs(5)).await;
    assert!(done.is_some(), "download should complete");

    let record = store.find_download("m1").await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Complete);
    assert_eq!(record.progress, 100.0);
    assert_eq!(record.speed, None);
    assert_eq!(record.time_remaining, None);
    assert_eq!(record.num_peers, None);
    assert!(record.updated_at > 0);

    let movie = store.find_movie("m1").await.unwrap().unwrap();
    assert_eq!(
        movie.download.download_status,
        Some(DownloadStatus::Complete)
    );
    assert!(!movie.download.downloading);
    assert!(movie.download.download_complete);
    assert!(movie.download.downloaded_on.unwrap() > 0);

    assert_eq!(client.removed_count(MAGNET), 1);
    assert_eq!(engine.queue_len(), 0);
    assert!(engine.live_handle("m1").is_none());
}

#[tokio::test]
async fn test_quality_miss_fails_without_touching_client() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .save_download(&download("m1", ItemKind::Movie, "1080p", DownloadStatus::Queued))
        .await
        .unwrap();
    // only 720p available — no exact match, no fallback
    store
        .save_movie(&movie_with_torrent("m1", "720p", MAGNET))
        .await
        .unwrap();

    let client = MockPeerClient::new();
    let engine = build_engine(store.clone(), client.clone(), temp_dir.path(), 1).await;
    let mut events = engine.subscribe();
    engine.rehydrate_on_start().await;

    let failure = wait_for_event(&mut events, failed("m1"), Duration::from_secs(5)).await;
    assert!(failure.is_some(), "download should fail");

    let record = store.find_download("m1").await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);

    let movie = store.find_movie("m1").await.unwrap().unwrap();
    assert_eq!(movie.download.download_status, Some(DownloadStatus::Failed));
    assert!(!movie.download.downloading);

    // the peer client was never consulted
    assert!(client.added().is_empty());
    assert_eq!(engine.queue_len(), 0);
}

#[tokio::test]
async fn test_dht_no_peers_cleans_up() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .save_download(&download("m1", ItemKind::Movie, "1080p", DownloadStatus::Queued))
        .await
        .unwrap();
    store
        .save_movie(&movie_with_torrent("m1", "1080p", MAGNET))
        .await
        .unwrap();

    let client = MockPeerClient::new();
    client.script(
        MAGNET,
        vec![
            progress(2.0),
            TorrentEvent::NoPeers {
                source: PeerSource::Dht,
            },
        ],
    );

    let engine = build_engine(store.clone(), client.clone(), temp_dir.path(), 1).await;

    // partial bytes on disk that the failure must sweep away
    let download_dir = engine.dir_for("m1");
    tokio::fs::create_dir_all(&download_dir).await.unwrap();
    tokio::fs::write(download_dir.join("movie.mp4"), b"partial")
        .await
        .unwrap();

    let mut events = engine.subscribe();
    engine.rehydrate_on_start().await;

    let failure = wait_for_event(&mut events, failed("m1"), Duration::from_secs(5)).await;
    assert!(failure.is_some(), "download should fail");

    // the record is gone, the parent is marked, the directory is removed
    assert!(store.find_download("m1").await.unwrap().is_none());
    let movie = store.find_movie("m1").await.unwrap().unwrap();
    assert_eq!(movie.download.download_status, Some(DownloadStatus::Failed));
    assert!(!movie.download.downloading);
    assert!(!download_dir.exists());
    assert_eq!(client.removed_count(MAGNET), 1);
    assert!(engine.live_handle("m1").is_none());
}

#[tokio::test]
async fn test_tracker_no_peers_is_informational() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .save_download(&download("m1", ItemKind::Movie, "1080p", DownloadStatus::Queued))
        .await
        .unwrap();
    store
        .save_movie(&movie_with_torrent("m1", "1080p", MAGNET))
        .await
        .unwrap();

    let client = MockPeerClient::new();
    client.script(
        MAGNET,
        vec![
            TorrentEvent::NoPeers {
                source: PeerSource::Tracker,
            },
            progress(40.0),
            TorrentEvent::Done,
        ],
    );

    let engine = build_engine(store.clone(), client.clone(), temp_dir.path(), 1).await;
    let mut events = engine.subscribe();
    engine.rehydrate_on_start().await;

    let done = wait_for_event(&mut events, completed("m1"), Duration::from_secs(5)).await;
    assert!(done.is_some(), "tracker no-peers must not kill the download");
}

#[tokio::test]
async fn test_rehydrate_preserves_order_with_bounded_concurrency() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    let magnets = [
        "magnet:?xt=urn:btih:aaaa",
        "magnet:?xt=urn:btih:bbbb",
        "magnet:?xt=urn:btih:cccc",
    ];
    let seeds = [
        ("a", DownloadStatus::Connecting),
        ("b", DownloadStatus::Downloading),
        ("c", DownloadStatus::Queued),
    ];
    let client = MockPeerClient::new();
    for ((id, status), magnet) in seeds.iter().zip(magnets.iter()) {
        store
            .save_download(&download(id, ItemKind::Movie, "1080p", *status))
            .await
            .unwrap();
        store
            .save_movie(&movie_with_torrent(id, "1080p", magnet))
            .await
            .unwrap();
        client.script(magnet, vec![progress(50.0), TorrentEvent::Done]);
    }

    let engine = build_engine(store.clone(), client.clone(), temp_dir.path(), 1).await;
    let mut events = engine.subscribe();
    engine.rehydrate_on_start().await;

    for id in ["a", "b", "c"] {
        let done = wait_for_event(
            &mut events,
            |event| matches!(event, DownloadEvent::Completed { id: event_id } if event_id == id),
            Duration::from_secs(5),
        )
        .await;
        assert!(done.is_some(), "download {} should complete", id);
    }

    // insertion order preserved, one worker at a time
    assert_eq!(client.added(), magnets);
    assert_eq!(client.max_live_seen(), 1);
}

#[tokio::test]
async fn test_stop_downloading_removes_live_download() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .save_download(&download("m1", ItemKind::Movie, "1080p", DownloadStatus::Queued))
        .await
        .unwrap();
    store
        .save_movie(&movie_with_torrent("m1", "1080p", MAGNET))
        .await
        .unwrap();

    let client = MockPeerClient::new();
    // a download that would run forever
    client.script(MAGNET, (0..500).map(|i| progress(i as f64 / 10.0)).collect());

    let engine = build_engine(store.clone(), client.clone(), temp_dir.path(), 1).await;
    let mut events = engine.subscribe();
    engine.rehydrate_on_start().await;

    let started = wait_for_event(
        &mut events,
        |event| matches!(event, DownloadEvent::Progress { id, .. } if id == "m1"),
        Duration::from_secs(5),
    )
    .await;
    assert!(started.is_some());

    engine.stop_downloading("m1").await;

    let record = store.find_download("m1").await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Removed);
    let movie = store.find_movie("m1").await.unwrap().unwrap();
    assert_eq!(movie.download.download_status, Some(DownloadStatus::Removed));
    assert!(!movie.download.downloading);

    assert_eq!(engine.queue_len(), 0);
    assert!(engine.live_handle("m1").is_none());
    assert_eq!(engine.active_count(), 0);

    // a second stop is a no-op
    engine.stop_downloading("m1").await;
}

#[tokio::test]
async fn test_progress_writes_are_monotonic_and_end_at_hundred() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(RecordingStore::new());
    store
        .save_download(&download("m1", ItemKind::Movie, "1080p", DownloadStatus::Queued))
        .await
        .unwrap();
    store
        .save_movie(&movie_with_torrent("m1", "1080p", MAGNET))
        .await
        .unwrap();

    let client = MockPeerClient::new();
    client.script(
        MAGNET,
        vec![
            progress(10.0),
            progress(10.2), // below the push threshold, dropped
            progress(50.0),
            progress(95.0),
            TorrentEvent::Done,
        ],
    );

    let engine = build_engine(store.clone(), client.clone(), temp_dir.path(), 1).await;
    let mut events = engine.subscribe();
    engine.rehydrate_on_start().await;

    let done = wait_for_event(&mut events, completed("m1"), Duration::from_secs(5)).await;
    assert!(done.is_some());

    let persisted = store.progress_for("m1");
    assert!(
        persisted.windows(2).all(|pair| pair[0] <= pair[1]),
        "persisted progress must be non-decreasing: {:?}",
        persisted
    );
    assert_eq!(persisted.last().copied(), Some(100.0));
    // 10.2 never made it to the store
    assert!(!persisted.contains(&10.2));
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let client = MockPeerClient::new();

    for index in 0..4 {
        let id = format!("m{}", index);
        let magnet = format!("magnet:?xt=urn:btih:{:040}", index);
        store
            .save_download(&download(&id, ItemKind::Movie, "1080p", DownloadStatus::Queued))
            .await
            .unwrap();
        store
            .save_movie(&movie_with_torrent(&id, "1080p", &magnet))
            .await
            .unwrap();
        client.script(&magnet, vec![progress(50.0), TorrentEvent::Done]);
    }

    let engine = build_engine(store.clone(), client.clone(), temp_dir.path(), 2).await;
    let mut events = engine.subscribe();
    engine.rehydrate_on_start().await;

    for index in 0..4 {
        let id = format!("m{}", index);
        let done = wait_for_event(
            &mut events,
            |event| matches!(event, DownloadEvent::Completed { id: event_id } if *event_id == id),
            Duration::from_secs(5),
        )
        .await;
        assert!(done.is_some(), "download {} should complete", id);
    }

    assert!(client.max_live_seen() <= 2);
}

#[tokio::test]
async fn test_client_rebuild_redrives_pending() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    store
        .save_download(&download("m1", ItemKind::Movie, "1080p", DownloadStatus::Queued))
        .await
        .unwrap();
    store
        .save_movie(&movie_with_torrent("m1", "1080p", MAGNET))
        .await
        .unwrap();

    let client = MockPeerClient::new();
    // first drive: stall forever; second drive after the rebuild: finish
    client.script(MAGNET, (0..500).map(|i| progress(i as f64 / 10.0)).collect());
    client.script(MAGNET, vec![progress(90.0), TorrentEvent::Done]);

    let builds = Arc::new(AtomicUsize::new(0));
    let factory: ClientFactory = {
        let client = client.clone();
        let builds = Arc::clone(&builds);
        Arc::new(move || -> ClientFuture {
            builds.fetch_add(1, Ordering::SeqCst);
            let client: Arc<dyn PeerClient> = client.clone();
            Box::pin(async move { Ok(client) })
        })
    };
    let config = reelvault::EngineConfig::new()
        .download_dir(temp_dir.path())
        .max_concurrent(1);
    let engine = Engine::new(config, store.clone() as Arc<dyn Store>, factory)
        .await
        .unwrap();

    let mut events = engine.subscribe();
    engine.rehydrate_on_start().await;

    // wait until the first drive is underway, then kill the client
    let started = wait_for_event(
        &mut events,
        |event| matches!(event, DownloadEvent::Progress { id, .. } if id == "m1"),
        Duration::from_secs(5),
    )
    .await;
    assert!(started.is_some());
    client.inject_fatal("session died");

    let done = wait_for_event(&mut events, completed("m1"), Duration::from_secs(10)).await;
    assert!(done.is_some(), "download should complete after rebuild");

    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert_eq!(client.added().len(), 2);
    let record = store.find_download("m1").await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Complete);
}

#[tokio::test]
async fn test_missing_item_fails_download() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    // download exists, but no movie record behind it
    store
        .save_download(&download("ghost", ItemKind::Movie, "1080p", DownloadStatus::Queued))
        .await
        .unwrap();

    let client = MockPeerClient::new();
    let engine = build_engine(store.clone(), client.clone(), temp_dir.path(), 1).await;
    let mut events = engine.subscribe();
    engine.rehydrate_on_start().await;

    let failure = wait_for_event(&mut events, failed("ghost"), Duration::from_secs(5)).await;
    assert!(failure.is_some());

    let record = store.find_download("ghost").await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);
    assert!(client.added().is_empty());
}
