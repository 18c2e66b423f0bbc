//! # reelvault
//!
//! The media-acquisition and playback-delivery core of a personal
//! movie/episode library: a bounded-concurrency queue of peer-to-peer
//! downloads with persisted progress, plus an HTTP handler that streams
//! the resulting media with byte-range support and on-the-fly transcoding.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use reelvault::{Engine, EngineConfig, RqbitClient, SqliteStore};
//! use reelvault::client::{ClientFactory, ClientFuture, PeerClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_env()?;
//!     let store = Arc::new(SqliteStore::new(config.get_database_path()).await?);
//!
//!     let session_root = config.download_dir.clone();
//!     let timeout = config.no_peers_timeout();
//!     let factory: ClientFactory = Arc::new(move || -> ClientFuture {
//!         let session_root = session_root.clone();
//!         Box::pin(async move {
//!             let client: Arc<dyn PeerClient> =
//!                 RqbitClient::new(session_root, timeout).await?;
//!             Ok(client)
//!         })
//!     });
//!
//!     let engine = Engine::new(config.clone(), store, factory).await?;
//!     engine.rehydrate_on_start().await;
//!
//!     let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
//!     axum::serve(listener, reelvault::server::router(engine)).await?;
//!     Ok(())
//! }
//! ```

// Modules
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffmpeg;
pub mod layout;
pub mod media;
pub mod server;
pub mod store;
pub mod types;

mod worker;

// Re-exports for convenience
pub use client::{PeerClient, RqbitClient, TorrentEvent, TorrentHandle};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use store::{MemoryStore, SqliteStore, Store, StoreAdapter};
pub use types::{
    CatalogItem, DeliveryMode, Download, DownloadEvent, DownloadStatus, ItemDoc, ItemKind,
    TorrentSource,
};
