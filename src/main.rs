//! reelvault server binary
//!
//! Wires configuration, the catalog store, the peer client and the engine
//! together, rehydrates the queue, and serves the delivery API.

use reelvault::client::{ClientFactory, ClientFuture, PeerClient};
use reelvault::{Engine, EngineConfig, RqbitClient, SqliteStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> reelvault::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env()?;
    tokio::fs::create_dir_all(&config.download_dir).await?;

    let store = Arc::new(SqliteStore::new(config.get_database_path()).await?);

    let session_root = config.download_dir.clone();
    let no_peers_timeout = config.no_peers_timeout();
    let factory: ClientFactory = Arc::new(move || -> ClientFuture {
        let session_root = session_root.clone();
        Box::pin(async move {
            let client: Arc<dyn PeerClient> =
                RqbitClient::new(session_root, no_peers_timeout).await?;
            Ok(client)
        })
    });

    let engine = Engine::new(config.clone(), store, factory).await?;
    engine.rehydrate_on_start().await;

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("Listening on {}", config.listen_addr);
    axum::serve(listener, reelvault::server::router(engine)).await?;

    Ok(())
}
