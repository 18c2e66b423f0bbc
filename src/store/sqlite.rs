//! SQLite store implementation
//!
//! WAL mode for crash safety, blocking work shipped off the runtime with
//! `spawn_blocking`. Downloads get typed columns (insertion order rides on
//! the rowid); movies and episodes persist as whole JSON documents, which
//! lets the catalog attach fields the engine never interprets.

use super::Store;
use crate::error::{EngineError, Result};
use crate::types::{Download, DownloadStatus, ItemDoc};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// SQLite-backed catalog store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

/// Current schema version — bump when adding migrations
const CURRENT_SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = r#"
-- Downloads: one row per requested acquisition
CREATE TABLE IF NOT EXISTS downloads (
    id TEXT PRIMARY KEY,
    item_kind TEXT NOT NULL,
    quality TEXT NOT NULL,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    speed INTEGER,
    time_remaining INTEGER,
    num_peers INTEGER,
    updated_at INTEGER NOT NULL
);

-- Catalog documents, stored whole
CREATE TABLE IF NOT EXISTS movies (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS episodes (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
"#;

/// Run schema migrations up to `CURRENT_SCHEMA_VERSION`.
///
/// Tracked via `PRAGMA user_version`; idempotent on a current database.
fn migrate(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    debug_assert_eq!(
        conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))
            .unwrap(),
        CURRENT_SCHEMA_VERSION
    );

    Ok(())
}

impl SqliteStore {
    /// Open (or create) a store at the given path
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|err| {
                    EngineError::store(format!("Failed to create database directory: {}", err))
                })?;
            }
        }

        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|err| EngineError::store(format!("Failed to initialize database: {}", err)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing)
    pub async fn in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|err| EngineError::store(format!("Failed to create in-memory database: {}", err)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn row_to_download(row: &rusqlite::Row<'_>) -> std::result::Result<Download, rusqlite::Error> {
    let item_kind: String = row.get("item_kind")?;
    let mode: String = row.get("mode")?;
    let status: String = row.get("status")?;

    let parse_err = |message: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            message.into(),
        )
    };

    Ok(Download {
        id: row.get("id")?,
        item_kind: FromStr::from_str(&item_kind).map_err(parse_err)?,
        quality: row.get("quality")?,
        mode: FromStr::from_str(&mode).map_err(parse_err)?,
        status: FromStr::from_str(&status).map_err(parse_err)?,
        progress: row.get("progress")?,
        speed: row.get::<_, Option<i64>>("speed")?.map(|v| v as u64),
        time_remaining: row
            .get::<_, Option<i64>>("time_remaining")?
            .map(|v| v as u64),
        num_peers: row.get::<_, Option<i64>>("num_peers")?.map(|v| v as u32),
        updated_at: row.get("updated_at")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_download(&self, download: &Download) -> Result<()> {
        let conn = self.conn.clone();
        let download = download.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            // upsert keeps the rowid, so pending order survives updates
            conn.execute(
                r#"
                INSERT INTO downloads
                    (id, item_kind, quality, mode, status, progress, speed,
                     time_remaining, num_peers, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO UPDATE SET
                    item_kind = excluded.item_kind,
                    quality = excluded.quality,
                    mode = excluded.mode,
                    status = excluded.status,
                    progress = excluded.progress,
                    speed = excluded.speed,
                    time_remaining = excluded.time_remaining,
                    num_peers = excluded.num_peers,
                    updated_at = excluded.updated_at
                "#,
                params![
                    download.id,
                    download.item_kind.as_str(),
                    download.quality,
                    download.mode.as_str(),
                    download.status.as_str(),
                    download.progress,
                    download.speed.map(|v| v as i64),
                    download.time_remaining.map(|v| v as i64),
                    download.num_peers.map(|v| v as i64),
                    download.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|err| EngineError::store(err.to_string()))?
    }

    async fn find_download(&self, id: &str) -> Result<Option<Download>> {
        let conn = self.conn.clone();
        let id = id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<Download>> {
            let conn = conn.blocking_lock();
            let download = conn
                .query_row(
                    "SELECT * FROM downloads WHERE id = ?1",
                    params![id],
                    row_to_download,
                )
                .optional()?;
            Ok(download)
        })
        .await
        .map_err(|err| EngineError::store(err.to_string()))?
    }

    async fn pending_downloads(&self) -> Result<Vec<Download>> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<Download>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                r#"
                SELECT * FROM downloads
                WHERE status IN (?1, ?2, ?3)
                ORDER BY rowid
                "#,
            )?;
            let rows = stmt.query_map(
                params![
                    DownloadStatus::Queued.as_str(),
                    DownloadStatus::Connecting.as_str(),
                    DownloadStatus::Downloading.as_str(),
                ],
                row_to_download,
            )?;
            let mut downloads = Vec::new();
            for row in rows {
                downloads.push(row?);
            }
            Ok(downloads)
        })
        .await
        .map_err(|err| EngineError::store(err.to_string()))?
    }

    async fn delete_download(&self, id: &str) -> Result<()> {
        let conn = self.conn.clone();
        let id = id.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute("DELETE FROM downloads WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
        .map_err(|err| EngineError::store(err.to_string()))?
    }

    async fn find_movie(&self, id: &str) -> Result<Option<ItemDoc>> {
        self.find_doc("movies", id).await
    }

    async fn save_movie(&self, doc: &ItemDoc) -> Result<()> {
        self.save_doc("movies", doc).await
    }

    async fn find_episode(&self, id: &str) -> Result<Option<ItemDoc>> {
        self.find_doc("episodes", id).await
    }

    async fn save_episode(&self, doc: &ItemDoc) -> Result<()> {
        self.save_doc("episodes", doc).await
    }
}

impl SqliteStore {
    async fn find_doc(&self, table: &'static str, id: &str) -> Result<Option<ItemDoc>> {
        let conn = self.conn.clone();
        let id = id.to_string();

        let body: Option<String> = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = conn.blocking_lock();
            let body = conn
                .query_row(
                    &format!("SELECT body FROM {} WHERE id = ?1", table),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(body)
        })
        .await
        .map_err(|err| EngineError::store(err.to_string()))??;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn save_doc(&self, table: &'static str, doc: &ItemDoc) -> Result<()> {
        let conn = self.conn.clone();
        let id = doc.id.clone();
        let body = serde_json::to_string(doc)?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                &format!(
                    "INSERT INTO {} (id, body) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                    table
                ),
                params![id, body],
            )?;
            Ok(())
        })
        .await
        .map_err(|err| EngineError::store(err.to_string()))?
    }
}
