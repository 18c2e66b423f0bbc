//! HTTP playback delivery
//!
//! `GET /watch/:id` streams the media file of a download, honoring byte
//! ranges and transcoding on the fly for clients that cannot play the
//! source codec. While the torrent is still live the body reads through
//! the torrent handle, which prioritizes the requested range in swarm
//! scheduling; finished downloads stream straight from disk.

use crate::client::ByteReader;
use crate::engine::Engine;
use crate::ffmpeg;
use crate::layout;
use crate::media;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Build the delivery router over a shared engine
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/watch/:id", get(watch))
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
struct WatchQuery {
    device: Option<String>,
    transcode: Option<String>,
}

impl WatchQuery {
    /// `device=chromecast` is a synonym for "please transcode"
    fn wants_transcode(&self) -> bool {
        self.device.as_deref() == Some("chromecast")
            || self.transcode.as_deref().is_some_and(|v| !v.is_empty())
    }
}

/// Parse `bytes=<start>-<end?>`, defaulting an omitted end to the last
/// byte of the file
fn parse_range(raw: &str, media_size: u64) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start_raw, end_raw) = spec.split_once('-')?;
    let start: u64 = start_raw.trim().parse().ok()?;
    let end: u64 = if end_raw.trim().is_empty() {
        media_size.saturating_sub(1)
    } else {
        end_raw.trim().parse().ok()?
    };
    (start <= end && start < media_size).then_some((start, end))
}

async fn watch(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Query(query): Query<WatchQuery>,
    headers: HeaderMap,
) -> Response {
    let dir = engine.dir_for(&id);

    let files = match layout::list_files(&dir).await {
        Ok(files) if !files.is_empty() => files,
        Ok(_) | Err(_) => {
            debug!("No media directory for {}", id);
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let Some(media_path) = media::pick_stream_file(files) else {
        debug!("No playable file for {}", id);
        return StatusCode::NOT_FOUND.into_response();
    };

    let media_size = match tokio::fs::metadata(&media_path).await {
        Ok(meta) => meta.len(),
        Err(err) => {
            warn!("Could not stat {:?}: {}", media_path, err);
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| parse_range(raw, media_size));

    let (start, end) = range.unwrap_or((0, media_size.saturating_sub(1)));

    // a live torrent outranks the disk: reading through the handle tells
    // the swarm scheduler which bytes we need first
    let live = engine.live_handle(&id);
    let from_live = live.is_some();
    let reader: ByteReader = match open_source(live, &media_path, start, end).await {
        Ok(reader) => reader,
        Err(err) => {
            warn!("Could not open media source for {}: {}", id, err);
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let (reader, transcoding) = match apply_transcode_gate(&engine, &query, &media_path, reader).await
    {
        Ok(result) => result,
        Err(err) => {
            warn!("Transcode pipeline failed for {}: {}", id, err);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let body = Body::from_stream(ReaderStream::new(reader));
    let mut response = Response::builder().header(header::CONTENT_TYPE, "video/mp4");

    if let Some((start, end)) = range {
        let chunk_size = end - start + 1;
        response = response
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, chunk_size),
            )
            .header(header::ACCEPT_RANGES, "bytes");
        // the converted size is unknown, so a transcoded body carries no length
        if !transcoding {
            response = response.header(header::CONTENT_LENGTH, chunk_size);
        }
    } else {
        response = response.status(StatusCode::OK);
        // live torrents are still growing; only finished files know their size
        if !from_live && !transcoding {
            response = response.header(header::CONTENT_LENGTH, media_size);
        }
    }

    response
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Open the byte source for `[start, end]`: the live torrent handle when
/// one exists, the file on disk otherwise
async fn open_source(
    live: Option<Arc<dyn crate::client::TorrentHandle>>,
    media_path: &std::path::Path,
    start: u64,
    end: u64,
) -> crate::error::Result<ByteReader> {
    if let Some(handle) = live {
        match handle.read_range(start, end).await {
            Ok(reader) => return Ok(reader),
            Err(err) => {
                // fall back to whatever made it to disk
                warn!("Live read failed, serving from disk: {}", err);
            }
        }
    }

    let mut file = tokio::fs::File::open(media_path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    Ok(Box::pin(file.take(end - start + 1)))
}

/// Decide whether the response body goes through ffmpeg.
///
/// Only engaged when the client asked for it; a failed probe falls back to
/// the raw stream rather than erroring the request.
async fn apply_transcode_gate(
    engine: &Arc<Engine>,
    query: &WatchQuery,
    media_path: &std::path::Path,
    reader: ByteReader,
) -> crate::error::Result<(ByteReader, bool)> {
    if !query.wants_transcode() {
        return Ok((reader, false));
    }

    let probe = match ffmpeg::probe(media_path).await {
        Ok(probe) => probe,
        Err(err) => {
            debug!("Probe failed, serving raw stream: {}", err);
            return Ok((reader, false));
        }
    };

    if !ffmpeg::should_transcode(&probe, engine.config().force_transcoding) {
        return Ok((reader, false));
    }

    let transcoded = ffmpeg::transcode(reader)?;
    Ok((Box::pin(transcoded), true))
}
