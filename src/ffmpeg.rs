//! External media probe and transcode pipeline
//!
//! Drives the `ffprobe` and `ffmpeg` binaries on `PATH`. The probe decides
//! whether a client that asked for transcoding actually needs it; the
//! transcode pipeline rewraps the read stream into a matroska container on
//! the fly and hands back its stdout for the HTTP response body.

use crate::error::{EngineError, Result};
use serde::Deserialize;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

/// Codecs the stock player set cannot decode; these always get transcoded
pub const CODEC_BLACKLIST: [&str; 1] = ["hevc"];

/// Parsed `ffprobe -show_streams` output
#[derive(Debug, Clone, Deserialize)]
pub struct MediaProbe {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
}

/// One stream entry from the probe
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeStream {
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
}

impl MediaProbe {
    /// The codec name of the first video stream, if any
    pub fn video_codec(&self) -> Option<&str> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .and_then(|s| s.codec_name.as_deref())
    }

    pub fn parse(json: &[u8]) -> Result<Self> {
        serde_json::from_slice(json).map_err(|err| EngineError::Probe(err.to_string()))
    }
}

/// Whether a probed file must go through the transcode pipeline
pub fn should_transcode(probe: &MediaProbe, force: bool) -> bool {
    if force {
        return true;
    }
    probe
        .video_codec()
        .is_some_and(|codec| CODEC_BLACKLIST.contains(&codec))
}

/// Probe the streams of a media file with `ffprobe`
pub async fn probe(path: &Path) -> Result<MediaProbe> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-print_format", "json", "-show_streams"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| EngineError::Probe(format!("failed to spawn ffprobe: {}", err)))?;

    if !output.status.success() {
        return Err(EngineError::Probe(format!(
            "ffprobe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    MediaProbe::parse(&output.stdout)
}

/// A running transcode: ffmpeg's stdout, keeping the child process alive
/// for as long as the stream is being read. Dropping it kills ffmpeg.
pub struct TranscodeStream {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for TranscodeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

/// Wrap a media read stream through ffmpeg, producing a matroska container
/// suitable for clients that cannot play the source codec.
///
/// The input is copied into ffmpeg's stdin from a background task; the
/// returned stream is ffmpeg's stdout.
pub fn transcode(input: Pin<Box<dyn AsyncRead + Send>>) -> Result<TranscodeStream> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-i",
            "pipe:0",
            "-f",
            "matroska",
            "-movflags",
            "faststart",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| EngineError::Transcode(format!("failed to spawn ffmpeg: {}", err)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| EngineError::Transcode("ffmpeg stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Transcode("ffmpeg stdout unavailable".to_string()))?;

    tokio::spawn(async move {
        let mut input = input;
        if let Err(err) = tokio::io::copy(&mut input, &mut stdin).await {
            debug!("Transcode input pipe closed: {}", err);
        }
        // dropping stdin signals EOF so ffmpeg can flush its output
    });

    Ok(TranscodeStream {
        _child: child,
        stdout,
    })
}
