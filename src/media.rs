//! Media file selection
//!
//! Shared rules for deciding which file in a torrent (or on disk) is the
//! playable payload. The torrent picker wants the largest playable file so
//! the peer client skips samples and extras; the streaming picker wants the
//! deepest surviving path and must ignore transcoding intermediates.

use std::path::{Path, PathBuf};

/// File name fragments accepted as playable media, lowercase
pub const PLAYABLE_EXTENSIONS: [&str; 7] = ["mp4", "ogg", "mov", "webmv", "mkv", "wmv", "avi"];

/// Intermediate transcode artifacts carry this marker in their path and are
/// never served directly
pub const TRANSCODING_MARKER: &str = "transcoding";

/// Case-insensitive substring match of the file name against the allow-list
pub fn is_playable(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = name.to_lowercase();
    PLAYABLE_EXTENSIONS.iter().any(|ext| name.contains(ext))
}

/// Pick the primary file of a torrent: the largest playable one.
///
/// Returns the index into `files` and whether the allow-list matched. When
/// nothing matches, the first file is chosen so the download still produces
/// something; the caller should log that case. `None` only for an empty
/// torrent.
pub fn select_primary(files: &[(PathBuf, u64)]) -> Option<(usize, bool)> {
    let best = files
        .iter()
        .enumerate()
        .filter(|(_, (path, _))| is_playable(path))
        .max_by_key(|(_, (_, length))| *length);

    match best {
        Some((index, _)) => Some((index, true)),
        None if !files.is_empty() => Some((0, false)),
        None => None,
    }
}

/// Pick the file to stream out of a download directory listing.
///
/// Playable files only, transcode intermediates excluded, longest path wins
/// (deeper paths are more specific in this tree).
pub fn pick_stream_file(files: Vec<PathBuf>) -> Option<PathBuf> {
    files
        .into_iter()
        .filter(|path| is_playable(path))
        .filter(|path| !path.to_string_lossy().contains(TRANSCODING_MARKER))
        .max_by_key(|path| path.as_os_str().len())
}
