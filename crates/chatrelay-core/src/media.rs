//! Media types shared by the gateway proxy, the client delivery path and the
//! platform API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of a media attachment as the platform media API understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Voice,
    Video,
    File,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Voice => "voice",
            MediaKind::Video => "video",
            MediaKind::File => "file",
        }
    }

    /// Guess the kind from a filename extension. Unknown extensions are files.
    pub fn from_filename(name: &str) -> Self {
        match extension(name).as_deref() {
            Some("png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp") => MediaKind::Image,
            Some("amr" | "mp3" | "wav" | "ogg" | "m4a" | "silk") => MediaKind::Voice,
            Some("mp4" | "mov" | "avi" | "mkv" | "webm") => MediaKind::Video,
            _ => MediaKind::File,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaKind::Image),
            "voice" => Ok(MediaKind::Voice),
            "video" => Ok(MediaKind::Video),
            "file" => Ok(MediaKind::File),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

/// Lower-cased extension of a filename, if any.
pub fn extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// A platform-side media object, referenced by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub media_id: String,
}

/// Binary media payload fetched from the platform (directly or via the
/// gateway proxy).
#[derive(Clone, PartialEq, Eq)]
pub struct MediaAsset {
    pub kind: MediaKind,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for MediaAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaAsset")
            .field("kind", &self.kind)
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}
