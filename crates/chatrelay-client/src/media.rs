//! Outbound file policy: which files can go out as platform media, and how
//! text-like files are inlined when they cannot.

use chatrelay_core::media::extension;
use chatrelay_core::MediaKind;

/// Inlined file content is cut to this many characters.
pub const INLINE_MAX_CHARS: usize = 4000;

const MB: usize = 1024 * 1024;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "tsv", "json", "yaml", "yml", "toml", "xml", "html", "log",
    "ini", "conf", "rs", "py", "js", "ts", "go", "java", "c", "h", "cpp", "sh", "sql",
];

/// Platform upload limit for a media kind.
pub fn max_upload_bytes(kind: MediaKind) -> usize {
    match kind {
        MediaKind::Image => 10 * MB,
        MediaKind::Voice => 2 * MB,
        MediaKind::Video => 10 * MB,
        MediaKind::File => 20 * MB,
    }
}

/// The kind a file is uploaded as, or `None` when the platform would refuse
/// it. Voice messages must be AMR; other audio goes out as a plain file.
pub fn upload_kind(name: &str, size: usize) -> Option<MediaKind> {
    let mut kind = MediaKind::from_filename(name);
    if kind == MediaKind::Voice && extension(name).as_deref() != Some("amr") {
        kind = MediaKind::File;
    }
    (size > 0 && size <= max_upload_bytes(kind)).then_some(kind)
}

pub fn is_text_like(name: &str) -> bool {
    extension(name).is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.as_str()))
}

/// Render a text-like file for inclusion in a message body.
pub fn inline_text(name: &str, bytes: &[u8]) -> String {
    let content = String::from_utf8_lossy(bytes);
    let mut body: String = content.chars().take(INLINE_MAX_CHARS).collect();
    if content.chars().nth(INLINE_MAX_CHARS).is_some() {
        body.push_str("\n…(truncated)");
    }
    format!("--- {name} ---\n{body}")
}

/// Note appended when a file could not be delivered at all.
pub fn undelivered_note(name: &str) -> String {
    format!("[attachment not delivered: {name}]")
}
