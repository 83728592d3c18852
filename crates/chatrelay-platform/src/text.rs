/// Largest text message body the platform accepts, in bytes.
pub const MAX_TEXT_BYTES: usize = 2048;

/// Split `text` into chunks of at most `max_bytes` bytes, never cutting a
/// UTF-8 sequence. A chunk ends at the last newline in its window when that
/// newline falls in the second half of the window.
pub fn split_text(text: &str, max_bytes: usize) -> Vec<String> {
    if text.len() <= max_bytes || max_bytes < 4 {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max_bytes {
        let mut end = max_bytes;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if let Some(nl) = rest[..end].rfind('\n') {
            if nl >= end / 2 {
                end = nl + 1;
            }
        }
        chunks.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_text("hi", MAX_TEXT_BYTES), vec!["hi"]);
        assert_eq!(split_text("", MAX_TEXT_BYTES), vec![""]);
    }

    #[test]
    fn respects_byte_limit_and_char_boundaries() {
        // 3-byte characters never line up with a 2048 boundary.
        let text = "中".repeat(1500);
        let chunks = split_text(&text, MAX_TEXT_BYTES);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.len() <= MAX_TEXT_BYTES);
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn prefers_newline_breaks() {
        let line = format!("{}\n", "a".repeat(99));
        let text = line.repeat(30);
        let chunks = split_text(&text, 1024);
        assert!(chunks[0].ends_with('\n'));
        assert_eq!(chunks[0].len(), 1000);
        assert_eq!(chunks.concat(), text);
    }
}
