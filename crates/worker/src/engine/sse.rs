//! Incremental Server-Sent Events decoding.
//!
//! Upstream chunks can split a line anywhere, so bytes are buffered until a
//! full line is available.

use bytes::BytesMut;

/// Splits an SSE byte stream into `data:` payloads
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: BytesMut,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every complete `data:` payload in order
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(line_end) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(line_end + 1);
            if let Some(data) = parse_line(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Payload of a trailing line with no newline, if any
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = self.buf.split();
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let trimmed = line.trim();

    // Blank separators and `:` comments
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }

    trimmed
        .strip_prefix("data:")
        .map(|data| data.trim().to_string())
}
