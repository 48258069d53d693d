//! Incremental line decoder for streamed response bodies.

/// Splits an unbounded byte stream into complete text lines.
///
/// Bytes are buffered until a `\n` arrives, so a multi-byte UTF-8 character
/// or a line that straddles two network chunks is only decoded once it is
/// complete. A trailing `\r` is stripped from each line.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completed, in order.
    ///
    /// The trailing fragment (no terminator yet) is kept for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);

        lines
    }

    /// Flushes the carried fragment as a final line, if any.
    ///
    /// The decoder is empty afterwards and can be reused.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = decode_line(&rest);
        (!line.is_empty()).then_some(line)
    }

    /// Returns true if no partial line is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
