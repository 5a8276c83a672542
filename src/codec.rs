//! Line-buffer codec for the agent's stdout stream.
//!
//! The agent CLI emits one JSON object per `\n`-terminated line, but the
//! subprocess pipe hands us arbitrary byte chunks: a read may end mid-line,
//! mid-codepoint, or span several lines. [`LineBuffer`] reassembles complete
//! lines from those chunks and bounds the amount of memory a single
//! pathological line can pin.
//!
//! Overflow behavior: once the retained partial line exceeds
//! `max_buffer_size`, a single [`LineEvent::Overflow`] is emitted, the
//! partial is discarded, and splitting resumes at the next newline. The
//! buffer never splits inside a line, so a recovered stream re-synchronizes
//! on a line boundary rather than mid-codepoint.
//!
//! JSON decoding is a separate, pure step ([`decode_line`]); per-line decode
//! failures are reported with a truncated excerpt and never tear down the
//! transport.

use serde_json::Value;

/// Default cap on a retained partial line (1 MiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// How much of an undecodable line is kept in the failure report.
pub const DECODE_EXCERPT_BYTES: usize = 256;

/// A unit produced by [`LineBuffer::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// One complete line, without its trailing newline.
    Line(String),
    /// The retained partial exceeded the buffer cap and was discarded.
    /// `discarded` is the number of bytes dropped, including any bytes of
    /// the same oversized line consumed afterwards.
    Overflow { discarded: usize },
}

/// Stateful splitter: arbitrary byte chunks in, complete UTF-8 lines out.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_buffer_size: usize,
    /// Set after an overflow until the next newline is seen; bytes arriving
    /// in this state belong to the oversized line and are dropped.
    skipping: bool,
    skipped: usize,
}

impl LineBuffer {
    /// Create a buffer with the default 1 MiB cap.
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Create a buffer with an explicit cap on the retained partial line.
    pub fn with_max_size(max_buffer_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_buffer_size,
            skipping: false,
            skipped: 0,
        }
    }

    /// Feed a chunk of bytes, returning every event it completes.
    ///
    /// At most one [`LineEvent::Overflow`] is produced per oversized line,
    /// no matter how many chunks that line spans.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<LineEvent> {
        let mut events = Vec::new();

        for &b in bytes {
            if self.skipping {
                if b == b'\n' {
                    events.push(LineEvent::Overflow {
                        discarded: self.skipped,
                    });
                    self.skipping = false;
                    self.skipped = 0;
                } else {
                    self.skipped += 1;
                }
                continue;
            }

            if b == b'\n' {
                events.push(LineEvent::Line(take_line(&mut self.buf)));
            } else {
                self.buf.push(b);
                if self.buf.len() > self.max_buffer_size {
                    self.skipped = self.buf.len();
                    self.buf.clear();
                    self.skipping = true;
                }
            }
        }

        events
    }

    /// Flush at end of stream. A retained partial is emitted as one final
    /// line; an in-progress oversized line is reported as its overflow.
    pub fn finish(&mut self) -> Option<LineEvent> {
        if self.skipping {
            self.skipping = false;
            let discarded = self.skipped;
            self.skipped = 0;
            return Some(LineEvent::Overflow { discarded });
        }
        if self.buf.is_empty() {
            return None;
        }
        Some(LineEvent::Line(take_line(&mut self.buf)))
    }

    /// Bytes currently retained as a partial line.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    let mut bytes = std::mem::take(buf);
    // The agent writes `\n` terminators; tolerate `\r\n` from shells.
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Decode one line as a JSON object.
///
/// Pure function: the caller decides how to surface a failure. Transports
/// report failures as `decode_failure` payloads carrying
/// [`decode_excerpt`]-truncated source text.
pub fn decode_line(line: &str) -> std::result::Result<Value, serde_json::Error> {
    serde_json::from_str(line)
}

/// Truncate an undecodable line for inclusion in a failure report.
pub fn decode_excerpt(line: &str) -> String {
    if line.len() <= DECODE_EXCERPT_BYTES {
        return line.to_string();
    }
    // Cut on a char boundary at or below the cap.
    let mut end = DECODE_EXCERPT_BYTES;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk_multiple_lines() {
        let mut buf = LineBuffer::new();
        let events = buf.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(
            events,
            vec![
                LineEvent::Line("{\"a\":1}".to_string()),
                LineEvent::Line("{\"b\":2}".to_string()),
            ]
        );
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_partial_line_retained_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.pending_len(), 5);
        let events = buf.push(b"1}\n");
        assert_eq!(events, vec![LineEvent::Line("{\"a\":1}".to_string())]);
    }

    #[test]
    fn test_split_utf8_codepoint_survives() {
        let mut buf = LineBuffer::new();
        let text = "héllo\n".as_bytes();
        // Split inside the two-byte 'é'.
        assert!(buf.push(&text[..2]).is_empty());
        let events = buf.push(&text[2..]);
        assert_eq!(events, vec![LineEvent::Line("héllo".to_string())]);
    }

    #[test]
    fn test_finish_flushes_partial() {
        let mut buf = LineBuffer::new();
        buf.push(b"tail without newline");
        assert_eq!(
            buf.finish(),
            Some(LineEvent::Line("tail without newline".to_string()))
        );
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_crlf_tolerated() {
        let mut buf = LineBuffer::new();
        let events = buf.push(b"line\r\n");
        assert_eq!(events, vec![LineEvent::Line("line".to_string())]);
    }

    #[test]
    fn test_overflow_single_signal_then_resync() {
        let mut buf = LineBuffer::with_max_size(8);
        // 20 bytes without a newline: one overflow, not one per chunk.
        let events = buf.push(b"0123456789");
        assert!(events.is_empty());
        let events = buf.push(b"0123456789");
        assert!(events.is_empty());
        // Newline closes the oversized line and reports the total discard.
        let events = buf.push(b"\nok\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], LineEvent::Overflow { discarded } if discarded == 20));
        assert_eq!(events[1], LineEvent::Line("ok".to_string()));
    }

    #[test]
    fn test_overflow_at_end_of_stream() {
        let mut buf = LineBuffer::with_max_size(4);
        buf.push(b"toolong");
        assert!(matches!(buf.finish(), Some(LineEvent::Overflow { .. })));
    }

    #[test]
    fn test_decode_line() {
        let value = decode_line("{\"type\":\"thread.started\"}").unwrap();
        assert_eq!(value["type"], "thread.started");
        assert!(decode_line("not json").is_err());
    }

    #[test]
    fn test_decode_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(300);
        let excerpt = decode_excerpt(&long);
        assert!(excerpt.len() <= DECODE_EXCERPT_BYTES + '…'.len_utf8());
        assert!(excerpt.ends_with('…'));

        let short = "short line";
        assert_eq!(decode_excerpt(short), short);
    }
}
