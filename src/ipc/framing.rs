//! Newline-delimited JSON framing for the worker's stdout.
//!
//! The worker writes one JSON record per line. Stdout arrives in arbitrary
//! chunks, so a record may be split across reads (even inside a multi-byte
//! UTF-8 sequence). `LineFramer` buffers raw bytes and only parses once a
//! full line is present.
//!
//! # Wire Format
//!
//! ```text
//! {"type":"startup","status":"ready"}\n
//! {"correlationId":"9b1c...","result":{"x":1}}\n
//! ```
//!
//! Both LF and CRLF line endings are accepted.

use serde_json::Value;
use tracing::{debug, warn};

use crate::ipc::envelope::Inbound;

/// Default maximum line size (16MB) to prevent OOM from a worker that never
/// terminates its output.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Splits a chunked byte stream into parsed inbound records.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line_bytes: usize,
    /// Set while discarding the tail of an oversized line.
    skipping: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes,
            skipping: false,
        }
    }

    /// Number of buffered bytes not yet terminated by a newline.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and return every record completed by it.
    ///
    /// Empty lines are skipped silently. Lines that are not valid JSON are
    /// logged and dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Inbound> {
        let mut records = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.skipping {
                // Tail of an oversized line; drop it and resume normally.
                self.skipping = false;
                self.buffer.clear();
                continue;
            }

            self.buffer.extend_from_slice(head);
            let line = std::mem::take(&mut self.buffer);
            if let Some(record) = parse_line(&line) {
                records.push(record);
            }
        }

        if !self.skipping {
            self.buffer.extend_from_slice(rest);
            if self.buffer.len() > self.max_line_bytes {
                warn!(
                    "Worker output line exceeds maximum {} bytes, discarding",
                    self.max_line_bytes
                );
                self.buffer.clear();
                self.skipping = true;
            }
        }

        records
    }

    /// Flush at end of stream. An unterminated trailing fragment is dropped.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            warn!(
                "Discarding {} bytes of unterminated worker output at EOF",
                self.buffer.len()
            );
            self.buffer.clear();
        }
        self.skipping = false;
    }
}

/// Parse one line (without its `\n`) into a classified record.
fn parse_line(line: &[u8]) -> Option<Inbound> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            warn!("Invalid UTF-8 in worker output: {}", e);
            return None;
        }
    };

    // Trim both CRLF and surrounding whitespace
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Some(Inbound::classify(value)),
        Err(e) => {
            warn!("Dropping non-JSON worker output ({}): {}", e, truncate(trimmed, 200));
            debug!("Full dropped line: {}", trimmed);
            None
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn response_ids(records: &[Inbound]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| match r {
                Inbound::Response { correlation_id, .. } => Some(correlation_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn result_of(record: Inbound) -> Value {
        match record {
            Inbound::Response { outcome, .. } => outcome.expect("success response"),
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_single_complete_record() {
        let mut framer = LineFramer::default();
        let records = framer.push(b"{\"correlationId\":\"a\",\"result\":1}\n");
        assert_eq!(response_ids(&records), vec!["a"]);
        assert_eq!(framer.pending_bytes(), 0);
    }

    #[test]
    fn test_multiple_records_in_one_chunk() {
        let mut framer = LineFramer::default();
        let records = framer.push(
            b"{\"type\":\"startup\",\"status\":\"ready\"}\n{\"correlationId\":\"a\",\"result\":1}\n{\"correlationId\":\"b\",\"error\":\"x\"}\n",
        );
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], Inbound::Startup));
        assert_eq!(response_ids(&records), vec!["a", "b"]);
    }

    #[test]
    fn test_split_at_every_boundary_matches_unsplit() {
        let line = "{\"correlationId\":\"split\",\"result\":{\"name\":\"paracétamol\",\"dose\":[500,1000]}}\n";
        let bytes = line.as_bytes();

        let mut whole = LineFramer::default();
        let expected = result_of(whole.push(bytes).remove(0));

        for cut in 1..bytes.len() {
            let mut framer = LineFramer::default();
            let first = framer.push(&bytes[..cut]);
            assert!(first.is_empty(), "cut at {} produced early record", cut);
            let mut second = framer.push(&bytes[cut..]);
            assert_eq!(second.len(), 1, "cut at {}", cut);
            assert_eq!(result_of(second.remove(0)), expected);
        }
    }

    #[test]
    fn test_record_split_across_three_chunks() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"{\"correlationId\":").is_empty());
        assert!(framer.push(b"\"c\",\"result\"").is_empty());
        let records = framer.push(b":{\"x\":1}}\n{\"correlationId\":\"d\"");
        assert_eq!(records.len(), 1);
        assert_eq!(result_of(records.into_iter().next().unwrap()), json!({"x": 1}));
        assert!(framer.pending_bytes() > 0);
    }

    #[test]
    fn test_empty_and_crlf_lines() {
        let mut framer = LineFramer::default();
        let records = framer.push(b"\n   \r\n{\"correlationId\":\"a\",\"result\":true}\r\n\n");
        assert_eq!(response_ids(&records), vec!["a"]);
    }

    #[test]
    fn test_invalid_json_is_dropped_and_stream_continues() {
        let mut framer = LineFramer::default();
        let records = framer.push(b"Loading model weights...\n{\"correlationId\":\"ok\",\"result\":1}\n");
        assert_eq!(response_ids(&records), vec!["ok"]);
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let mut framer = LineFramer::new(16);
        assert!(framer.push(b"{\"correlationId\":\"xxxxxxxxxxxx").is_empty());
        assert_eq!(framer.pending_bytes(), 0);
        // Remainder of the oversized line is skipped, the next line parses.
        let records = framer.push(b"\",\"result\":1}\n{\"correlationId\":\"a\",\"result\":2}\n");
        assert_eq!(response_ids(&records), vec!["a"]);
    }

    #[test]
    fn test_finish_discards_trailing_fragment() {
        let mut framer = LineFramer::default();
        framer.push(b"{\"correlationId\":\"partial\"");
        framer.finish();
        assert_eq!(framer.pending_bytes(), 0);
        assert!(framer.push(b"\n").is_empty());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
