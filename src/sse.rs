//! Line framing for `data: <payload>` event streams.
//!
//! Both hops of a turn speak the same framing: the upstream provider streams
//! OpenAI-style chunks to the relay, and the relay streams normalized
//! `{"content": ...}` payloads to the client. [`LineDecoder`] turns byte reads
//! that may be split anywhere (mid-line, mid-character) into complete lines.

use serde::{Deserialize, Serialize};

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";

/// Normalized payload of one content event on the relay -> client hop.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ContentPayload {
    pub content: String,
}

/// Accumulates byte reads and hands back only complete lines.
///
/// Text after the last newline stays buffered until a later read completes
/// it. Bytes of a code point cut by a read boundary are held back as well.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    buffer: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read; returns every line completed by it, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.decode_utf8(chunk);
        self.drain_lines()
    }

    /// Flush whatever is left once the byte stream has ended.
    pub fn finish(mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.buffer.push_str(&String::from_utf8_lossy(&rest));
        }
        if self.buffer.trim().is_empty() {
            None
        } else {
            Some(self.buffer)
        }
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        let mut start = 0;
        loop {
            let err = match std::str::from_utf8(&input[start..]) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(err) => err,
            };

            let valid_end = start + err.valid_up_to();
            if let Ok(text) = std::str::from_utf8(&input[start..valid_end]) {
                self.buffer.push_str(text);
            }

            match err.error_len() {
                Some(len) => {
                    self.buffer.push(char::REPLACEMENT_CHARACTER);
                    start = valid_end + len;
                }
                None => {
                    // Incomplete sequence at the end: wait for the next read.
                    input.drain(..valid_end);
                    self.pending = input;
                    return;
                }
            }
        }
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        complete.lines().map(str::to_owned).collect()
    }
}

/// Payload of a `data: ` line, or `None` for blank lines, comments and any
/// other field.
pub fn data_payload(line: &str) -> Option<&str> {
    line.trim().strip_prefix(DATA_PREFIX)
}

/// Encode a content delta as the JSON payload of a relay event.
pub fn content_payload(text: &str) -> String {
    serde_json::json!({ "content": text }).to_string()
}

/// Wrap a payload in a complete `data:` frame.
pub fn frame(payload: &str) -> String {
    format!("{}{}\n\n", DATA_PREFIX, payload)
}
