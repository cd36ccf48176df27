//! Incremental framing of JSON values from a byte stream.
//!
//! There is no length prefix on the wire: a message ends where its outermost
//! object or array closes. The reader tracks nesting depth and string
//! escapes across calls to [JsonReader::push], so where the stream happens
//! to be split never changes what comes out.

use serde_json::Value;

/// Accumulates bytes until one complete top-level JSON value is available.
#[derive(Debug, Default)]
pub struct JsonReader {
    buffer: Vec<u8>,
    scan: usize,
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes held that have not yet been returned as a value.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete value out of the buffer.
    ///
    /// Returns `None` when more bytes are needed. A framed value that is not
    /// valid JSON is returned as an error and dropped, so the reader stays
    /// usable for whatever follows it.
    pub fn next_value(&mut self) -> Option<Result<Value, serde_json::Error>> {
        while self.scan < self.buffer.len() {
            let index = self.scan;
            let byte = self.buffer[index];
            self.scan += 1;

            let Some(start) = self.start else {
                if byte.is_ascii_whitespace() {
                    continue;
                }
                self.start = Some(index);
                match byte {
                    b'{' | b'[' => self.depth = 1,
                    b'"' => self.in_string = true,
                    _ => {}
                }
                continue;
            };

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return Some(self.complete(start, index + 1));
                    }
                }
                continue;
            }

            if self.depth == 0 {
                // Top-level scalar, which runs until the next separator.
                if byte.is_ascii_whitespace() || matches!(byte, b'{' | b'[' | b'"') {
                    self.scan = index;
                    return Some(self.complete(start, index));
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Some(self.complete(start, index + 1));
                    }
                }
                _ => {}
            }
        }

        if self.start.is_none() {
            // Only whitespace was scanned.
            self.buffer.clear();
            self.scan = 0;
        }
        None
    }

    /// Hand every buffered byte to the caller and reset framing state.
    ///
    /// Used when a raw sub-protocol takes over the stream; anything it does
    /// not consume is pushed back afterwards.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        let buffer = std::mem::take(&mut self.buffer);
        self.reset();
        buffer
    }

    fn complete(&mut self, start: usize, end: usize) -> Result<Value, serde_json::Error> {
        let parsed = serde_json::from_slice(&self.buffer[start..end]);
        self.buffer.drain(..end);
        self.scan -= end;
        self.start = None;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        parsed
    }

    fn reset(&mut self) {
        self.scan = 0;
        self.start = None;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn frame_in_chunks(input: &[u8], chunk: usize) -> Vec<Option<Value>> {
        let mut reader = JsonReader::new();
        let mut out = vec![];
        for piece in input.chunks(chunk) {
            reader.push(piece);
            while let Some(value) = reader.next_value() {
                out.push(value.ok());
            }
        }
        out
    }

    const STREAM: &[u8] = br#"{"jsonrpc":"2.0","method":"print","params":{"name":"a } b \" {"},"id":1}
  [{"jsonrpc":"2.0","method":"x"},{"jsonrpc":"2.0","result":[1,[2]],"id":2}]{"broken": }  {"jsonrpc":"2.0","method":"tail"}"#;

    #[test]
    fn test_chunking_does_not_change_frames() {
        let whole = frame_in_chunks(STREAM, STREAM.len());
        assert_eq!(whole.len(), 4);
        assert_eq!(
            whole[0],
            Some(json!({"jsonrpc": "2.0", "method": "print", "params": {"name": "a } b \" {"}, "id": 1}))
        );
        assert_eq!(whole[2], None);
        assert_eq!(whole[3], Some(json!({"jsonrpc": "2.0", "method": "tail"})));

        for chunk in [1, 2, 3, 10] {
            assert_eq!(frame_in_chunks(STREAM, chunk), whole, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_partial_value_is_kept() {
        let mut reader = JsonReader::new();
        reader.push(br#"{"jsonrpc":"2.0","#);
        assert!(reader.next_value().is_none());
        assert!(reader.next_value().is_none());
        reader.push(br#""method":"ping"}"#);
        assert_eq!(
            reader.next_value().unwrap().unwrap(),
            json!({"jsonrpc": "2.0", "method": "ping"})
        );
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_top_level_scalars() {
        let mut reader = JsonReader::new();
        reader.push(b"12");
        assert!(reader.next_value().is_none());
        reader.push(b"3 \"hi\"{}");
        assert_eq!(reader.next_value().unwrap().unwrap(), json!(123));
        assert_eq!(reader.next_value().unwrap().unwrap(), json!("hi"));
        assert_eq!(reader.next_value().unwrap().unwrap(), json!({}));
        assert!(reader.next_value().is_none());
    }

    #[test]
    fn test_garbage_is_reported_and_skipped() {
        let mut reader = JsonReader::new();
        reader.push(b"nope {\"a\":1}");
        assert!(reader.next_value().unwrap().is_err());
        assert_eq!(reader.next_value().unwrap().unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_take_buffered_hands_over_trailing_bytes() {
        let mut reader = JsonReader::new();
        reader.push(b"{\"a\":1}\n\x00\x01{\"b\"");
        assert_eq!(reader.next_value().unwrap().unwrap(), json!({"a": 1}));
        assert_eq!(reader.take_buffered(), b"\n\x00\x01{\"b\"".to_vec());
        assert_eq!(reader.buffered(), 0);

        reader.push(b"{\"c\":2}");
        assert_eq!(reader.next_value().unwrap().unwrap(), json!({"c": 2}));
    }
}
