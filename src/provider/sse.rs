//! Server-Sent Events frame decoding for streamed model responses

use serde::de::DeserializeOwned;
use tracing::warn;

/// Incremental SSE decoder.
///
/// Bytes arrive in arbitrary chunks, possibly splitting a UTF-8 sequence;
/// only complete lines are decoded. Complete `data:` lines come out as
/// frames and the remainder stays buffered. The buffer is capped so a
/// malformed stream cannot grow it without bound.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    const MAX_BUFFER_SIZE: usize = 1024 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();

            // Comments (":keep-alive") and event/id fields carry nothing we use
            if let Some(data) = line.strip_prefix("data:") {
                frames.push(SseFrame {
                    data: data.trim_start().to_string(),
                });
            }
        }

        if self.buffer.len() > Self::MAX_BUFFER_SIZE {
            warn!(
                limit_kb = Self::MAX_BUFFER_SIZE / 1024,
                "SSE line over limit, discarding it"
            );
            self.buffer.clear();
        }
        frames
    }

    pub fn has_remaining(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }
}

/// One `data:` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub data: String,
}

impl SseFrame {
    /// The `[DONE]` sentinel that ends an OpenAI-style stream
    pub fn is_done(&self) -> bool {
        self.data == "[DONE]"
    }

    pub fn parse<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.data)
    }

    /// First 200 characters, for log lines
    pub fn preview(&self) -> String {
        match self.data.char_indices().nth(200) {
            Some((idx, _)) => format!("{}...", &self.data[..idx]),
            None => self.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        assert!(decoder.has_remaining());

        let frames = decoder.push(b"1}\n\ndata: [DONE]\n");
        assert_eq!(frames.len(), 2);
        let value: Value = frames[0].parse().unwrap();
        assert_eq!(value["a"], 1);
        assert!(frames[1].is_done());
        assert!(!decoder.has_remaining());
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let bytes = "data: h\u{e9}llo\n".as_bytes();
        // Split inside the two-byte encoding of the accented letter
        let split = "data: h".len() + 1;

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let frames = decoder.push(&bytes[split..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "h\u{e9}llo");
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let mut decoder = SseDecoder::new();
        let junk = vec![b'x'; SseDecoder::MAX_BUFFER_SIZE + 1];
        assert!(decoder.push(&junk).is_empty());
        assert!(!decoder.has_remaining());

        let frames = decoder.push(b"data: next\n");
        assert_eq!(frames[0].data, "next");
    }

    #[test]
    fn test_ignores_comments_and_other_fields() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\nevent: message\nid: 7\ndata:x\n");
        assert_eq!(frames, vec![SseFrame { data: "x".into() }]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: hello\r\n\r\n");
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let frame = SseFrame {
            data: "é".repeat(300),
        };
        let preview = frame.preview();
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 203);
    }
}
