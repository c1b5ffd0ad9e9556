// SPDX-License-Identifier: MIT OR Apache-2.0
//! Incremental SSE parsing over a chunked byte stream.
//!
//! Chunk boundaries fall anywhere, so the parser buffers until it sees a
//! complete line and dispatches a frame on every blank line. Only the
//! `id`, `event`, and `data` fields matter here; comments are dropped.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    /// `id:` field, when present.
    pub id: Option<String>,
    /// `event:` field, when present.
    pub event: Option<String>,
    /// Concatenated `data:` lines, newline-joined.
    pub data: String,
}

/// Streaming SSE parser; feed it chunks, collect frames.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// A fresh parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "id" => self.id = Some(value.to_string()),
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() && self.id.is_none() && self.event.is_none() {
            return None;
        }
        let frame = SseFrame {
            id: self.id.take(),
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        };
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_frame() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"id: e1\ndata: {\"x\":1}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                id: Some("e1".into()),
                event: None,
                data: "{\"x\":1}".into(),
            }]
        );
    }

    #[test]
    fn frames_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"id: e1\nda").is_empty());
        assert!(parser.feed(b"ta: hello\n").is_empty());
        let frames = parser.feed(b"\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn multiple_data_lines_join_with_newlines() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: one\ndata: two\n\n");
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn comments_and_unknown_fields_are_ignored() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b": keepalive\nretry: 3000\ndata: x\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn crlf_lines_are_tolerated() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"id: e2\r\ndata: y\r\n\r\n");
        assert_eq!(frames[0].id.as_deref(), Some("e2"));
        assert_eq!(frames[0].data, "y");
    }

    #[test]
    fn blank_lines_without_fields_dispatch_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"\n\n\n").is_empty());
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"id: a\ndata: 1\n\nid: b\ndata: 2\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id.as_deref(), Some("a"));
        assert_eq!(frames[1].id.as_deref(), Some("b"));
    }
}
