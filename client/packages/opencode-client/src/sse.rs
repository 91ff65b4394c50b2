/// One dispatched SSE record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Longest line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Incremental SSE line decoder. Bytes are buffered until a full line is
/// available so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    skipping_line: bool,
    event: Option<String>,
    id: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|byte| *byte == b'\n') {
            let end = start + offset;
            let mut line = &self.buffer[start..end];
            start = end + 1;
            if std::mem::take(&mut self.skipping_line) {
                continue;
            }
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            self.apply_line(&line);
        }
        self.buffer.drain(..start);

        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(bytes = self.buffer.len(), "sse: discarding oversized line");
            self.buffer.clear();
            self.skipping_line = true;
        }
        frames
    }

    /// Drop partial state, e.g. after the connection was replaced.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.skipping_line = false;
        self.event = None;
        self.id = None;
        self.data_lines.clear();
    }

    fn apply_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data_lines.is_empty() {
            return None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(SseFrame { event, id, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"id: 1\ndata: {\"type\":").is_empty());
        let frames = decoder.push(b"\"chunk\"}\n\ndata: second\r\n\r\n");
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: None,
                    id: Some("1".to_string()),
                    data: "{\"type\":\"chunk\"}".to_string(),
                },
                SseFrame {
                    event: None,
                    id: None,
                    data: "second".to_string(),
                },
            ]
        );
    }

    #[test]
    fn joins_multiline_data_and_skips_comments() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\n\nevent: message\ndata: a\ndata:b\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn keeps_utf8_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let text = "data: héllo\n\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).expect("multibyte") + 1;
        assert!(decoder.push(&text[..split]).is_empty());
        let frames = decoder.push(&text[split..]);
        assert_eq!(frames[0].data, "héllo");
    }

    #[test]
    fn decodes_many_frames_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let chunk: String = (0..500).map(|index| format!("data: {index}\n\n")).collect();
        let frames = decoder.push(chunk.as_bytes());
        assert_eq!(frames.len(), 500);
        assert_eq!(frames[499].data, "499");
        assert!(decoder.buffer.is_empty());
    }

    #[test]
    fn oversized_line_is_dropped_and_decoding_recovers() {
        let mut decoder = SseDecoder::new();
        let mut huge = b"data: ".to_vec();
        huge.resize(MAX_LINE_BYTES + 16, b'x');
        assert!(decoder.push(&huge).is_empty());
        assert!(decoder.buffer.is_empty());

        let frames = decoder.push(b"xxxx\n\ndata: ok\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "ok");
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: partial\n");
        decoder.reset();
        let frames = decoder.push(b"data: fresh\n\n");
        assert_eq!(frames[0].data, "fresh");
    }
}
