use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;

/// One upstream SSE event: optional `event:` name plus the joined `data:`
/// payload. Stream translators feed the payload straight into serde via
/// [`SseEvent::json`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Decode the data payload as JSON; `None` on empty or undecodable
    /// payloads (translators drop those).
    pub fn json<T: DeserializeOwned>(&self) -> Option<T> {
        if self.data.is_empty() {
            return None;
        }
        serde_json::from_str(&self.data).ok()
    }
}

/// Incremental SSE reader fed from arbitrary upstream byte chunks.
///
/// Bytes accumulate until a blank line completes a block; each complete
/// block is parsed as one event in a single pass. Only `event` and `data`
/// fields matter to the gateway; comments and other fields are dropped.
/// Field values with invalid UTF-8 are replaced lossily rather than
/// discarding the surrounding event. `finish()` parses a trailing
/// unterminated block (Gemini streams end at EOF without a terminator).
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        self.drain_complete_blocks()
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk.as_bytes());
        self.drain_complete_blocks()
    }

    /// Flush whatever is buffered at upstream EOF.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let tail = self.buffer.split();
        parse_block(&tail).into_iter().collect()
    }

    fn drain_complete_blocks(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Some(boundary) = find_block_end(&self.buffer) {
            let block = self.buffer.split_to(boundary.next_start);
            if let Some(event) = parse_block(&block[..boundary.block_len]) {
                events.push(event);
            }
        }
        events
    }
}

struct BlockBoundary {
    /// Bytes belonging to the block (up to the blank line).
    block_len: usize,
    /// First byte after the blank line.
    next_start: usize,
}

/// A block is terminated by the first empty line (`\n` or `\r\n`).
fn find_block_end(buf: &[u8]) -> Option<BlockBoundary> {
    let mut line_start = 0;
    for (i, byte) in buf.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        if strip_cr(&buf[line_start..i]).is_empty() {
            return Some(BlockBoundary {
                block_len: line_start,
                next_start: i + 1,
            });
        }
        line_start = i + 1;
    }
    None
}

/// Parse one complete block into an event, or `None` when the block carries
/// neither an event name nor data (comment-only blocks, keep-alives).
fn parse_block(block: &[u8]) -> Option<SseEvent> {
    let mut event: Option<String> = None;
    let mut data: Option<String> = None;

    for raw_line in block.split(|b| *b == b'\n') {
        let line = strip_cr(raw_line);
        if line.is_empty() || line[0] == b':' {
            continue;
        }
        // A line without a colon is a field name with an empty value.
        let (field, value) = match line.iter().position(|b| *b == b':') {
            Some(pos) => (&line[..pos], strip_leading_space(&line[pos + 1..])),
            None => (line, &[][..]),
        };
        match field {
            b"event" => {
                let name = String::from_utf8_lossy(value).into_owned();
                event = (!name.is_empty()).then_some(name);
            }
            b"data" => {
                let value = String::from_utf8_lossy(value);
                match &mut data {
                    Some(joined) => {
                        joined.push('\n');
                        joined.push_str(&value);
                    }
                    None => data = Some(value.into_owned()),
                }
            }
            _ => {}
        }
    }

    if event.is_none() && data.is_none() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.unwrap_or_default(),
    })
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn strip_leading_space(value: &[u8]) -> &[u8] {
    value.strip_prefix(b" ").unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_events() {
        let mut parser = SseParser::new();
        let events =
            parser.push_str("event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn reassembles_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: hel").is_empty());
        assert!(parser.push_str("lo\n").is_empty());
        let events = parser.push_str("\n");
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn several_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: one\n\ndata: two\n\ndata: thr");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
        assert_eq!(parser.push_str("ee\n\n")[0].data, "three");
    }

    #[test]
    fn joins_multiple_data_lines() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn drops_comments_and_handles_crlf() {
        let mut parser = SseParser::new();
        let events = parser.push_str(": keep-alive\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn comment_only_block_yields_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.push_str(": ping\n\n").is_empty());
    }

    #[test]
    fn bare_field_names_have_empty_values() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data\ndata: x\n\n");
        assert_eq!(events[0].data, "\nx");
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn json_helper_decodes_payload() {
        let event = SseEvent {
            event: None,
            data: "{\"candidates\":[]}".to_string(),
        };
        assert!(event.json::<serde_json::Value>().is_some());
        let empty = SseEvent::default();
        assert!(empty.json::<serde_json::Value>().is_none());
    }
}
