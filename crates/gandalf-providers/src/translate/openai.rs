use bytes::Bytes;
use gandalf_protocol::SseEvent;
use gandalf_protocol::openai::Usage;
use serde::Deserialize;

use crate::types::StreamChunk;

use super::StreamTranslator;

const DONE_MARKER: &str = "[DONE]";

/// Lenient probe for the usage block on an upstream chunk; everything else
/// in the payload passes through untouched.
#[derive(Debug, Deserialize)]
struct UsageProbe {
    #[serde(default)]
    usage: Option<Usage>,
}

/// Zero-translation passthrough for OpenAI-compatible upstreams.
///
/// Chunks carry the raw upstream `data:` payload bytes; the adapter forces
/// `stream_options.include_usage` on, so the final payload before `[DONE]`
/// carries usage and is surfaced on the same chunk.
#[derive(Debug, Default)]
pub struct OpenAiPassthrough;

impl StreamTranslator for OpenAiPassthrough {
    fn on_event(&mut self, event: &SseEvent) -> Vec<StreamChunk> {
        if event.data.is_empty() {
            return Vec::new();
        }
        if event.data == DONE_MARKER {
            return vec![StreamChunk::done()];
        }
        let usage = event.json::<UsageProbe>().and_then(|probe| probe.usage);
        let mut chunk = StreamChunk::data(Bytes::from(event.data.clone()));
        chunk.usage = usage;
        vec![chunk]
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        vec![StreamChunk::done()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_event(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn payload_passes_through_byte_exact() {
        let mut translator = OpenAiPassthrough;
        let payload = r#"{"id":"chatcmpl-1","choices":[{"delta":{"content":"hi"}}]}"#;
        let chunks = translator.on_event(&data_event(payload));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.as_deref(), Some(payload.as_bytes()));
        assert!(chunks[0].usage.is_none());
    }

    #[test]
    fn usage_extracted_from_final_chunk() {
        let mut translator = OpenAiPassthrough;
        let payload = r#"{"id":"chatcmpl-1","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#;
        let chunks = translator.on_event(&data_event(payload));
        assert_eq!(chunks[0].usage.unwrap().total_tokens, 8);
    }

    #[test]
    fn done_marker_terminates() {
        let mut translator = OpenAiPassthrough;
        let chunks = translator.on_event(&data_event("[DONE]"));
        assert!(chunks[0].done);
        assert!(chunks[0].data.is_none());
    }
}
