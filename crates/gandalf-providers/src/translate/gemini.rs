use bytes::Bytes;
use gandalf_common::{Error, ErrorKind};
use gandalf_protocol::gemini;
use gandalf_protocol::openai::{ChatCompletionChunk, ChunkChoice, ChunkDelta, Usage};
use gandalf_protocol::{FinishReason, SseEvent};

use crate::types::StreamChunk;

use super::StreamTranslator;

/// Gemini streamGenerateContent → OpenAI chat completion chunks.
///
/// The upstream is EOF-terminated (no `[DONE]`); every `data:` line is a
/// complete JSON object carrying candidates plus a cumulative
/// `usageMetadata`. The final usage chunk and `done` sentinel are emitted at
/// channel close.
#[derive(Debug)]
pub struct GeminiTranslator {
    id: String,
    model: String,
    created: i64,
    usage: Option<gemini::UsageMetadata>,
}

impl GeminiTranslator {
    pub fn new(request_id: &str, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: format!("chatcmpl-{request_id}"),
            model: model.into(),
            created,
            usage: None,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<FinishReason>) -> StreamChunk {
        let mut chunk = ChatCompletionChunk::new(self.id.clone(), self.model.clone(), self.created);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish_reason.map(|r| r.as_str().to_string()),
        });
        match serde_json::to_vec(&chunk) {
            Ok(bytes) => StreamChunk::data(Bytes::from(bytes)),
            Err(err) => StreamChunk::err(Error::wrap(
                ErrorKind::Internal,
                "chunk serialization failed",
                err,
            )),
        }
    }
}

impl StreamTranslator for GeminiTranslator {
    fn on_event(&mut self, event: &SseEvent) -> Vec<StreamChunk> {
        let Some(parsed) = event.json::<gemini::StreamChunk>() else {
            return Vec::new();
        };
        if parsed.usage_metadata.is_some() {
            self.usage = parsed.usage_metadata;
        }

        let text = parsed.first_candidate_text();
        let finish = parsed.finish_reason().map(FinishReason::from_gemini);
        if text.is_none() && finish.is_none() {
            return Vec::new();
        }
        vec![self.chunk(
            ChunkDelta {
                content: text,
                ..ChunkDelta::default()
            },
            finish,
        )]
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if let Some(meta) = self.usage {
            out.push(StreamChunk::usage(Usage {
                prompt_tokens: meta.prompt_token_count,
                completion_tokens: meta.candidates_token_count,
                total_tokens: meta.total_token_count,
            }));
        }
        out.push(StreamChunk::done());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn chunks_in_order_then_usage_then_done() {
        let mut t = GeminiTranslator::new("req-1", "gemini-pro", 1);

        let first = t.on_event(&event(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hel"}]}}]}"#,
        ));
        let parsed: ChatCompletionChunk =
            serde_json::from_slice(first[0].data.as_ref().unwrap()).unwrap();
        assert_eq!(parsed.choices[0].delta.content.as_deref(), Some("Hel"));
        assert_eq!(parsed.id, "chatcmpl-req-1");

        let last = t.on_event(&event(
            r#"{"candidates":[{"content":{"parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":2,"candidatesTokenCount":3,"totalTokenCount":5}}"#,
        ));
        let parsed: ChatCompletionChunk =
            serde_json::from_slice(last[0].data.as_ref().unwrap()).unwrap();
        assert_eq!(parsed.choices[0].finish_reason.as_deref(), Some("stop"));

        let tail = t.finish();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].usage.unwrap().total_tokens, 5);
        assert!(tail[1].done);
    }

    #[test]
    fn safety_maps_to_content_filter() {
        let mut t = GeminiTranslator::new("req-1", "gemini-pro", 1);
        let chunks = t.on_event(&event(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#));
        let parsed: ChatCompletionChunk =
            serde_json::from_slice(chunks[0].data.as_ref().unwrap()).unwrap();
        assert_eq!(
            parsed.choices[0].finish_reason.as_deref(),
            Some("content_filter")
        );
    }

    #[test]
    fn eof_without_usage_still_emits_done() {
        let mut t = GeminiTranslator::new("req-1", "gemini-pro", 1);
        let tail = t.finish();
        assert_eq!(tail.len(), 1);
        assert!(tail[0].done);
    }
}
