use std::collections::BTreeMap;

use bytes::Bytes;
use gandalf_common::{Error, ErrorKind};
use gandalf_protocol::anthropic::{
    ContentBlock, ContentBlockDelta, KnownEvent, StreamEvent,
};
use gandalf_protocol::openai::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ToolCallDelta, ToolCallDeltaFunction, Usage,
};
use gandalf_protocol::{FinishReason, SseEvent};

use crate::types::StreamChunk;

use super::StreamTranslator;

/// Event-typed Anthropic Messages stream → OpenAI chat completion chunks.
///
/// Accumulates input/output token counts and the stop reason across the
/// stream; `message_stop` flushes the finish chunk, the usage chunk, and the
/// `done` sentinel.
#[derive(Debug)]
pub struct AnthropicTranslator {
    id: String,
    model: String,
    created: i64,
    input_tokens: u32,
    output_tokens: u32,
    finish_reason: FinishReason,
    /// Upstream content-block index → OpenAI tool_calls slot.
    tool_slots: BTreeMap<u32, u32>,
}

impl AnthropicTranslator {
    pub fn new(model: impl Into<String>, created: i64) -> Self {
        Self {
            id: "unknown".to_string(),
            model: model.into(),
            created,
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            tool_slots: BTreeMap::new(),
        }
    }

    fn on_known(&mut self, event: KnownEvent) -> Vec<StreamChunk> {
        match event {
            KnownEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                if let Some(usage) = message.usage
                    && let Some(input) = usage.input_tokens
                {
                    self.input_tokens = input;
                }
                vec![self.chunk(
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        ..ChunkDelta::default()
                    },
                    None,
                )]
            }
            KnownEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::ToolUse { id, name } => {
                    let slot = self.tool_slots.len() as u32;
                    self.tool_slots.insert(index, slot);
                    vec![self.tool_chunk(
                        slot,
                        Some(id),
                        ToolCallDeltaFunction {
                            name: Some(name),
                            arguments: None,
                        },
                    )]
                }
                ContentBlock::Text { text } if !text.is_empty() => {
                    vec![self.text_chunk(text)]
                }
                _ => Vec::new(),
            },
            KnownEvent::ContentBlockDelta { index, delta } => match delta {
                ContentBlockDelta::TextDelta { text } if !text.is_empty() => {
                    vec![self.text_chunk(text)]
                }
                ContentBlockDelta::InputJsonDelta { partial_json }
                    if !partial_json.is_empty() =>
                {
                    let slot = self.tool_slots.get(&index).copied().unwrap_or(0);
                    vec![self.tool_chunk(
                        slot,
                        None,
                        ToolCallDeltaFunction {
                            name: None,
                            arguments: Some(partial_json),
                        },
                    )]
                }
                _ => Vec::new(),
            },
            KnownEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.finish_reason = FinishReason::from_anthropic(reason);
                }
                if let Some(usage) = usage
                    && let Some(output) = usage.output_tokens
                {
                    self.output_tokens = output;
                }
                Vec::new()
            }
            KnownEvent::MessageStop => {
                let finish = self.chunk(ChunkDelta::default(), Some(self.finish_reason));
                let usage =
                    StreamChunk::usage(Usage::new(self.input_tokens, self.output_tokens));
                vec![finish, usage, StreamChunk::done()]
            }
            KnownEvent::Error { error } => {
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("upstream stream error");
                vec![StreamChunk::err(Error::new(
                    ErrorKind::Provider,
                    message.to_string(),
                ))]
            }
            KnownEvent::Ping | KnownEvent::ContentBlockStop { .. } => Vec::new(),
        }
    }

    fn text_chunk(&self, text: String) -> StreamChunk {
        self.chunk(
            ChunkDelta {
                content: Some(text),
                ..ChunkDelta::default()
            },
            None,
        )
    }

    fn tool_chunk(
        &self,
        slot: u32,
        id: Option<String>,
        function: ToolCallDeltaFunction,
    ) -> StreamChunk {
        self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: slot,
                    id,
                    kind: Some("function".to_string()),
                    function: Some(function),
                }]),
                ..ChunkDelta::default()
            },
            None,
        )
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

impl StreamTranslator for AnthropicTranslator {
    fn on_event(&mut self, event: &SseEvent) -> Vec<StreamChunk> {
        match event.json::<StreamEvent>() {
            Some(StreamEvent::Known(known)) => self.on_known(known),
            Some(StreamEvent::Unknown(_)) | None => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        vec![StreamChunk::done()]
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

    fn delta_content(chunk: &StreamChunk) -> Option<String> {
        let parsed: ChatCompletionChunk =
            serde_json::from_slice(chunk.data.as_ref()?).ok()?;
        parsed.choices.first()?.delta.content.clone()
    }

    #[test]
    fn full_stream_translation() {
        let mut t = AnthropicTranslator::new("claude-sonnet", 1);

        let start = t.on_event(&event(
            r#"{"type":"message_start","message":{"id":"msg_1","model":"claude-sonnet","usage":{"input_tokens":7}}}"#,
        ));
        assert_eq!(start.len(), 1);
        let parsed: ChatCompletionChunk =
            serde_json::from_slice(start[0].data.as_ref().unwrap()).unwrap();
        assert_eq!(parsed.choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(parsed.id, "msg_1");

        let text = t.on_event(&event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        ));
        assert_eq!(delta_content(&text[0]).as_deref(), Some("Hello"));

        let silent = t.on_event(&event(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":3}}"#,
        ));
        assert!(silent.is_empty());

        let stop = t.on_event(&event(r#"{"type":"message_stop"}"#));
        assert_eq!(stop.len(), 3);
        let finish: ChatCompletionChunk =
            serde_json::from_slice(stop[0].data.as_ref().unwrap()).unwrap();
        assert_eq!(finish.choices[0].finish_reason.as_deref(), Some("stop"));
        let usage = stop[1].usage.unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
        assert!(stop[2].done);
    }

    #[test]
    fn tool_use_maps_to_tool_calls() {
        let mut t = AnthropicTranslator::new("claude-sonnet", 1);
        let start = t.on_event(&event(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"get_weather"}}"#,
        ));
        let parsed: ChatCompletionChunk =
            serde_json::from_slice(start[0].data.as_ref().unwrap()).unwrap();
        let call = &parsed.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id.as_deref(), Some("tu_1"));
        assert_eq!(
            call.function.as_ref().unwrap().name.as_deref(),
            Some("get_weather")
        );

        let args = t.on_event(&event(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"city\":"}}"#,
        ));
        let parsed: ChatCompletionChunk =
            serde_json::from_slice(args[0].data.as_ref().unwrap()).unwrap();
        let call = &parsed.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.index, 0);
        assert_eq!(
            call.function.as_ref().unwrap().arguments.as_deref(),
            Some("{\"city\":")
        );

        let delta = t.on_event(&event(
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#,
        ));
        assert!(delta.is_empty());
        let stop = t.on_event(&event(r#"{"type":"message_stop"}"#));
        let finish: ChatCompletionChunk =
            serde_json::from_slice(stop[0].data.as_ref().unwrap()).unwrap();
        assert_eq!(
            finish.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[test]
    fn ping_dropped_and_error_surfaces() {
        let mut t = AnthropicTranslator::new("claude-sonnet", 1);
        assert!(t.on_event(&event(r#"{"type":"ping"}"#)).is_empty());

        let err = t.on_event(&event(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ));
        assert_eq!(err[0].err.as_ref().unwrap().message(), "Overloaded");
    }
}
