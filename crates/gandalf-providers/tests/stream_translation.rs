use bytes::Bytes;
use gandalf_protocol::openai::ChatCompletionChunk;
use gandalf_providers::StreamChunk;
use gandalf_providers::translate::{
    AnthropicTranslator, GeminiTranslator, OpenAiPassthrough, spawn_translation,
};

/// Feed raw upstream bytes (split arbitrarily) into a translation pump and
/// collect every emitted chunk.
async fn run_pump<T: gandalf_providers::translate::StreamTranslator>(
    frames: Vec<&'static str>,
    translator: T,
) -> Vec<StreamChunk> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        for frame in frames {
            if tx.send(Bytes::from_static(frame.as_bytes())).await.is_err() {
                return;
            }
        }
    });

    let mut chunks = spawn_translation(rx, translator);
    let mut out = Vec::new();
    while let Some(chunk) = chunks.recv().await {
        out.push(chunk);
    }
    out
}

fn parse_chunk(chunk: &StreamChunk) -> ChatCompletionChunk {
    serde_json::from_slice(chunk.data.as_ref().expect("data chunk")).expect("openai chunk json")
}

#[tokio::test]
async fn openai_passthrough_preserves_payloads_and_usage() {
    let chunks = run_pump(
        vec![
            "data: {\"id\":\"chatcmpl-1\",\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n",
            // Frame split mid-event to exercise the incremental parser.
            "data: {\"id\":\"chatcmpl-1\",\"choices\":[],\"usage\":{\"prompt_tokens\":2,",
            "\"completion_tokens\":3,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        ],
        OpenAiPassthrough,
    )
    .await;

    assert_eq!(chunks.len(), 3);
    assert!(
        String::from_utf8_lossy(chunks[0].data.as_ref().unwrap()).contains("\"content\":\"He\"")
    );
    assert_eq!(chunks[1].usage.unwrap().total_tokens, 5);
    assert!(chunks[2].done);
}

#[tokio::test]
async fn anthropic_stream_end_to_end() {
    let chunks = run_pump(
        vec![
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet\",\"usage\":{\"input_tokens\":9}}}\n\n",
            "event: ping\ndata: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ],
        AnthropicTranslator::new("claude-sonnet", 7),
    )
    .await;

    // role chunk + 2 text chunks + finish + usage + done.
    assert_eq!(chunks.len(), 6);
    let role = parse_chunk(&chunks[0]);
    assert_eq!(role.choices[0].delta.role.as_deref(), Some("assistant"));

    let text: String = chunks[1..3]
        .iter()
        .map(|c| parse_chunk(c).choices[0].delta.content.clone().unwrap())
        .collect();
    assert_eq!(text, "Hello");

    let finish = parse_chunk(&chunks[3]);
    assert_eq!(finish.choices[0].finish_reason.as_deref(), Some("stop"));

    let usage = chunks[4].usage.unwrap();
    assert_eq!(usage.prompt_tokens, 9);
    assert_eq!(usage.completion_tokens, 4);
    assert!(chunks[5].done);
}

#[tokio::test]
async fn anthropic_error_event_terminates_with_error() {
    let chunks = run_pump(
        vec![
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet\"}}\n\n",
            "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        ],
        AnthropicTranslator::new("claude-sonnet", 7),
    )
    .await;

    let last = chunks.last().unwrap();
    assert_eq!(last.err.as_ref().unwrap().message(), "Overloaded");
}

#[tokio::test]
async fn gemini_stream_is_eof_terminated() {
    let chunks = run_pump(
        vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"!\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":2,\"totalTokenCount\":3}}\r\n\r\n",
        ],
        GeminiTranslator::new("req-1", "gemini-pro", 7),
    )
    .await;

    // 2 content chunks, then the EOF-driven usage chunk and done sentinel.
    assert_eq!(chunks.len(), 4);
    let text: String = chunks[..2]
        .iter()
        .map(|c| parse_chunk(c).choices[0].delta.content.clone().unwrap())
        .collect();
    assert_eq!(text, "Hi!");
    assert_eq!(chunks[2].usage.unwrap().total_tokens, 3);
    assert!(chunks[3].done);
}

#[tokio::test]
async fn dropped_receiver_stops_the_pump() {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    let chunks = spawn_translation(rx, OpenAiPassthrough);
    drop(chunks);
    // The pump exits once its sends fail; the upstream sender observes the
    // closed channel instead of blocking forever.
    for _ in 0..64 {
        if tx
            .send(Bytes::from_static(b"data: {\"id\":\"x\"}\n\n"))
            .await
            .is_err()
        {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("pump kept reading after the receiver was dropped");
}
