//! Per-provider SSE translation state machines.
//!
//! Each translator consumes parsed SSE events from the upstream and emits
//! OpenAI-shaped [`StreamChunk`]s. Translators are pure state machines; the
//! pump below owns the IO.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use bytes::Bytes;
use gandalf_protocol::SseParser;

use crate::types::{ChunkStream, StreamChunk};

pub use anthropic::AnthropicTranslator;
pub use gemini::GeminiTranslator;
pub use openai::OpenAiPassthrough;

pub trait StreamTranslator: Send + 'static {
    fn on_event(&mut self, event: &gandalf_protocol::SseEvent) -> Vec<StreamChunk>;

    /// Upstream EOF without an explicit terminator.
    fn finish(&mut self) -> Vec<StreamChunk>;
}

/// Pump upstream bytes through the SSE parser and a translator, producing
/// the lazy chunk channel handed back to the dispatch engine. The task ends
/// when the upstream closes or the downstream receiver is dropped.
pub fn spawn_translation<T: StreamTranslator>(
    mut upstream: tokio::sync::mpsc::Receiver<Bytes>,
    mut translator: T,
) -> ChunkStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(16);
    tokio::spawn(async move {
        let mut parser = SseParser::new();
        while let Some(bytes) = upstream.recv().await {
            for event in parser.push_bytes(&bytes) {
                for chunk in translator.on_event(&event) {
                    let terminal = chunk.done || chunk.err.is_some();
                    if tx.send(chunk).await.is_err() || terminal {
                        return;
                    }
                }
            }
        }
        // Upstream EOF without an explicit terminator (Gemini, truncation).
        for event in parser.finish() {
            for chunk in translator.on_event(&event) {
                let terminal = chunk.done || chunk.err.is_some();
                if tx.send(chunk).await.is_err() || terminal {
                    return;
                }
            }
        }
        for chunk in translator.finish() {
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
    });
    rx
}
