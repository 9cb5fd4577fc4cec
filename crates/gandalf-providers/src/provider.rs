use async_trait::async_trait;
use gandalf_common::Result;
use gandalf_protocol::openai::{ChatCompletionRequest, EmbeddingsRequest, ModelEntry};

use crate::types::{
    ChatResponse, ChunkStream, NativeProxyRequest, NativeProxyResponse, ProviderCtx, ProviderKind,
};

/// One upstream LLM service behind the gateway.
///
/// Adapters accept OpenAI-shaped requests and return OpenAI-shaped bodies;
/// provider-native translation happens inside the adapter. The request's
/// `model` field already carries the upstream model name when the dispatch
/// engine calls in.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    async fn chat(&self, ctx: &ProviderCtx, req: &ChatCompletionRequest) -> Result<ChatResponse>;

    /// Lazy stream of OpenAI-shaped chunks, terminated by a `done`/`err`
    /// sentinel (or channel close, which counts as `done`).
    async fn chat_stream(
        &self,
        ctx: &ProviderCtx,
        req: &ChatCompletionRequest,
    ) -> Result<ChunkStream>;

    async fn embeddings(&self, ctx: &ProviderCtx, req: &EmbeddingsRequest)
    -> Result<ChatResponse>;

    async fn list_models(&self, ctx: &ProviderCtx) -> Result<Vec<ModelEntry>>;

    async fn health_check(&self, ctx: &ProviderCtx) -> Result<()>;

    /// Raw-forwarding capability; `None` when the adapter does not expose a
    /// native surface.
    fn native(&self) -> Option<&dyn NativeProxy> {
        None
    }
}

/// Optional raw passthrough capability, queried on the provider rather than
/// modeled as a method that fails with "unsupported".
#[async_trait]
pub trait NativeProxy: Send + Sync {
    async fn proxy(
        &self,
        ctx: &ProviderCtx,
        req: NativeProxyRequest,
    ) -> Result<NativeProxyResponse>;
}
