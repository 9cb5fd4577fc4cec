//! Provider adapters for the gateway.
//!
//! This crate owns everything between the dispatch engine and the upstream
//! wire: the `Provider` trait, the optional `NativeProxy` capability, the
//! pooled HTTP client, and the per-provider stream translators that turn
//! upstream SSE into OpenAI-shaped chunks.

pub mod adapters;
pub mod http;
pub mod native;
pub mod provider;
pub mod registry;
pub mod translate;
pub mod types;

pub use adapters::build_provider;
pub use http::{HttpClient, HttpClientConfig};
pub use provider::{NativeProxy, Provider};
pub use registry::ProviderRegistry;
pub use types::{
    ChatResponse, ChunkStream, Headers, HttpMethod, NativeProxyRequest, NativeProxyResponse,
    ProviderCtx, ProviderKind, StreamChunk, UpstreamBody, header_get, header_remove, header_set,
};
