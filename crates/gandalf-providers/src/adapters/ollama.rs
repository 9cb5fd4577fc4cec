use async_trait::async_trait;
use bytes::Bytes;
use gandalf_common::{Error, ErrorKind, Result};
use gandalf_protocol::openai::{ChatCompletionRequest, EmbeddingsRequest, ModelEntry};
use serde::Deserialize;

use crate::http::{HttpClient, HttpRequest};
use crate::native::{CredentialHeader, NativeForwarder};
use crate::provider::{NativeProxy, Provider};
use crate::translate::{OpenAiPassthrough, spawn_translation};
use crate::types::{
    ChatResponse, ChunkStream, Headers, HttpMethod, NativeProxyRequest, NativeProxyResponse,
    ProviderCtx, ProviderKind, UpstreamBody, header_set,
};

use super::{UsageProbe, upstream_error};

/// Local Ollama daemon. Speaks the OpenAI-compatible endpoints for the
/// universal surface and exposes `/api/*` via native passthrough; stays on
/// HTTP/1.1.
pub struct OllamaProvider {
    name: String,
    base_url: String,
    client: HttpClient,
    forwarder: NativeForwarder,
}

impl OllamaProvider {
    pub fn new(name: String, base_url: String, client: HttpClient) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let forwarder =
            NativeForwarder::new(client.clone(), base_url.clone(), CredentialHeader::None);
        Self {
            name,
            base_url,
            client,
            forwarder,
        }
    }

    fn headers(&self) -> Headers {
        let mut headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        headers
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn chat(&self, _ctx: &ProviderCtx, req: &ChatCompletionRequest) -> Result<ChatResponse> {
        let body = serde_json::to_vec(req)
            .map_err(|err| Error::wrap(ErrorKind::Internal, "request serialization failed", err))?;
        let resp = self
            .client
            .send(HttpRequest {
                method: HttpMethod::Post,
                url: format!("{}/v1/chat/completions", self.base_url),
                headers: self.headers(),
                body: Some(Bytes::from(body)),
                want_stream: false,
            })
            .await?;
        if !(200..300).contains(&resp.status) {
            return Err(upstream_error(&self.name, resp.status));
        }
        let UpstreamBody::Bytes(bytes) = resp.body else {
            return Err(Error::new(ErrorKind::Provider, "expected buffered body"));
        };
        let usage = serde_json::from_slice::<UsageProbe>(&bytes)
            .ok()
            .and_then(|probe| probe.usage);
        Ok(ChatResponse { body: bytes, usage })
    }

    async fn chat_stream(
        &self,
        _ctx: &ProviderCtx,
        req: &ChatCompletionRequest,
    ) -> Result<ChunkStream> {
        let mut req = req.clone();
        req.stream = Some(true);
        req.force_stream_usage();
        let body = serde_json::to_vec(&req)
            .map_err(|err| Error::wrap(ErrorKind::Internal, "request serialization failed", err))?;
        let resp = self
            .client
            .send(HttpRequest {
                method: HttpMethod::Post,
                url: format!("{}/v1/chat/completions", self.base_url),
                headers: self.headers(),
                body: Some(Bytes::from(body)),
                want_stream: true,
            })
            .await?;
        if !(200..300).contains(&resp.status) {
            return Err(upstream_error(&self.name, resp.status));
        }
        match resp.body {
            UpstreamBody::Stream(rx) => Ok(spawn_translation(rx, OpenAiPassthrough)),
            UpstreamBody::Bytes(_) => {
                Err(Error::new(ErrorKind::Provider, "expected streaming body"))
            }
        }
    }

    async fn embeddings(
        &self,
        _ctx: &ProviderCtx,
        req: &EmbeddingsRequest,
    ) -> Result<ChatResponse> {
        let body = serde_json::to_vec(req)
            .map_err(|err| Error::wrap(ErrorKind::Internal, "request serialization failed", err))?;
        let resp = self
            .client
            .send(HttpRequest {
                method: HttpMethod::Post,
                url: format!("{}/v1/embeddings", self.base_url),
                headers: self.headers(),
                body: Some(Bytes::from(body)),
                want_stream: false,
            })
            .await?;
        if !(200..300).contains(&resp.status) {
            return Err(upstream_error(&self.name, resp.status));
        }
        let UpstreamBody::Bytes(bytes) = resp.body else {
            return Err(Error::new(ErrorKind::Provider, "expected buffered body"));
        };
        let usage = serde_json::from_slice::<UsageProbe>(&bytes)
            .ok()
            .and_then(|probe| probe.usage);
        Ok(ChatResponse { body: bytes, usage })
    }

    async fn list_models(&self, _ctx: &ProviderCtx) -> Result<Vec<ModelEntry>> {
        let resp = self
            .client
            .send(HttpRequest {
                method: HttpMethod::Get,
                url: format!("{}/api/tags", self.base_url),
                headers: Vec::new(),
                body: None,
                want_stream: false,
            })
            .await?;
        if !(200..300).contains(&resp.status) {
            return Err(upstream_error(&self.name, resp.status));
        }
        let UpstreamBody::Bytes(bytes) = resp.body else {
            return Err(Error::new(ErrorKind::Provider, "expected buffered body"));
        };
        let tags: TagsResponse = serde_json::from_slice(&bytes)
            .map_err(|err| Error::wrap(ErrorKind::Provider, "tags decode failed", err))?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelEntry {
                id: m.name,
                object: "model".to_string(),
                created: 0,
                owned_by: "ollama".to_string(),
            })
            .collect())
    }

    async fn health_check(&self, ctx: &ProviderCtx) -> Result<()> {
        self.list_models(ctx).await.map(|_| ())
    }

    fn native(&self) -> Option<&dyn NativeProxy> {
        Some(self)
    }
}

#[async_trait]
impl NativeProxy for OllamaProvider {
    async fn proxy(
        &self,
        _ctx: &ProviderCtx,
        req: NativeProxyRequest,
    ) -> Result<NativeProxyResponse> {
        self.forwarder.forward(req).await
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}
