use async_trait::async_trait;
use bytes::Bytes;
use gandalf_common::{Error, ErrorKind, Result};
use gandalf_protocol::openai::{ChatCompletionRequest, EmbeddingsRequest, ModelEntry, ModelList};

use crate::http::{HttpClient, HttpRequest};
use crate::native::{CredentialHeader, NativeForwarder};
use crate::provider::{NativeProxy, Provider};
use crate::translate::{OpenAiPassthrough, spawn_translation};
use crate::types::{
    ChatResponse, ChunkStream, Headers, HttpMethod, NativeProxyRequest, NativeProxyResponse,
    ProviderCtx, ProviderKind, UpstreamBody, header_set,
};

use super::{UsageProbe, upstream_error};

const AZURE_API_VERSION: &str = "2024-06-01";

/// OpenAI-family adapter; also covers Azure OpenAI deployments, which differ
/// only in URL shape and credential header.
pub struct OpenAiProvider {
    name: String,
    kind: ProviderKind,
    base_url: String,
    api_key: String,
    client: HttpClient,
    forwarder: NativeForwarder,
}

impl OpenAiProvider {
    pub fn new(
        name: String,
        kind: ProviderKind,
        base_url: String,
        api_key: String,
        client: HttpClient,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let credential = match kind {
            ProviderKind::Azure => CredentialHeader::ApiKey(api_key.clone()),
            _ => CredentialHeader::Bearer(api_key.clone()),
        };
        let forwarder = NativeForwarder::new(client.clone(), base_url.clone(), credential);
        Self {
            name,
            kind,
            base_url,
            api_key,
            client,
            forwarder,
        }
    }

    fn headers(&self) -> Headers {
        let mut headers = Vec::new();
        match self.kind {
            ProviderKind::Azure => header_set(&mut headers, "api-key", self.api_key.clone()),
            _ => header_set(
                &mut headers,
                "authorization",
                format!("Bearer {}", self.api_key),
            ),
        }
        header_set(&mut headers, "content-type", "application/json");
        headers
    }

    fn url(&self, op: &str, deployment: &str) -> String {
        match self.kind {
            ProviderKind::Azure => format!(
                "{}/openai/deployments/{deployment}/{op}?api-version={AZURE_API_VERSION}",
                self.base_url
            ),
            _ => format!("{}/v1/{op}", self.base_url),
        }
    }

    async fn post_json(
        &self,
        url: String,
        body: Bytes,
        want_stream: bool,
    ) -> Result<crate::http::HttpResponse> {
        self.client
            .send(HttpRequest {
                method: HttpMethod::Post,
                url,
                headers: self.headers(),
                body: Some(body),
                want_stream,
            })
            .await
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn chat(&self, _ctx: &ProviderCtx, req: &ChatCompletionRequest) -> Result<ChatResponse> {
        let body = serde_json::to_vec(req)
            .map_err(|err| Error::wrap(ErrorKind::Internal, "request serialization failed", err))?;
        let url = self.url("chat/completions", &req.model);
        let resp = self.post_json(url, Bytes::from(body), false).await?;
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
        let url = self.url("chat/completions", &req.model);
        let resp = self.post_json(url, Bytes::from(body), true).await?;
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
        let url = self.url("embeddings", &req.model);
        let resp = self.post_json(url, Bytes::from(body), false).await?;
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
        let url = match self.kind {
            ProviderKind::Azure => format!(
                "{}/openai/models?api-version={AZURE_API_VERSION}",
                self.base_url
            ),
            _ => format!("{}/v1/models", self.base_url),
        };
        let resp = self
            .client
            .send(HttpRequest {
                method: HttpMethod::Get,
                url,
                headers: self.headers(),
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
        let list: ModelList = serde_json::from_slice(&bytes)
            .map_err(|err| Error::wrap(ErrorKind::Provider, "model list decode failed", err))?;
        Ok(list.data)
    }

    async fn health_check(&self, ctx: &ProviderCtx) -> Result<()> {
        self.list_models(ctx).await.map(|_| ())
    }

    fn native(&self) -> Option<&dyn NativeProxy> {
        Some(self)
    }
}

#[async_trait]
impl NativeProxy for OpenAiProvider {
    async fn proxy(
        &self,
        _ctx: &ProviderCtx,
        req: NativeProxyRequest,
    ) -> Result<NativeProxyResponse> {
        self.forwarder.forward(req).await
    }
}
