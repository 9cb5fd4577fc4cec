use async_trait::async_trait;
use bytes::Bytes;
use gandalf_common::{Error, ErrorKind, Result};
use gandalf_protocol::FinishReason;
use gandalf_protocol::gemini;
use gandalf_protocol::openai::{ChatCompletionRequest, EmbeddingsRequest, ModelEntry, Usage};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::http::{HttpClient, HttpRequest};
use crate::native::{CredentialHeader, NativeForwarder};
use crate::provider::{NativeProxy, Provider};
use crate::translate::{GeminiTranslator, spawn_translation};
use crate::types::{
    ChatResponse, ChunkStream, Headers, HttpMethod, NativeProxyRequest, NativeProxyResponse,
    ProviderCtx, ProviderKind, UpstreamBody, header_set,
};

use super::{content_to_text, now_unix, stop_sequences, upstream_error};

pub struct GeminiProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: HttpClient,
    forwarder: NativeForwarder,
}

impl GeminiProvider {
    pub fn new(name: String, base_url: String, api_key: String, client: HttpClient) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let forwarder = NativeForwarder::new(
            client.clone(),
            base_url.clone(),
            CredentialHeader::XGoogApiKey(api_key.clone()),
        );
        Self {
            name,
            base_url,
            api_key,
            client,
            forwarder,
        }
    }

    fn headers(&self) -> Headers {
        let mut headers = Vec::new();
        header_set(&mut headers, "x-goog-api-key", self.api_key.clone());
        header_set(&mut headers, "content-type", "application/json");
        headers
    }

    /// OpenAI chat request → Gemini generateContent body.
    fn generate_body(&self, req: &ChatCompletionRequest) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();
        for message in &req.messages {
            let text = content_to_text(&message.content);
            match message.role.as_str() {
                "system" | "developer" => system_parts.push(text),
                "assistant" => contents.push(json!({
                    "role": "model",
                    "parts": [{"text": text}],
                })),
                _ => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": text}],
                })),
            }
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(temperature) = req.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = req.top_p {
            generation_config.insert("topP".to_string(), json!(top_p));
        }
        if let Some(max_tokens) = req.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(stops) = stop_sequences(&req.stop) {
            generation_config.insert("stopSequences".to_string(), json!(stops));
        }

        let mut body = json!({ "contents": contents });
        let obj = body.as_object_mut().expect("object literal");
        if !system_parts.is_empty() {
            obj.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": system_parts.join("\n")}]}),
            );
        }
        if !generation_config.is_empty() {
            obj.insert(
                "generationConfig".to_string(),
                Value::Object(generation_config),
            );
        }
        body
    }

    async fn post(
        &self,
        url: String,
        body: Value,
        want_stream: bool,
    ) -> Result<crate::http::HttpResponse> {
        let bytes = serde_json::to_vec(&body)
            .map_err(|err| Error::wrap(ErrorKind::Internal, "request serialization failed", err))?;
        let resp = self
            .client
            .send(HttpRequest {
                method: HttpMethod::Post,
                url,
                headers: self.headers(),
                body: Some(Bytes::from(bytes)),
                want_stream,
            })
            .await?;
        if !(200..300).contains(&resp.status) {
            return Err(upstream_error(&self.name, resp.status));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn chat(&self, ctx: &ProviderCtx, req: &ChatCompletionRequest) -> Result<ChatResponse> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, req.model
        );
        let resp = self.post(url, self.generate_body(req), false).await?;
        let UpstreamBody::Bytes(bytes) = resp.body else {
            return Err(Error::new(ErrorKind::Provider, "expected buffered body"));
        };
        let parsed: GenerateContentResponse = serde_json::from_slice(&bytes)
            .map_err(|err| Error::wrap(ErrorKind::Provider, "generate decode failed", err))?;
        let usage = parsed.usage_metadata.map(|meta| Usage {
            prompt_tokens: meta.prompt_token_count,
            completion_tokens: meta.candidates_token_count,
            total_tokens: meta.total_token_count,
        });
        let body = to_chat_completion(&ctx.request_id, &req.model, parsed)?;
        Ok(ChatResponse { body, usage })
    }

    async fn chat_stream(
        &self,
        ctx: &ProviderCtx,
        req: &ChatCompletionRequest,
    ) -> Result<ChunkStream> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, req.model
        );
        let resp = self.post(url, self.generate_body(req), true).await?;
        match resp.body {
            UpstreamBody::Stream(rx) => Ok(spawn_translation(
                rx,
                GeminiTranslator::new(&ctx.request_id, req.model.clone(), now_unix()),
            )),
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
        let url = format!("{}/v1beta/models/{}:embedContent", self.base_url, req.model);
        let texts: Vec<String> = match &req.input {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => return Err(Error::bad_request("unsupported embeddings input shape")),
        };
        let joined = texts.join("\n");
        let body = json!({"content": {"parts": [{"text": joined}]}});
        let resp = self.post(url, body, false).await?;
        let UpstreamBody::Bytes(bytes) = resp.body else {
            return Err(Error::new(ErrorKind::Provider, "expected buffered body"));
        };
        let parsed: EmbedContentResponse = serde_json::from_slice(&bytes)
            .map_err(|err| Error::wrap(ErrorKind::Provider, "embed decode failed", err))?;
        let out = json!({
            "object": "list",
            "data": [{
                "object": "embedding",
                "index": 0,
                "embedding": parsed.embedding.values,
            }],
            "model": req.model,
            "usage": Usage::new(0, 0),
        });
        let body = serde_json::to_vec(&out)
            .map(Bytes::from)
            .map_err(|err| Error::wrap(ErrorKind::Internal, "response serialization failed", err))?;
        Ok(ChatResponse { body, usage: None })
    }

    async fn list_models(&self, _ctx: &ProviderCtx) -> Result<Vec<ModelEntry>> {
        let resp = self
            .client
            .send(HttpRequest {
                method: HttpMethod::Get,
                url: format!("{}/v1beta/models", self.base_url),
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
        let list: GeminiModelList = serde_json::from_slice(&bytes)
            .map_err(|err| Error::wrap(ErrorKind::Provider, "model list decode failed", err))?;
        Ok(list
            .models
            .into_iter()
            .map(|m| ModelEntry {
                id: m.name.strip_prefix("models/").unwrap_or(&m.name).to_string(),
                object: "model".to_string(),
                created: 0,
                owned_by: "google".to_string(),
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
impl NativeProxy for GeminiProvider {
    async fn proxy(
        &self,
        _ctx: &ProviderCtx,
        req: NativeProxyRequest,
    ) -> Result<NativeProxyResponse> {
        self.forwarder.forward(req).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<gemini::Candidate>,
    #[serde(default)]
    usage_metadata: Option<gemini::UsageMetadata>,
}

fn to_chat_completion(
    request_id: &str,
    model: &str,
    resp: GenerateContentResponse,
) -> Result<Bytes> {
    let mut text = String::new();
    let mut finish_reason = FinishReason::Stop;
    if let Some(candidate) = resp.candidates.first() {
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(t) = &part.text {
                    text.push_str(t);
                }
            }
        }
        if let Some(reason) = candidate.finish_reason.as_deref() {
            finish_reason = FinishReason::from_gemini(reason);
        }
    }
    let usage = resp
        .usage_metadata
        .map(|meta| Usage {
            prompt_tokens: meta.prompt_token_count,
            completion_tokens: meta.candidates_token_count,
            total_tokens: meta.total_token_count,
        })
        .unwrap_or_default();
    let completion = json!({
        "id": format!("chatcmpl-{request_id}"),
        "object": "chat.completion",
        "created": now_unix(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish_reason.as_str(),
        }],
        "usage": usage,
    });
    serde_json::to_vec(&completion)
        .map(Bytes::from)
        .map_err(|err| Error::wrap(ErrorKind::Internal, "response serialization failed", err))
}

#[derive(Debug, Deserialize)]
struct EmbedContentResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    #[serde(default)]
    values: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct GeminiModelList {
    #[serde(default)]
    models: Vec<GeminiModel>,
}

#[derive(Debug, Deserialize)]
struct GeminiModel {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_body_maps_roles_and_config() {
        let provider = GeminiProvider::new(
            "gemini".to_string(),
            "https://generativelanguage.googleapis.com".to_string(),
            "key".to_string(),
            HttpClient::new(Default::default()).unwrap(),
        );
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-pro",
            "messages": [
                {"role": "system", "content": "short answers"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
            ],
            "temperature": 0.1,
            "max_tokens": 64,
        }))
        .unwrap();
        let body = provider.generate_body(&req);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "short answers");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["temperature"], 0.1);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
    }

    #[test]
    fn response_translation() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"parts": [{"text": "Hi "}, {"text": "there"}], "role": "model"},
                "finishReason": "MAX_TOKENS",
            }],
            "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 4, "totalTokenCount": 6},
        }))
        .unwrap();
        let bytes = to_chat_completion("req-9", "gemini-pro", resp).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["id"], "chatcmpl-req-9");
        assert_eq!(value["choices"][0]["message"]["content"], "Hi there");
        assert_eq!(value["choices"][0]["finish_reason"], "length");
        assert_eq!(value["usage"]["total_tokens"], 6);
    }
}
