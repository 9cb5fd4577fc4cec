use async_trait::async_trait;
use bytes::Bytes;
use gandalf_common::{Error, ErrorKind, Result};
use gandalf_protocol::FinishReason;
use gandalf_protocol::openai::{
    ChatCompletionRequest, EmbeddingsRequest, ModelEntry, Usage,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::http::{HttpClient, HttpRequest};
use crate::native::{CredentialHeader, NativeForwarder};
use crate::provider::{NativeProxy, Provider};
use crate::translate::{AnthropicTranslator, spawn_translation};
use crate::types::{
    ChatResponse, ChunkStream, Headers, HttpMethod, NativeProxyRequest, NativeProxyResponse,
    ProviderCtx, ProviderKind, UpstreamBody, header_set,
};

use super::{content_to_text, now_unix, stop_sequences, upstream_error};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: HttpClient,
    forwarder: NativeForwarder,
}

impl AnthropicProvider {
    pub fn new(name: String, base_url: String, api_key: String, client: HttpClient) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let forwarder = NativeForwarder::new(
            client.clone(),
            base_url.clone(),
            CredentialHeader::XApiKey(api_key.clone()),
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
        header_set(&mut headers, "x-api-key", self.api_key.clone());
        header_set(&mut headers, "anthropic-version", ANTHROPIC_VERSION);
        header_set(&mut headers, "content-type", "application/json");
        headers
    }

    /// OpenAI chat request → Anthropic Messages body.
    fn messages_body(&self, req: &ChatCompletionRequest, stream: bool) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        for message in &req.messages {
            match message.role.as_str() {
                "system" | "developer" => system_parts.push(content_to_text(&message.content)),
                "assistant" => messages.push(json!({
                    "role": "assistant",
                    "content": content_to_text(&message.content),
                })),
                _ => messages.push(json!({
                    "role": "user",
                    "content": content_to_text(&message.content),
                })),
            }
        }

        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
            "stream": stream,
        });
        let obj = body.as_object_mut().expect("object literal");
        if !system_parts.is_empty() {
            obj.insert("system".to_string(), json!(system_parts.join("\n")));
        }
        if let Some(temperature) = req.temperature {
            obj.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = req.top_p {
            obj.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(stops) = stop_sequences(&req.stop) {
            obj.insert("stop_sequences".to_string(), json!(stops));
        }
        if let Some(tools) = openai_tools_to_anthropic(&req.tools) {
            obj.insert("tools".to_string(), tools);
        }
        body
    }

    async fn post_messages(&self, body: Value, want_stream: bool) -> Result<crate::http::HttpResponse> {
        let bytes = serde_json::to_vec(&body)
            .map_err(|err| Error::wrap(ErrorKind::Internal, "request serialization failed", err))?;
        let resp = self
            .client
            .send(HttpRequest {
                method: HttpMethod::Post,
                url: format!("{}/v1/messages", self.base_url),
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
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn chat(&self, _ctx: &ProviderCtx, req: &ChatCompletionRequest) -> Result<ChatResponse> {
        let resp = self.post_messages(self.messages_body(req, false), false).await?;
        let UpstreamBody::Bytes(bytes) = resp.body else {
            return Err(Error::new(ErrorKind::Provider, "expected buffered body"));
        };
        let message: MessagesResponse = serde_json::from_slice(&bytes)
            .map_err(|err| Error::wrap(ErrorKind::Provider, "messages decode failed", err))?;
        let usage = Usage::new(message.usage.input_tokens, message.usage.output_tokens);
        let body = message.into_chat_completion()?;
        Ok(ChatResponse {
            body,
            usage: Some(usage),
        })
    }

    async fn chat_stream(
        &self,
        _ctx: &ProviderCtx,
        req: &ChatCompletionRequest,
    ) -> Result<ChunkStream> {
        let resp = self.post_messages(self.messages_body(req, true), true).await?;
        match resp.body {
            UpstreamBody::Stream(rx) => Ok(spawn_translation(
                rx,
                AnthropicTranslator::new(req.model.clone(), now_unix()),
            )),
            UpstreamBody::Bytes(_) => {
                Err(Error::new(ErrorKind::Provider, "expected streaming body"))
            }
        }
    }

    async fn embeddings(
        &self,
        _ctx: &ProviderCtx,
        _req: &EmbeddingsRequest,
    ) -> Result<ChatResponse> {
        // Retriable so the failover loop can move to a capable target.
        Err(Error::new(
            ErrorKind::Provider,
            "anthropic does not serve embeddings",
        ))
    }

    async fn list_models(&self, _ctx: &ProviderCtx) -> Result<Vec<ModelEntry>> {
        let resp = self
            .client
            .send(HttpRequest {
                method: HttpMethod::Get,
                url: format!("{}/v1/models", self.base_url),
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
        let list: AnthropicModelList = serde_json::from_slice(&bytes)
            .map_err(|err| Error::wrap(ErrorKind::Provider, "model list decode failed", err))?;
        Ok(list
            .data
            .into_iter()
            .map(|m| ModelEntry {
                id: m.id,
                object: "model".to_string(),
                created: 0,
                owned_by: "anthropic".to_string(),
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
impl NativeProxy for AnthropicProvider {
    async fn proxy(
        &self,
        _ctx: &ProviderCtx,
        mut req: NativeProxyRequest,
    ) -> Result<NativeProxyResponse> {
        // Clients of the native surface often omit the version header.
        if crate::types::header_get(&req.headers, "anthropic-version").is_none() {
            header_set(&mut req.headers, "anthropic-version", ANTHROPIC_VERSION);
        }
        self.forwarder.forward(req).await
    }
}

fn openai_tools_to_anthropic(tools: &Option<Value>) -> Option<Value> {
    let items = tools.as_ref()?.as_array()?;
    let mapped: Vec<Value> = items
        .iter()
        .filter_map(|tool| {
            let function = tool.get("function")?;
            let name = function.get("name")?.as_str()?;
            Some(json!({
                "name": name,
                "description": function.get("description").cloned().unwrap_or(Value::Null),
                "input_schema": function
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"})),
            }))
        })
        .collect();
    (!mapped.is_empty()).then(|| Value::Array(mapped))
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    model: String,
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl MessagesResponse {
    /// Anthropic Messages response → OpenAI chat completion JSON.
    fn into_chat_completion(self) -> Result<Bytes> {
        let mut text = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        for block in &self.content {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    let arguments = block
                        .get("input")
                        .map(|input| input.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(json!({
                        "id": block.get("id").cloned().unwrap_or(Value::Null),
                        "type": "function",
                        "function": {
                            "name": block.get("name").cloned().unwrap_or(Value::Null),
                            "arguments": arguments,
                        },
                    }));
                }
                _ => {}
            }
        }

        let finish_reason = self
            .stop_reason
            .as_deref()
            .map(FinishReason::from_anthropic)
            .unwrap_or(FinishReason::Stop);

        let mut message = json!({
            "role": "assistant",
            "content": text,
        });
        if !tool_calls.is_empty() {
            message
                .as_object_mut()
                .expect("object literal")
                .insert("tool_calls".to_string(), Value::Array(tool_calls));
        }

        let usage = Usage::new(self.usage.input_tokens, self.usage.output_tokens);
        let completion = json!({
            "id": self.id,
            "object": "chat.completion",
            "created": now_unix(),
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": finish_reason.as_str(),
            }],
            "usage": usage,
        });
        serde_json::to_vec(&completion)
            .map(Bytes::from)
            .map_err(|err| Error::wrap(ErrorKind::Internal, "response serialization failed", err))
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicModelList {
    #[serde(default)]
    data: Vec<AnthropicModel>,
}

#[derive(Debug, Deserialize)]
struct AnthropicModel {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn system_messages_lift_to_system_field() {
        let provider = AnthropicProvider::new(
            "anthropic".to_string(),
            "https://api.anthropic.com".to_string(),
            "key".to_string(),
            HttpClient::new(Default::default()).unwrap(),
        );
        let req = request(json!({
            "model": "claude-sonnet",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
            ],
            "temperature": 0.2,
            "stop": ["END"],
        }));
        let body = provider.messages_body(&req, false);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["stop_sequences"][0], "END");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn tool_definitions_translate() {
        let tools = Some(json!([{
            "type": "function",
            "function": {
                "name": "get_weather",
                "description": "Weather lookup",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}},
            },
        }]));
        let mapped = openai_tools_to_anthropic(&tools).unwrap();
        assert_eq!(mapped[0]["name"], "get_weather");
        assert_eq!(mapped[0]["input_schema"]["type"], "object");
    }

    #[test]
    fn messages_response_translates_to_chat_completion() {
        let resp: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "model": "claude-sonnet",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "id": "tu_1", "name": "f", "input": {"x": 1}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 3, "output_tokens": 7},
        }))
        .unwrap();
        let bytes = resp.into_chat_completion().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["choices"][0]["message"]["content"], "Hello");
        assert_eq!(value["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            value["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"],
            "{\"x\":1}"
        );
        assert_eq!(value["usage"]["total_tokens"], 10);
    }
}
