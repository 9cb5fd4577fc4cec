use std::sync::Arc;
use std::time::Instant;

use axum::Extension;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use gandalf_common::{Error, ErrorKind, RequestMeta};
use gandalf_protocol::openai::Usage;
use gandalf_providers::native::valid_path_segment;
use gandalf_providers::{
    HttpMethod, NativeProxyRequest, Provider, ProviderCtx, ProviderKind, UpstreamBody,
};
use gandalf_storage::UsageRecord;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;

use crate::AppState;
use crate::error::error_response;

const GEMINI_ACTIONS: &[&str] = &["generateContent", "streamGenerateContent", "embedContent"];

/// `POST /v1/messages` (Anthropic Messages).
pub async fn anthropic_messages(
    State(state): State<AppState>,
    Extension(meta): Extension<Arc<RequestMeta>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let model = model_from_body(&body);
    forward(
        state,
        meta,
        ProviderKind::Anthropic,
        model.as_deref(),
        HttpMethod::Post,
        "/v1/messages".to_string(),
        query,
        headers,
        Some(body),
    )
    .await
}

/// `GET /v1beta/models` (Gemini model listing).
pub async fn gemini_models(
    State(state): State<AppState>,
    Extension(meta): Extension<Arc<RequestMeta>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    forward(
        state,
        meta,
        ProviderKind::Gemini,
        None,
        HttpMethod::Get,
        "/v1beta/models".to_string(),
        query,
        headers,
        None,
    )
    .await
}

/// `POST /v1beta/models/{model}:{action}` (Gemini generate/stream/embed).
pub async fn gemini_post(
    State(state): State<AppState>,
    Extension(meta): Extension<Arc<RequestMeta>>,
    Path(model_action): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(&Error::bad_request("expected model:action"));
    };
    if !valid_path_segment(model) || action.is_empty() {
        return error_response(&Error::bad_request("invalid model path segment"));
    }
    if !GEMINI_ACTIONS.contains(&action) {
        return error_response(&Error::not_found("unknown action"));
    }

    forward(
        state,
        meta,
        ProviderKind::Gemini,
        Some(model),
        HttpMethod::Post,
        format!("/v1beta/models/{model}:{action}"),
        query,
        headers,
        Some(body),
    )
    .await
}

/// `POST /openai/deployments/{deployment}/chat/completions` (Azure).
pub async fn azure_chat(
    State(state): State<AppState>,
    Extension(meta): Extension<Arc<RequestMeta>>,
    Path(deployment): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    azure_forward(state, meta, deployment, "chat/completions", query, headers, body).await
}

/// `POST /openai/deployments/{deployment}/embeddings` (Azure).
pub async fn azure_embeddings(
    State(state): State<AppState>,
    Extension(meta): Extension<Arc<RequestMeta>>,
    Path(deployment): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    azure_forward(state, meta, deployment, "embeddings", query, headers, body).await
}

async fn azure_forward(
    state: AppState,
    meta: Arc<RequestMeta>,
    deployment: String,
    op: &str,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !valid_path_segment(&deployment) {
        return error_response(&Error::bad_request("invalid deployment path segment"));
    }
    forward(
        state,
        meta,
        ProviderKind::Azure,
        Some(&deployment),
        HttpMethod::Post,
        format!("/openai/deployments/{deployment}/{op}"),
        query,
        headers,
        Some(body),
    )
    .await
}

/// `POST /api/chat` (Ollama).
pub async fn ollama_chat(
    State(state): State<AppState>,
    Extension(meta): Extension<Arc<RequestMeta>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let model = model_from_body(&body);
    forward(
        state,
        meta,
        ProviderKind::Ollama,
        model.as_deref(),
        HttpMethod::Post,
        "/api/chat".to_string(),
        query,
        headers,
        Some(body),
    )
    .await
}

/// `POST /api/embed` (Ollama).
pub async fn ollama_embed(
    State(state): State<AppState>,
    Extension(meta): Extension<Arc<RequestMeta>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let model = model_from_body(&body);
    forward(
        state,
        meta,
        ProviderKind::Ollama,
        model.as_deref(),
        HttpMethod::Post,
        "/api/embed".to_string(),
        query,
        headers,
        Some(body),
    )
    .await
}

/// `GET /api/tags` (Ollama).
pub async fn ollama_tags(
    State(state): State<AppState>,
    Extension(meta): Extension<Arc<RequestMeta>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    forward(
        state,
        meta,
        ProviderKind::Ollama,
        None,
        HttpMethod::Get,
        "/api/tags".to_string(),
        query,
        headers,
        None,
    )
    .await
}

fn model_from_body(body: &Bytes) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("model")
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

/// Pick the provider serving a native surface: resolve the model through
/// the router when one is known and take the first target whose provider
/// matches the surface's kind; otherwise the first provider of that kind.
async fn select_provider(
    state: &AppState,
    kind: ProviderKind,
    model: Option<&str>,
) -> Result<Arc<dyn Provider>, Error> {
    if let Some(model) = model {
        let route = state.proxy.router().resolve(model).await?;
        for target in &route.targets {
            if let Some(provider) = state.proxy.registry().get(&target.provider_id)
                && provider.kind() == kind
                && provider.native().is_some()
            {
                return Ok(provider);
            }
        }
        return Err(Error::new(
            ErrorKind::Provider,
            format!("no {} target for {model}", kind.as_str()),
        ));
    }
    state
        .proxy
        .registry()
        .first_native_of_kind(kind)
        .ok_or_else(|| Error::not_found(format!("no {} provider configured", kind.as_str())))
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    state: AppState,
    meta: Arc<RequestMeta>,
    kind: ProviderKind,
    model: Option<&str>,
    method: HttpMethod,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Option<Bytes>,
) -> Response {
    let started = Instant::now();
    let provider = match select_provider(&state, kind, model).await {
        Ok(provider) => provider,
        Err(err) => return error_response(&err),
    };
    let native = provider
        .native()
        .expect("selected provider advertises native proxy");

    let ctx = ProviderCtx {
        request_id: meta.request_id().to_string(),
    };
    let req = NativeProxyRequest {
        method,
        path,
        query,
        headers: headermap_to_vec(&headers),
        body: body.filter(|b| !b.is_empty()),
        is_stream_hint: false,
    };

    let result = native.proxy(&ctx, req).await;
    let status = result
        .as_ref()
        .map(|r| r.status)
        .unwrap_or_else(|e| e.status());
    record_passthrough(&state, &meta, model, provider.name(), status, started);

    match result {
        Ok(resp) => to_axum_response(resp),
        Err(err) => error_response(&err),
    }
}

fn record_passthrough(
    state: &AppState,
    meta: &RequestMeta,
    model: Option<&str>,
    provider: &str,
    status: u16,
    started: Instant,
) {
    let Some(identity) = meta.identity() else {
        return;
    };
    let usage = Usage::default();
    state.recorder.record(UsageRecord {
        request_id: meta.request_id().to_string(),
        key_id: identity.key_id,
        org_id: identity.org_id,
        team_id: identity.team_id,
        user_id: identity.user_id,
        model: model.unwrap_or_default().to_string(),
        provider: provider.to_string(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cost: 0.0,
        cached: false,
        latency_ms: started.elapsed().as_millis() as u64,
        status,
        created_at: OffsetDateTime::now_utc(),
    });
}

fn headermap_to_vec(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            out.push((name.as_str().to_string(), v.to_string()));
        }
    }
    out
}

fn to_axum_response(resp: gandalf_providers::NativeProxyResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);

    let is_sse = resp
        .headers
        .iter()
        .any(|(name, value)| {
            name.eq_ignore_ascii_case("content-type")
                && value.to_ascii_lowercase().contains("text/event-stream")
        });

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &resp.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        if is_sse {
            headers
                .entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            headers
                .entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
    }

    let body = match resp.body {
        UpstreamBody::Bytes(bytes) => axum::body::Body::from(bytes),
        UpstreamBody::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
            axum::body::Body::from_stream(stream)
        }
    };

    builder
        .body(body)
        .unwrap_or_else(|_| error_response(&Error::internal("response build failed")))
}
