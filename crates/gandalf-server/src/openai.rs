use std::sync::Arc;
use std::time::Instant;

use axum::Extension;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use gandalf_common::{Error, ErrorKind, Identity, RequestMeta};
use gandalf_core::{
    estimate_chat_tokens, estimate_embedding_tokens, fingerprint, is_cacheable, token_cost,
};
use gandalf_protocol::ErrorEnvelope;
use gandalf_protocol::openai::{ChatCompletionRequest, EmbeddingsRequest, Usage};
use gandalf_providers::ProviderCtx;
use gandalf_storage::UsageRecord;
use time::OffsetDateTime;

use crate::error::{error_response, json_response};
use crate::middleware::write_rate_headers;
use crate::sse::{StreamContext, sse_response};
use crate::AppState;

/// `POST /v1/chat/completions` — JSON in; JSON or SSE out.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(meta): Extension<Arc<RequestMeta>>,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let Some(identity) = meta.identity().cloned() else {
        return error_response(&Error::internal("identity missing after authentication"));
    };

    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            tracing::debug!(error = %err, "chat body rejected");
            return error_response(&Error::bad_request("malformed request body"));
        }
    };
    if req.messages.iter().any(|m| !known_role(&m.role)) {
        return error_response(&Error::bad_request("unknown message role"));
    }
    if !identity.allows_model(&req.model) {
        return error_response(&Error::new(
            ErrorKind::ModelNotAllowed,
            "model not allowed",
        ));
    }
    if let Err(err) = state
        .quota
        .check(identity.key_id, identity.limits.max_budget)
    {
        record_failure(&state, &meta, &identity, &req.model, err.status(), started);
        return error_response(&err);
    }

    let ctx = ProviderCtx {
        request_id: meta.request_id().to_string(),
    };

    if req.is_stream() {
        return chat_stream(state, meta, identity, req, ctx, started).await;
    }

    // Response cache sits between rate limiting and dispatch; a hit never
    // reaches the TPM phase or a provider.
    let cache_key = is_cacheable(&req).then(|| fingerprint(identity.key_id, &req));
    if let Some(key) = &cache_key
        && let Some(entry) = state.cache.get(key)
    {
        state.metrics.cache_hits_total.inc();
        record_usage(
            &state,
            &meta,
            &identity,
            &req.model,
            &entry.provider,
            entry.usage.unwrap_or_default(),
            0.0,
            true,
            StatusCode::OK.as_u16(),
            started,
        );
        return json_bytes_response(entry.body.clone());
    }
    if cache_key.is_some() {
        state.metrics.cache_misses_total.inc();
    }

    // TPM phase 1: estimate-then-consume before the upstream call.
    let estimated = estimate_chat_tokens(&req);
    if let Err(denied) = state
        .limiter
        .reserve_tpm(identity.key_id, &identity.limits, estimated)
    {
        state.metrics.rate_limited_total.inc();
        let body = ErrorEnvelope::new(
            ErrorKind::RateLimited.canonical_message(),
            ErrorKind::RateLimited.error_type(),
        )
        .to_json();
        let mut resp = json_response(StatusCode::TOO_MANY_REQUESTS, body);
        write_rate_headers(&mut resp, &denied.snapshot, Some(denied.retry_after_secs));
        return resp;
    }

    match state.proxy.chat(&ctx, &req).await {
        Ok((upstream, provider)) => {
            let usage = upstream.usage.unwrap_or_default();
            // TPM phase 2: settle the estimate against the actual spend.
            state
                .limiter
                .adjust_tpm(identity.key_id, estimated, usage.total_tokens);
            let cost = token_cost(usage.total_tokens);
            state.quota.add_cost(identity.key_id, cost);
            record_usage(
                &state,
                &meta,
                &identity,
                &req.model,
                &provider,
                usage,
                cost,
                false,
                StatusCode::OK.as_u16(),
                started,
            );
            if let Some(key) = cache_key {
                let ttl = state.proxy.router().cache_ttl(&req.model).await;
                state
                    .cache
                    .insert(key, upstream.body.clone(), upstream.usage, provider, ttl);
            }
            json_bytes_response(upstream.body)
        }
        Err(err) => {
            state.limiter.adjust_tpm(identity.key_id, estimated, 0);
            record_failure(&state, &meta, &identity, &req.model, err.status(), started);
            error_response(&err)
        }
    }
}

async fn chat_stream(
    state: AppState,
    meta: Arc<RequestMeta>,
    identity: Identity,
    req: ChatCompletionRequest,
    ctx: ProviderCtx,
    started: Instant,
) -> Response {
    let estimated = estimate_chat_tokens(&req);
    if let Err(denied) = state
        .limiter
        .reserve_tpm(identity.key_id, &identity.limits, estimated)
    {
        state.metrics.rate_limited_total.inc();
        let body = ErrorEnvelope::new(
            ErrorKind::RateLimited.canonical_message(),
            ErrorKind::RateLimited.error_type(),
        )
        .to_json();
        let mut resp = json_response(StatusCode::TOO_MANY_REQUESTS, body);
        write_rate_headers(&mut resp, &denied.snapshot, Some(denied.retry_after_secs));
        return resp;
    }

    match state.proxy.chat_stream(&ctx, &req).await {
        Ok((chunks, provider)) => sse_response(
            chunks,
            StreamContext {
                state: state.clone(),
                meta,
                identity,
                model: req.model.clone(),
                provider,
                estimated_tokens: estimated,
                started,
            },
        ),
        Err(err) => {
            state.limiter.adjust_tpm(identity.key_id, estimated, 0);
            record_failure(&state, &meta, &identity, &req.model, err.status(), started);
            error_response(&err)
        }
    }
}

/// `POST /v1/embeddings` — JSON in, JSON out; never cached.
pub async fn embeddings(
    State(state): State<AppState>,
    Extension(meta): Extension<Arc<RequestMeta>>,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let Some(identity) = meta.identity().cloned() else {
        return error_response(&Error::internal("identity missing after authentication"));
    };

    let req: EmbeddingsRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            tracing::debug!(error = %err, "embeddings body rejected");
            return error_response(&Error::bad_request("malformed request body"));
        }
    };
    if !identity.allows_model(&req.model) {
        return error_response(&Error::new(
            ErrorKind::ModelNotAllowed,
            "model not allowed",
        ));
    }
    if let Err(err) = state
        .quota
        .check(identity.key_id, identity.limits.max_budget)
    {
        record_failure(&state, &meta, &identity, &req.model, err.status(), started);
        return error_response(&err);
    }

    let estimated = estimate_embedding_tokens(&req);
    if let Err(denied) = state
        .limiter
        .reserve_tpm(identity.key_id, &identity.limits, estimated)
    {
        state.metrics.rate_limited_total.inc();
        let body = ErrorEnvelope::new(
            ErrorKind::RateLimited.canonical_message(),
            ErrorKind::RateLimited.error_type(),
        )
        .to_json();
        let mut resp = json_response(StatusCode::TOO_MANY_REQUESTS, body);
        write_rate_headers(&mut resp, &denied.snapshot, Some(denied.retry_after_secs));
        return resp;
    }

    let ctx = ProviderCtx {
        request_id: meta.request_id().to_string(),
    };
    match state.proxy.embeddings(&ctx, &req).await {
        Ok((upstream, provider)) => {
            let usage = upstream.usage.unwrap_or_default();
            state
                .limiter
                .adjust_tpm(identity.key_id, estimated, usage.total_tokens);
            let cost = token_cost(usage.total_tokens);
            state.quota.add_cost(identity.key_id, cost);
            record_usage(
                &state,
                &meta,
                &identity,
                &req.model,
                &provider,
                usage,
                cost,
                false,
                StatusCode::OK.as_u16(),
                started,
            );
            json_bytes_response(upstream.body)
        }
        Err(err) => {
            state.limiter.adjust_tpm(identity.key_id, estimated, 0);
            record_failure(&state, &meta, &identity, &req.model, err.status(), started);
            error_response(&err)
        }
    }
}

/// `GET /v1/models` — concatenated fan-out across all providers.
pub async fn models(
    State(state): State<AppState>,
    Extension(meta): Extension<Arc<RequestMeta>>,
) -> Response {
    let ctx = ProviderCtx {
        request_id: meta.request_id().to_string(),
    };
    let list = state.proxy.list_models(&ctx).await;
    match serde_json::to_string(&list) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(_) => error_response(&Error::internal("model list serialization failed")),
    }
}

fn known_role(role: &str) -> bool {
    matches!(
        role,
        "system" | "developer" | "user" | "assistant" | "tool" | "function"
    )
}

fn json_bytes_response(body: Bytes) -> Response {
    let mut resp = Response::new(axum::body::Body::from(body));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

#[allow(clippy::too_many_arguments)]
fn record_usage(
    state: &AppState,
    meta: &RequestMeta,
    identity: &Identity,
    model: &str,
    provider: &str,
    usage: Usage,
    cost: f64,
    cached: bool,
    status: u16,
    started: Instant,
) {
    state.recorder.record(UsageRecord {
        request_id: meta.request_id().to_string(),
        key_id: identity.key_id,
        org_id: identity.org_id,
        team_id: identity.team_id,
        user_id: identity.user_id,
        model: model.to_string(),
        provider: provider.to_string(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cost,
        cached,
        latency_ms: started.elapsed().as_millis() as u64,
        status,
        created_at: OffsetDateTime::now_utc(),
    });
}

fn record_failure(
    state: &AppState,
    meta: &RequestMeta,
    identity: &Identity,
    model: &str,
    status: u16,
    started: Instant,
) {
    record_usage(
        state,
        meta,
        identity,
        model,
        "",
        Usage::default(),
        0.0,
        false,
        status,
        started,
    );
}
