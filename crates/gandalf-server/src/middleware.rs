use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use gandalf_common::{Error, Identity, RequestMeta};
use gandalf_core::RateSnapshot;
use gandalf_protocol::ErrorEnvelope;
use tracing::Instrument;

use crate::AppState;
use crate::error::{error_response, json_response};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Headers a native-surface client may carry its credential in.
const PROVIDER_CREDENTIAL_HEADERS: &[&str] = &["x-api-key", "x-goog-api-key", "api-key"];

pub(crate) fn request_meta(req: &Request) -> Arc<RequestMeta> {
    req.extensions()
        .get::<Arc<RequestMeta>>()
        .cloned()
        .unwrap_or_else(|| Arc::new(RequestMeta::new(None)))
}

pub(crate) fn identity_of(req: &Request) -> Option<Identity> {
    request_meta(req).identity().cloned()
}

fn route_pattern(req: &Request) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string())
}

/// Accept a syntactically valid inbound `X-Request-Id` or mint a UUIDv7;
/// the same value is attached to the request metadata and echoed on the
/// response. Later layers mutate the shared metadata object instead of
/// re-wrapping the request.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let inbound = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let meta = Arc::new(RequestMeta::new(inbound));
    let id_header = HeaderValue::from_str(meta.request_id())
        .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
    req.extensions_mut().insert(meta);

    let mut resp = next.run(req).await;
    resp.headers_mut().insert(REQUEST_ID_HEADER, id_header);
    resp
}

/// One span per request, named after the route pattern.
pub async fn trace_span(req: Request, next: Next) -> Response {
    let meta = request_meta(&req);
    let span = tracing::info_span!(
        "http_request",
        method = %req.method(),
        route = %route_pattern(&req),
        request_id = %meta.request_id(),
        status = tracing::field::Empty,
        provider = tracing::field::Empty,
        model = tracing::field::Empty,
    );
    let resp = next.run(req).instrument(span.clone()).await;
    span.record("status", resp.status().as_u16());
    resp
}

/// In-flight gauge, duration histogram, and the per-(method, route, status)
/// counter. Status labels come from `StatusCode::as_str`, which is interned.
pub async fn track_metrics(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().as_str().to_string();
    let route = route_pattern(&req);
    state.metrics.http_in_flight.inc();
    let started = Instant::now();

    let resp = next.run(req).await;

    state.metrics.http_in_flight.dec();
    state
        .metrics
        .http_request_duration_seconds
        .with_label_values(&[route.as_str()])
        .observe(started.elapsed().as_secs_f64());
    state
        .metrics
        .http_requests_total
        .with_label_values(&[method.as_str(), route.as_str(), resp.status().as_str()])
        .inc();
    resp
}

/// One structured line per request.
pub async fn log_requests(
    State(_state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let meta = request_meta(&req);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let resp = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = resp.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        request_id = %meta.request_id(),
        "request"
    );
    resp
}

/// Native surfaces accept provider-style credential headers; fold them into
/// `Authorization: Bearer` so the authenticator sees one shape. An existing
/// Authorization header is never overwritten.
pub async fn normalize_auth_headers(mut req: Request, next: Next) -> Response {
    if !req.headers().contains_key(header::AUTHORIZATION) {
        let found = PROVIDER_CREDENTIAL_HEADERS.iter().find_map(|name| {
            req.headers()
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        });
        if let Some(token) = found
            && let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}"))
        {
            req.headers_mut().insert(header::AUTHORIZATION, value);
        }
    }
    next.run(req).await
}

/// Resolve the caller's identity and store it in the shared request
/// metadata (written exactly once here).
pub async fn authenticate(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(&req) else {
        return error_response(&Error::unauthorized("missing bearer token"));
    };

    match state.authenticator.authenticate(&token).await {
        Ok(identity) => {
            request_meta(&req).set_identity(identity);
            next.run(req).await
        }
        Err(err) => {
            tracing::debug!(error = %err, "authentication failed");
            error_response(&err)
        }
    }
}

fn bearer_token(req: &Request) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let value = value.trim();
    let prefix = "Bearer ";
    if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        let token = value[prefix.len()..].trim();
        (!token.is_empty()).then(|| token.to_string())
    } else {
        None
    }
}

/// RPM admission: one request token per request, pre-decode. TPM is
/// consumed deeper, after estimation. Every response passing through here
/// carries the `X-RateLimit-*` headers.
pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(identity) = identity_of(&req) else {
        return error_response(&Error::internal("rate limit before authentication"));
    };

    match state.limiter.check_rpm(identity.key_id, &identity.limits) {
        Ok(_) => {
            let mut resp = next.run(req).await;
            let snapshot = state.limiter.snapshot(identity.key_id, &identity.limits);
            write_rate_headers(&mut resp, &snapshot, None);
            resp
        }
        Err(denied) => {
            state.metrics.rate_limited_total.inc();
            let body = ErrorEnvelope::new(
                gandalf_common::ErrorKind::RateLimited.canonical_message(),
                gandalf_common::ErrorKind::RateLimited.error_type(),
            )
            .to_json();
            let mut resp = json_response(StatusCode::TOO_MANY_REQUESTS, body);
            write_rate_headers(&mut resp, &denied.snapshot, Some(denied.retry_after_secs));
            resp
        }
    }
}

pub(crate) fn write_rate_headers(
    resp: &mut Response,
    snapshot: &RateSnapshot,
    retry_after: Option<u64>,
) {
    let headers = resp.headers_mut();
    let mut set = |name: &'static str, value: String| {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(name, v);
        }
    };
    set(
        "x-ratelimit-limit-requests",
        snapshot.limit_requests.to_string(),
    );
    set(
        "x-ratelimit-remaining-requests",
        snapshot.remaining_requests.to_string(),
    );
    set("x-ratelimit-limit-tokens", snapshot.limit_tokens.to_string());
    set(
        "x-ratelimit-remaining-tokens",
        snapshot.remaining_tokens.to_string(),
    );
    if let Some(secs) = retry_after {
        set("retry-after", secs.to_string());
    }
}
