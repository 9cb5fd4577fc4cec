//! HTTP surface: the middleware chain, the OpenAI-compatible handlers, the
//! native passthrough mounts, and the system endpoints.

pub mod bootstrap;
pub mod error;
pub mod middleware;
pub mod native;
pub mod openai;
pub mod sse;
pub mod system;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use gandalf_core::{
    Authenticator, GatewayMetrics, ProxyService, QuotaTracker, RateLimiter, ResponseCache,
    UsageRecorder,
};
use gandalf_storage::{RouteStore, Store};
use tower_http::catch_panic::CatchPanicLayer;

pub use bootstrap::{GatewayConfig, build_state};

/// Everything the handlers and middleware share. Cheap to clone; per-entry
/// state lives inside the individual registries.
#[derive(Clone)]
pub struct AppState {
    pub authenticator: Arc<dyn Authenticator>,
    pub limiter: Arc<RateLimiter>,
    pub quota: Arc<QuotaTracker>,
    pub cache: Arc<ResponseCache>,
    pub proxy: Arc<ProxyService<dyn RouteStore>>,
    pub recorder: UsageRecorder,
    pub metrics: Arc<GatewayMetrics>,
    pub store: Arc<dyn Store>,
}

/// Build the full router. Layer order is inside-out: the last layer added
/// wraps everything before it, so recovery ends up outermost, then
/// request-id, tracing, metrics, logging; auth and rate limiting apply only
/// to the API surface.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        // Universal OpenAI-compatible surface.
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/embeddings", post(openai::embeddings))
        .route("/v1/models", get(openai::models))
        // Native passthrough surfaces.
        .route("/v1/messages", post(native::anthropic_messages))
        .route("/v1beta/models", get(native::gemini_models))
        .route("/v1beta/models/{model_action}", post(native::gemini_post))
        .route(
            "/openai/deployments/{deployment}/chat/completions",
            post(native::azure_chat),
        )
        .route(
            "/openai/deployments/{deployment}/embeddings",
            post(native::azure_embeddings),
        )
        .route("/api/chat", post(native::ollama_chat))
        .route("/api/embed", post(native::ollama_embed))
        .route("/api/tags", get(native::ollama_tags))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::authenticate,
        ))
        .layer(axum::middleware::from_fn(
            middleware::normalize_auth_headers,
        ));

    Router::new()
        .merge(api)
        .route("/healthz", get(system::healthz))
        .route("/readyz", get(system::readyz))
        .route("/metrics", get(system::metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::log_requests,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::track_metrics,
        ))
        .layer(axum::middleware::from_fn(middleware::trace_span))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(CatchPanicLayer::custom(error::PanicResponder))
        .with_state(state)
}
