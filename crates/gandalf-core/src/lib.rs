//! The gateway hot path: identity resolution, admission control, routing,
//! failover, response caching, and asynchronous usage recording.

pub mod auth;
pub mod breaker;
pub mod cache;
pub mod metrics;
pub mod proxy;
pub mod quota;
pub mod ratelimit;
pub mod router;
pub mod usage;
pub mod workers;

pub use auth::{ApiKeyAuthenticator, Authenticator};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker, error_weight};
pub use cache::{CacheConfig, CachedResponse, ResponseCache, fingerprint, is_cacheable};
pub use metrics::GatewayMetrics;
pub use proxy::ProxyService;
pub use quota::{COST_PER_TOKEN, QuotaSyncWorker, QuotaTracker, token_cost};
pub use ratelimit::{
    RateDenied, RateLimiter, RateSnapshot, estimate_chat_tokens, estimate_embedding_tokens,
};
pub use router::{ResolvedRoute, RouteResolver};
pub use usage::{DEFAULT_QUEUE_CAPACITY, UsageRecorder, UsageWorker};
pub use workers::{SweepWorker, Worker, WorkerRunner};
