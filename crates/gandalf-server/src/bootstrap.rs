use std::sync::Arc;
use std::time::Duration;

use gandalf_core::{
    ApiKeyAuthenticator, BreakerConfig, BreakerRegistry, CacheConfig, GatewayMetrics,
    ProxyService, QuotaSyncWorker, QuotaTracker, RateLimiter, ResponseCache, RouteResolver,
    SweepWorker, UsageRecorder, UsageWorker, WorkerRunner,
};
use gandalf_providers::ProviderRegistry;
use gandalf_storage::{RouteStore, Store, UsageStore};

use crate::AppState;

const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub default_rpm: u32,
    pub default_tpm: u32,
    pub usage_queue_capacity: usize,
    pub quota_sync_interval: Duration,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_rpm: 60,
            default_tpm: 100_000,
            usage_queue_capacity: gandalf_core::DEFAULT_QUEUE_CAPACITY,
            quota_sync_interval: Duration::from_secs(10),
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Wire the hot-path services around a store and a provider registry, and
/// start the background workers under one runner.
pub fn build_state<S: Store + 'static>(
    store: Arc<S>,
    registry: Arc<ProviderRegistry>,
    config: GatewayConfig,
) -> (AppState, WorkerRunner) {
    let metrics = Arc::new(GatewayMetrics::new());
    let limiter = Arc::new(RateLimiter::new());
    let quota = Arc::new(QuotaTracker::new());
    let cache = Arc::new(ResponseCache::new(config.cache));
    let breakers = Arc::new(BreakerRegistry::new(config.breaker));
    let authenticator = Arc::new(ApiKeyAuthenticator::new(
        store.clone(),
        config.default_rpm,
        config.default_tpm,
    ));
    let resolver = Arc::new(RouteResolver::<dyn RouteStore>::new(store.clone()));
    let proxy = Arc::new(ProxyService::new(
        resolver,
        registry,
        breakers.clone(),
        metrics.clone(),
    ));

    let (recorder, usage_rx) = UsageRecorder::channel(
        config.usage_queue_capacity,
        metrics.usage_dropped_total.clone(),
    );
    let usage_store: Arc<dyn UsageStore> = store.clone();
    let usage_worker = Arc::new(UsageWorker::new(usage_rx, usage_store.clone(), &recorder));
    let quota_worker = Arc::new(QuotaSyncWorker::new(
        quota.clone(),
        usage_store,
        config.quota_sync_interval,
    ));

    let mut runner = WorkerRunner::new();
    runner.spawn(usage_worker);
    runner.spawn(quota_worker);
    let limiter_sweep = limiter.clone();
    runner.spawn(Arc::new(SweepWorker::new(
        "limiter-eviction",
        EVICTION_SWEEP_INTERVAL,
        move || limiter_sweep.evict_idle(),
    )));
    let breaker_sweep = breakers.clone();
    runner.spawn(Arc::new(SweepWorker::new(
        "breaker-eviction",
        EVICTION_SWEEP_INTERVAL,
        move || breaker_sweep.evict_idle(),
    )));

    let state = AppState {
        authenticator,
        limiter,
        quota,
        cache,
        proxy,
        recorder,
        metrics,
        store,
    };
    (state, runner)
}
