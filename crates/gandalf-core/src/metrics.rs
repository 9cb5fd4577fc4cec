use prometheus::{
    Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

/// Typed metric set backing `/metrics`.
#[derive(Clone)]
pub struct GatewayMetrics {
    pub registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub http_in_flight: IntGauge,
    pub http_request_duration_seconds: HistogramVec,
    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,
    pub usage_dropped_total: IntCounter,
    pub rate_limited_total: IntCounter,
    pub breaker_opened_total: IntCounterVec,
    pub upstream_errors_total: IntCounterVec,
    pub upstream_latency_seconds: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let http_requests_total = IntCounterVec::new(
            prometheus::Opts::new("gateway_http_requests_total", "HTTP requests served"),
            &["method", "route", "status"],
        )
        .unwrap();
        let http_in_flight = IntGauge::new(
            "gateway_http_in_flight",
            "Requests currently being served",
        )
        .unwrap();
        let http_request_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "gateway_http_request_duration_seconds",
                "Request duration by route",
            )
            .buckets(vec![
                0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ]),
            &["route"],
        )
        .unwrap();
        let cache_hits_total = IntCounter::new(
            "gateway_response_cache_hits_total",
            "Responses served from the cache",
        )
        .unwrap();
        let cache_misses_total = IntCounter::new(
            "gateway_response_cache_misses_total",
            "Cacheable requests that missed",
        )
        .unwrap();
        let usage_dropped_total = IntCounter::new(
            "gateway_usage_dropped_total",
            "Usage records dropped on queue overflow",
        )
        .unwrap();
        let rate_limited_total = IntCounter::new(
            "gateway_rate_limited_total",
            "Requests denied by a rate limit",
        )
        .unwrap();
        let breaker_opened_total = IntCounterVec::new(
            prometheus::Opts::new(
                "gateway_breaker_opened_total",
                "Circuit breaker open transitions",
            ),
            &["provider"],
        )
        .unwrap();
        let upstream_errors_total = IntCounterVec::new(
            prometheus::Opts::new("gateway_upstream_errors_total", "Upstream call failures"),
            &["provider"],
        )
        .unwrap();
        let upstream_latency_seconds = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "gateway_upstream_latency_seconds",
                "Upstream call latency",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .unwrap();

        let _ = registry.register(Box::new(http_requests_total.clone()));
        let _ = registry.register(Box::new(http_in_flight.clone()));
        let _ = registry.register(Box::new(http_request_duration_seconds.clone()));
        let _ = registry.register(Box::new(cache_hits_total.clone()));
        let _ = registry.register(Box::new(cache_misses_total.clone()));
        let _ = registry.register(Box::new(usage_dropped_total.clone()));
        let _ = registry.register(Box::new(rate_limited_total.clone()));
        let _ = registry.register(Box::new(breaker_opened_total.clone()));
        let _ = registry.register(Box::new(upstream_errors_total.clone()));
        let _ = registry.register(Box::new(upstream_latency_seconds.clone()));

        GatewayMetrics {
            registry,
            http_requests_total,
            http_in_flight,
            http_request_duration_seconds,
            cache_hits_total,
            cache_misses_total,
            usage_dropped_total,
            rate_limited_total,
            breaker_opened_total,
            upstream_errors_total,
            upstream_latency_seconds,
        }
    }

    /// Prometheus text exposition of everything registered.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_counters() {
        let metrics = GatewayMetrics::new();
        metrics
            .http_requests_total
            .with_label_values(&["POST", "/v1/chat/completions", "200"])
            .inc();
        metrics.cache_hits_total.inc();
        let text = metrics.render();
        assert!(text.contains("gateway_http_requests_total"));
        assert!(text.contains("gateway_response_cache_hits_total 1"));
    }
}
