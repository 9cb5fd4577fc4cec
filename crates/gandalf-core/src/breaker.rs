use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use gandalf_common::{Error, TransportKind};

const RING_SECONDS: usize = 60;
const IDLE_EVICT_AFTER: Duration = Duration::from_secs(60 * 60);

/// Weight a failure contributes to the provider-health window.
///
/// 4xx responses other than 429 say nothing about provider health and weigh
/// zero; timeouts weigh heaviest.
pub fn error_weight(err: Option<&Error>) -> f64 {
    let Some(err) = err else { return 0.0 };
    if let Some(status) = err.upstream_status() {
        return match status {
            429 => 0.5,
            500 | 502 | 503 | 504 => 1.0,
            s if (400..500).contains(&s) => 0.0,
            s if (500..600).contains(&s) => 1.0,
            _ => 0.0,
        };
    }
    match err.transport_kind() {
        Some(TransportKind::Timeout) => 1.5,
        Some(TransportKind::Connect) | Some(TransportKind::Other) => 1.0,
        // No upstream signal at all (e.g. unsupported operation).
        None => 0.0,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub min_samples: u32,
    pub error_threshold: f64,
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_samples: 20,
            error_threshold: 0.5,
            open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    weighted_errors: f64,
    total: u32,
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { probe_outstanding: bool },
}

#[derive(Debug)]
struct Inner {
    ring: [Bucket; RING_SECONDS],
    head: usize,
    head_second: u64,
    phase: Phase,
    last_used: Instant,
}

impl Inner {
    fn new(now: Instant) -> Self {
        Self {
            ring: [Bucket::default(); RING_SECONDS],
            head: 0,
            head_second: 0,
            phase: Phase::Closed,
            last_used: now,
        }
    }

    /// Advance the head to the current wall second, zeroing skipped buckets
    /// (bounded by the ring size).
    fn advance(&mut self, now_second: u64) {
        if now_second <= self.head_second {
            return;
        }
        let skipped = (now_second - self.head_second).min(RING_SECONDS as u64) as usize;
        for _ in 0..skipped {
            self.head = (self.head + 1) % RING_SECONDS;
            self.ring[self.head] = Bucket::default();
        }
        self.head_second = now_second;
    }

    fn record(&mut self, now_second: u64, weight: f64) {
        self.advance(now_second);
        let bucket = &mut self.ring[self.head];
        bucket.weighted_errors += weight;
        bucket.total += 1;
    }

    fn error_rate(&self) -> (f64, u32) {
        let mut weighted = 0.0;
        let mut total = 0u32;
        for bucket in &self.ring {
            weighted += bucket.weighted_errors;
            total += bucket.total;
        }
        if total == 0 {
            (0.0, 0)
        } else {
            (weighted / f64::from(total), total)
        }
    }

    fn reset_ring(&mut self) {
        self.ring = [Bucket::default(); RING_SECONDS];
    }
}

/// Per-provider sliding-window weighted error-rate breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    epoch: Instant,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            epoch: now,
            inner: Mutex::new(Inner::new(now)),
        }
    }

    fn second_of(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_secs()
    }

    pub fn state(&self) -> BreakerState {
        match self.inner.lock().expect("breaker lock").phase {
            Phase::Closed => BreakerState::Closed,
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub(crate) fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.last_used = now;
        match inner.phase {
            Phase::Closed => true,
            Phase::Open { opened_at } => {
                if now.saturating_duration_since(opened_at) < self.config.open_timeout {
                    return false;
                }
                // Admit exactly one probe.
                inner.phase = Phase::HalfOpen {
                    probe_outstanding: true,
                };
                true
            }
            Phase::HalfOpen {
                ref mut probe_outstanding,
            } => {
                if *probe_outstanding {
                    false
                } else {
                    *probe_outstanding = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    pub(crate) fn record_success_at(&self, now: Instant) {
        let second = self.second_of(now);
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.last_used = now;
        match inner.phase {
            Phase::HalfOpen { .. } => {
                inner.phase = Phase::Closed;
                inner.reset_ring();
            }
            _ => inner.record(second, 0.0),
        }
    }

    /// Returns `true` when this call transitioned the breaker to `open`
    /// (the closed-state trip or a failed half-open probe), so the caller
    /// can count open transitions.
    pub fn record_error(&self, weight: f64) -> bool {
        self.record_error_at(Instant::now(), weight)
    }

    pub(crate) fn record_error_at(&self, now: Instant, weight: f64) -> bool {
        let second = self.second_of(now);
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.last_used = now;
        match inner.phase {
            Phase::HalfOpen { .. } => {
                // Probe failed; back to open.
                inner.phase = Phase::Open { opened_at: now };
                true
            }
            Phase::Open { .. } => false,
            Phase::Closed => {
                inner.record(second, weight);
                let (rate, samples) = inner.error_rate();
                if samples >= self.config.min_samples && rate >= self.config.error_threshold {
                    inner.phase = Phase::Open { opened_at: now };
                    return true;
                }
                false
            }
        }
    }

    /// Force the breaker open; used by admin tooling and tests.
    pub fn trip(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.phase = Phase::Open {
            opened_at: Instant::now(),
        };
    }

    pub fn error_rate(&self) -> (f64, u32) {
        self.inner.lock().expect("breaker lock").error_rate()
    }

    fn idle_since(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inner.lock().expect("breaker lock").last_used)
    }
}

/// Lazily populated per-provider breaker map.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(provider) {
            return breaker.clone();
        }
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config)))
            .clone()
    }

    /// Drop breakers idle for more than an hour.
    pub fn evict_idle(&self) {
        let now = Instant::now();
        self.breakers
            .retain(|_, breaker| breaker.idle_since(now) < IDLE_EVICT_AFTER);
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gandalf_common::ErrorKind;

    fn config() -> BreakerConfig {
        BreakerConfig {
            min_samples: 4,
            error_threshold: 0.5,
            open_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn weights_follow_the_signal_table() {
        assert_eq!(error_weight(None), 0.0);
        assert_eq!(error_weight(Some(&Error::upstream(429, "x"))), 0.5);
        assert_eq!(error_weight(Some(&Error::upstream(500, "x"))), 1.0);
        assert_eq!(error_weight(Some(&Error::upstream(503, "x"))), 1.0);
        assert_eq!(error_weight(Some(&Error::upstream(400, "x"))), 0.0);
        assert_eq!(error_weight(Some(&Error::upstream(404, "x"))), 0.0);

        let timeout = Error::transport(TransportKind::Timeout, "t", std::io::Error::other("t"));
        assert_eq!(error_weight(Some(&timeout)), 1.5);
        let connect = Error::transport(TransportKind::Connect, "c", std::io::Error::other("c"));
        assert_eq!(error_weight(Some(&connect)), 1.0);
        assert_eq!(error_weight(Some(&Error::new(ErrorKind::Provider, "x"))), 0.0);
    }

    #[test]
    fn trips_when_samples_and_rate_reach_thresholds() {
        let breaker = CircuitBreaker::new(config());
        let start = Instant::now();

        for i in 0..3 {
            assert!(!breaker.record_error_at(start + Duration::from_millis(i * 10), 1.0));
            assert!(breaker.allow_at(start + Duration::from_millis(i * 10 + 1)));
        }
        // Fourth sample reaches min_samples with rate 1.0.
        assert!(breaker.record_error_at(start + Duration::from_millis(40), 1.0));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_at(start + Duration::from_millis(50)));
        // Already open: further errors are not new open transitions.
        assert!(!breaker.record_error_at(start + Duration::from_millis(60), 1.0));
    }

    #[test]
    fn successes_dilute_the_rate_below_threshold() {
        let breaker = CircuitBreaker::new(config());
        let start = Instant::now();
        for i in 0..6 {
            breaker.record_success_at(start + Duration::from_millis(i));
        }
        breaker.record_error_at(start + Duration::from_millis(10), 1.0);
        breaker.record_error_at(start + Duration::from_millis(11), 1.0);
        // 2 weighted / 8 samples = 0.25 < 0.5.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn open_admits_exactly_one_probe_after_timeout() {
        let breaker = CircuitBreaker::new(config());
        let start = Instant::now();
        for i in 0..4 {
            breaker.record_error_at(start + Duration::from_millis(i), 1.0);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let before_timeout = start + Duration::from_secs(29);
        assert!(!breaker.allow_at(before_timeout));

        let after_timeout = start + Duration::from_secs(31);
        assert!(breaker.allow_at(after_timeout));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Probe outstanding: no further admissions.
        assert!(!breaker.allow_at(after_timeout + Duration::from_millis(1)));
        assert!(!breaker.allow_at(after_timeout + Duration::from_millis(2)));
    }

    #[test]
    fn probe_outcome_resolves_the_state() {
        let breaker = CircuitBreaker::new(config());
        let start = Instant::now();
        for i in 0..4 {
            breaker.record_error_at(start + Duration::from_millis(i), 1.0);
        }
        let probe_at = start + Duration::from_secs(31);
        assert!(breaker.allow_at(probe_at));
        breaker.record_success_at(probe_at + Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::Closed);
        // Ring was reset with the transition.
        assert_eq!(breaker.error_rate(), (0.0, 0));

        // Trip again; this time the probe fails.
        for i in 0..4 {
            breaker.record_error_at(probe_at + Duration::from_secs(1) + Duration::from_millis(i), 1.0);
        }
        let second_probe = probe_at + Duration::from_secs(40);
        assert!(breaker.allow_at(second_probe));
        // A failed probe is an open transition.
        assert!(breaker.record_error_at(second_probe + Duration::from_millis(5), 1.0));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_at(second_probe + Duration::from_secs(1)));
    }

    #[test]
    fn window_slides_old_buckets_out() {
        let breaker = CircuitBreaker::new(config());
        let start = Instant::now();
        breaker.record_error_at(start, 1.0);
        breaker.record_error_at(start + Duration::from_secs(1), 1.0);
        assert_eq!(breaker.error_rate().1, 2);

        // 90 seconds later both buckets have rotated out.
        breaker.record_success_at(start + Duration::from_secs(90));
        let (rate, samples) = breaker.error_rate();
        assert_eq!(samples, 1);
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn registry_is_lazy_and_evicts_idle() {
        let registry = BreakerRegistry::new(config());
        assert!(registry.is_empty());
        let a = registry.get("openai");
        let b = registry.get("openai");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        // Freshly used breakers survive a sweep.
        registry.evict_idle();
        assert_eq!(registry.len(), 1);
    }
}
