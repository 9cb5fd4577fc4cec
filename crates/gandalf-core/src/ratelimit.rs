use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use gandalf_common::EffectiveLimits;
use gandalf_protocol::openai::{ChatCompletionRequest, EmbeddingsRequest};

const IDLE_EVICT_AFTER: Duration = Duration::from_secs(60 * 60);

/// Heuristic token estimation: ~4 bytes per token, a small per-message
/// overhead, and a reply primer.
const BYTES_PER_TOKEN: usize = 4;
const PER_MESSAGE_OVERHEAD: u32 = 4;
const REPLY_OVERHEAD: u32 = 8;

/// The original gateway estimates every embeddings request at a flat 100
/// tokens regardless of input size; mirrored here, adjusted post-response.
const EMBEDDINGS_ESTIMATE: u32 = 100;

pub fn estimate_chat_tokens(req: &ChatCompletionRequest) -> u32 {
    let mut tokens = REPLY_OVERHEAD;
    for message in &req.messages {
        let bytes = match &message.content {
            serde_json::Value::String(s) => s.len(),
            other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
        };
        tokens += bytes.div_ceil(BYTES_PER_TOKEN) as u32 + PER_MESSAGE_OVERHEAD;
    }
    tokens
}

pub fn estimate_embedding_tokens(_req: &EmbeddingsRequest) -> u32 {
    EMBEDDINGS_ESTIMATE
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit_per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(limit_per_minute);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: now,
        }
    }

    /// Lazy refill on every touch.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + self.refill_per_sec * elapsed).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Post-response adjustment; a negative delta can push the balance into
    /// debt, which refill pays down first.
    fn add(&mut self, delta: f64, now: Instant) {
        self.refill(now);
        self.tokens = (self.tokens + delta).min(self.capacity);
    }

    fn remaining(&self) -> u64 {
        self.tokens.max(0.0) as u64
    }

    /// Seconds until one unit is available.
    fn retry_after(&self) -> u64 {
        if self.tokens >= 1.0 || self.refill_per_sec <= 0.0 {
            return 1;
        }
        ((1.0 - self.tokens) / self.refill_per_sec).ceil().max(1.0) as u64
    }
}

struct KeyBuckets {
    rpm: Mutex<TokenBucket>,
    tpm: Mutex<TokenBucket>,
    last_used: Mutex<Instant>,
}

impl KeyBuckets {
    fn new(limits: &EffectiveLimits, now: Instant) -> Self {
        Self {
            rpm: Mutex::new(TokenBucket::new(limits.rpm, now)),
            tpm: Mutex::new(TokenBucket::new(limits.tpm, now)),
            last_used: Mutex::new(now),
        }
    }

    fn touch(&self, now: Instant) {
        *self.last_used.lock().expect("limiter lock") = now;
    }
}

/// Bucket balances surfaced as `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy)]
pub struct RateSnapshot {
    pub limit_requests: u32,
    pub remaining_requests: u64,
    pub limit_tokens: u32,
    pub remaining_tokens: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDenied {
    pub snapshot: RateSnapshot,
    pub retry_after_secs: u64,
}

/// Per-key dual token buckets (requests/min, tokens/min) with lazy refill
/// and idle eviction. Entry state lives behind its own mutexes; the map
/// lock only guards the map.
pub struct RateLimiter {
    buckets: DashMap<i64, Arc<KeyBuckets>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    fn entry(&self, key_id: i64, limits: &EffectiveLimits, now: Instant) -> Arc<KeyBuckets> {
        if let Some(entry) = self.buckets.get(&key_id) {
            entry.touch(now);
            return entry.clone();
        }
        let entry = self
            .buckets
            .entry(key_id)
            .or_insert_with(|| Arc::new(KeyBuckets::new(limits, now)))
            .clone();
        entry.touch(now);
        entry
    }

    fn snapshot_of(entry: &KeyBuckets, limits: &EffectiveLimits) -> RateSnapshot {
        RateSnapshot {
            limit_requests: limits.rpm,
            remaining_requests: entry.rpm.lock().expect("limiter lock").remaining(),
            limit_tokens: limits.tpm,
            remaining_tokens: entry.tpm.lock().expect("limiter lock").remaining(),
        }
    }

    /// Consume one request token; called pre-decode on request entry.
    pub fn check_rpm(
        &self,
        key_id: i64,
        limits: &EffectiveLimits,
    ) -> Result<RateSnapshot, RateDenied> {
        let now = Instant::now();
        let entry = self.entry(key_id, limits, now);
        let allowed = entry.rpm.lock().expect("limiter lock").try_consume(1.0, now);
        let snapshot = Self::snapshot_of(&entry, limits);
        if allowed {
            Ok(snapshot)
        } else {
            let retry_after_secs = entry.rpm.lock().expect("limiter lock").retry_after();
            Err(RateDenied {
                snapshot,
                retry_after_secs,
            })
        }
    }

    /// Estimate-then-consume phase of the two-phase TPM check.
    pub fn reserve_tpm(
        &self,
        key_id: i64,
        limits: &EffectiveLimits,
        estimated_tokens: u32,
    ) -> Result<RateSnapshot, RateDenied> {
        let now = Instant::now();
        let entry = self.entry(key_id, limits, now);
        let allowed = entry
            .tpm
            .lock()
            .expect("limiter lock")
            .try_consume(f64::from(estimated_tokens), now);
        let snapshot = Self::snapshot_of(&entry, limits);
        if allowed {
            Ok(snapshot)
        } else {
            let retry_after_secs = entry.tpm.lock().expect("limiter lock").retry_after();
            Err(RateDenied {
                snapshot,
                retry_after_secs,
            })
        }
    }

    /// Adjust phase: return `estimated - actual` to the bucket (negative
    /// when the estimate was low).
    pub fn adjust_tpm(&self, key_id: i64, estimated_tokens: u32, actual_tokens: u32) {
        let Some(entry) = self.buckets.get(&key_id) else {
            return;
        };
        let delta = f64::from(estimated_tokens) - f64::from(actual_tokens);
        entry
            .tpm
            .lock()
            .expect("limiter lock")
            .add(delta, Instant::now());
    }

    pub fn snapshot(&self, key_id: i64, limits: &EffectiveLimits) -> RateSnapshot {
        let now = Instant::now();
        let entry = self.entry(key_id, limits, now);
        {
            let mut rpm = entry.rpm.lock().expect("limiter lock");
            rpm.refill(now);
        }
        {
            let mut tpm = entry.tpm.lock().expect("limiter lock");
            tpm.refill(now);
        }
        Self::snapshot_of(&entry, limits)
    }

    /// Drop bucket pairs idle for more than an hour.
    pub fn evict_idle(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, entry| {
            now.saturating_duration_since(*entry.last_used.lock().expect("limiter lock"))
                < IDLE_EVICT_AFTER
        });
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits(rpm: u32, tpm: u32) -> EffectiveLimits {
        EffectiveLimits {
            rpm,
            tpm,
            max_budget: None,
        }
    }

    #[test]
    fn rpm_denies_when_exhausted() {
        let limiter = RateLimiter::new();
        let limits = limits(2, 1000);
        assert!(limiter.check_rpm(1, &limits).is_ok());
        assert!(limiter.check_rpm(1, &limits).is_ok());
        let denied = limiter.check_rpm(1, &limits).unwrap_err();
        assert_eq!(denied.snapshot.remaining_requests, 0);
        assert!(denied.retry_after_secs >= 1);
    }

    #[test]
    fn tpm_reserve_and_adjust_round_trip() {
        let limiter = RateLimiter::new();
        let limits = limits(100, 1000);
        let estimated = 300u32;
        let actual = 120u32;

        let before = limiter.snapshot(1, &limits).remaining_tokens;
        limiter.reserve_tpm(1, &limits, estimated).unwrap();
        limiter.adjust_tpm(1, estimated, actual);
        let after = limiter.snapshot(1, &limits).remaining_tokens;
        // Net effect equals the actual spend (modulo sub-second refill).
        assert!(before - after >= u64::from(actual) - 1);
        assert!(before - after <= u64::from(actual));
    }

    #[test]
    fn tpm_denial_is_a_denial_before_upstream() {
        let limiter = RateLimiter::new();
        let limits = limits(100, 1);
        let denied = limiter.reserve_tpm(1, &limits, 12).unwrap_err();
        assert_eq!(denied.snapshot.limit_tokens, 1);
        assert!(denied.retry_after_secs >= 1);
    }

    #[test]
    fn underestimate_pushes_bucket_into_debt() {
        let limiter = RateLimiter::new();
        let limits = limits(100, 100);
        limiter.reserve_tpm(1, &limits, 10).unwrap();
        limiter.adjust_tpm(1, 10, 300);
        // Balance went negative; remaining clamps at zero for headers.
        let snapshot = limiter.snapshot(1, &limits);
        assert_eq!(snapshot.remaining_tokens, 0);
        assert!(limiter.reserve_tpm(1, &limits, 1).is_err());
    }

    #[test]
    fn distinct_keys_have_independent_buckets() {
        let limiter = RateLimiter::new();
        let limits = limits(1, 1000);
        assert!(limiter.check_rpm(1, &limits).is_ok());
        assert!(limiter.check_rpm(1, &limits).is_err());
        assert!(limiter.check_rpm(2, &limits).is_ok());
    }

    #[test]
    fn chat_estimate_scales_with_content() {
        let small: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();
        let large: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "a".repeat(4000)}],
        }))
        .unwrap();
        let small_estimate = estimate_chat_tokens(&small);
        let large_estimate = estimate_chat_tokens(&large);
        assert!(small_estimate >= REPLY_OVERHEAD + PER_MESSAGE_OVERHEAD + 1);
        assert!(large_estimate >= small_estimate + 900);
    }

    #[test]
    fn embeddings_estimate_is_flat() {
        let req: EmbeddingsRequest = serde_json::from_value(json!({
            "model": "m",
            "input": "x".repeat(100_000),
        }))
        .unwrap();
        assert_eq!(estimate_embedding_tokens(&req), 100);
    }
}
