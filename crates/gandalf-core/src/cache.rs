use std::fmt::Write as _;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gandalf_protocol::openai::{ChatCompletionRequest, Usage};
use sha2::{Digest, Sha256};

/// Temperature at or below which a chat request counts as deterministic
/// enough to cache (unless a seed pins it anyway).
const CACHEABLE_TEMPERATURE: f64 = 0.3;

/// Chat-only cacheability predicate: non-stream, single choice, and either
/// seeded or effectively deterministic.
pub fn is_cacheable(req: &ChatCompletionRequest) -> bool {
    if req.is_stream() {
        return false;
    }
    if req.n.unwrap_or(1) > 1 {
        return false;
    }
    req.seed.is_some()
        || req
            .temperature
            .map(|t| t <= CACHEABLE_TEMPERATURE)
            .unwrap_or(false)
}

/// Request fingerprint: SHA-256 over a deterministic serialization.
///
/// Field order is fixed, floats are rounded to 4 decimal places, absent
/// fields are omitted, and message content is preserved byte-exact. The
/// caller's key id is part of the fingerprint so entries cannot leak across
/// callers. `stream`, `user`, `n`, `logprobs`, and the request id are
/// deliberately excluded.
pub fn fingerprint(key_id: i64, req: &ChatCompletionRequest) -> String {
    let mut canon = String::new();
    let _ = write!(canon, "key_id={key_id};model={};", req.model);

    canon.push_str("messages=[");
    for message in &req.messages {
        let content = serde_json::to_string(&message.content).unwrap_or_default();
        let _ = write!(canon, "{{role={};content={content}}}", message.role);
    }
    canon.push_str("];");

    if let Some(v) = req.temperature {
        let _ = write!(canon, "temperature={v:.4};");
    }
    if let Some(v) = req.top_p {
        let _ = write!(canon, "top_p={v:.4};");
    }
    if let Some(v) = req.max_tokens {
        let _ = write!(canon, "max_tokens={v};");
    }
    if let Some(v) = &req.stop {
        let _ = write!(canon, "stop={};", serde_json::to_string(v).unwrap_or_default());
    }
    if let Some(v) = req.presence_penalty {
        let _ = write!(canon, "presence_penalty={v:.4};");
    }
    if let Some(v) = req.frequency_penalty {
        let _ = write!(canon, "frequency_penalty={v:.4};");
    }
    if let Some(v) = req.seed {
        let _ = write!(canon, "seed={v};");
    }
    if let Some(v) = &req.tools {
        let _ = write!(canon, "tools={};", serde_json::to_string(v).unwrap_or_default());
    }
    if let Some(v) = &req.tool_choice {
        let _ = write!(
            canon,
            "tool_choice={};",
            serde_json::to_string(v).unwrap_or_default()
        );
    }
    if let Some(v) = &req.response_format {
        let _ = write!(
            canon,
            "response_format={};",
            serde_json::to_string(v).unwrap_or_default()
        );
    }

    hex::encode(Sha256::digest(canon.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Bytes,
    pub usage: Option<Usage>,
    pub provider: String,
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl: Duration::from_secs(300),
        }
    }
}

struct PerEntryExpiry;

impl moka::Expiry<String, CachedResponse> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResponse,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded response cache with per-entry absolute expiry.
///
/// Expiry is enforced both by the backing cache policy and on read, so an
/// entry is never served past its deadline even before eviction runs.
pub struct ResponseCache {
    cache: moka::sync::Cache<String, CachedResponse>,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            cache: moka::sync::Cache::builder()
                .max_capacity(config.max_entries)
                .expire_after(PerEntryExpiry)
                .build(),
            default_ttl: config.default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let entry = self.cache.get(key)?;
        if entry.expires_at <= Instant::now() {
            self.cache.invalidate(key);
            return None;
        }
        Some(entry)
    }

    /// Store a response; `ttl` of zero falls back to the global default.
    pub fn insert(
        &self,
        key: String,
        body: Bytes,
        usage: Option<Usage>,
        provider: String,
        ttl: Duration,
    ) {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        self.cache.insert(
            key,
            CachedResponse {
                body,
                usage,
                provider,
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn purge(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    fn cacheable_request() -> ChatCompletionRequest {
        request(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.0,
        }))
    }

    #[test]
    fn cacheability_predicate() {
        assert!(is_cacheable(&cacheable_request()));

        // Seed alone qualifies, whatever the temperature.
        let seeded = request(json!({
            "model": "m", "messages": [], "seed": 42, "temperature": 1.0,
        }));
        assert!(is_cacheable(&seeded));

        // Negating any one condition disqualifies.
        let streaming = request(json!({
            "model": "m", "messages": [], "temperature": 0.0, "stream": true,
        }));
        assert!(!is_cacheable(&streaming));
        let multi = request(json!({
            "model": "m", "messages": [], "temperature": 0.0, "n": 2,
        }));
        assert!(!is_cacheable(&multi));
        let hot = request(json!({
            "model": "m", "messages": [], "temperature": 0.7,
        }));
        assert!(!is_cacheable(&hot));
        let default_temperature = request(json!({"model": "m", "messages": []}));
        assert!(!is_cacheable(&default_temperature));
    }

    #[test]
    fn fingerprint_scoped_to_caller() {
        let req = cacheable_request();
        assert_ne!(fingerprint(1, &req), fingerprint(2, &req));
        assert_eq!(fingerprint(1, &req), fingerprint(1, &req));
    }

    #[test]
    fn fingerprint_ignores_excluded_fields() {
        let base = cacheable_request();
        let mut with_user = cacheable_request();
        with_user.user = Some("someone".to_string());
        with_user.logprobs = Some(true);
        assert_eq!(fingerprint(1, &base), fingerprint(1, &with_user));
    }

    #[test]
    fn fingerprint_rounds_floats() {
        let a = request(json!({
            "model": "m", "messages": [], "temperature": 0.30001,
        }));
        let b = request(json!({
            "model": "m", "messages": [], "temperature": 0.30004,
        }));
        let c = request(json!({
            "model": "m", "messages": [], "temperature": 0.2,
        }));
        assert_eq!(fingerprint(1, &a), fingerprint(1, &b));
        assert_ne!(fingerprint(1, &a), fingerprint(1, &c));
    }

    #[test]
    fn fingerprint_preserves_content_case() {
        let lower = request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hello"}],
        }));
        let upper = request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "HELLO"}],
        }));
        assert_ne!(fingerprint(1, &lower), fingerprint(1, &upper));
    }

    #[test]
    fn read_side_expiry_is_enforced() {
        let cache = ResponseCache::new(CacheConfig::default());
        cache.insert(
            "k".to_string(),
            Bytes::from_static(b"{}"),
            None,
            "openai".to_string(),
            Duration::from_nanos(1),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn hit_returns_stored_bytes_unchanged() {
        let cache = ResponseCache::new(CacheConfig::default());
        let body = Bytes::from_static(b"{\"id\":\"chatcmpl-1\"}");
        cache.insert(
            "k".to_string(),
            body.clone(),
            Some(Usage::new(1, 2)),
            "openai".to_string(),
            Duration::from_secs(60),
        );
        let entry = cache.get("k").unwrap();
        assert_eq!(entry.body, body);
        assert_eq!(entry.usage.unwrap().total_tokens, 3);
    }
}
