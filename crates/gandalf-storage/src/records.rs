use gandalf_common::{LimitOverrides, Role};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Persisted API key. Only the SHA-256 hash of the plaintext is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub key_hash: String,
    /// First 12 chars of the plaintext, for display in listings.
    pub key_prefix: String,
    pub org_id: Option<i64>,
    pub team_id: Option<i64>,
    pub user_id: Option<i64>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub limits: LimitOverrides,
    pub allowed_models: Option<Vec<String>>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub provider_id: String,
    pub upstream_model: String,
    /// Lower value = tried first.
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRecord {
    pub alias: String,
    pub targets: Vec<RouteTarget>,
    /// `None` means "use the global default response-cache TTL".
    pub cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub limits: LimitOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub org_id: i64,
    pub name: String,
    #[serde(default)]
    pub limits: LimitOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub name: String,
    /// Adapter family: "openai" | "azure" | "anthropic" | "gemini" | "ollama".
    pub kind: String,
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// One row per completed request, drained in batches by the usage recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub key_id: i64,
    pub org_id: Option<i64>,
    pub team_id: Option<i64>,
    pub user_id: Option<i64>,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost: f64,
    pub cached: bool,
    pub latency_ms: u64,
    pub status: u16,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
