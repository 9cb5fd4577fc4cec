use async_trait::async_trait;
use time::OffsetDateTime;

use crate::records::{
    ApiKeyRecord, Organization, ProviderRecord, RouteRecord, Team, UsageRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Conflict,
    #[error("storage backend: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn key_by_hash(&self, hash: &str) -> StoreResult<ApiKeyRecord>;
    /// Best-effort; callers run this detached with their own deadline.
    async fn touch_key_last_used(&self, id: i64, at: OffsetDateTime) -> StoreResult<()>;
    async fn org(&self, id: i64) -> StoreResult<Organization>;
    async fn team(&self, id: i64) -> StoreResult<Team>;
}

#[async_trait]
pub trait RouteStore: Send + Sync {
    async fn route_by_alias(&self, alias: &str) -> StoreResult<RouteRecord>;
}

#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn providers(&self) -> StoreResult<Vec<ProviderRecord>>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// One write per batch; the recorder never appends row-by-row.
    async fn append_usage(&self, records: &[UsageRecord]) -> StoreResult<()>;
    async fn usage_cost_since(&self, key_id: i64, since: OffsetDateTime) -> StoreResult<f64>;
}

#[async_trait]
pub trait Store: KeyStore + RouteStore + ProviderStore + UsageStore {
    async fn ping(&self) -> StoreResult<()>;
}
