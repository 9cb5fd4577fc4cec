use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::records::{
    ApiKeyRecord, Organization, ProviderRecord, RouteRecord, Team, UsageRecord,
};
use crate::store::{
    KeyStore, ProviderStore, RouteStore, Store, StoreError, StoreResult, UsageStore,
};

/// In-memory store backing tests and the default single-process binary.
#[derive(Default)]
pub struct MemoryStore {
    keys: RwLock<HashMap<String, ApiKeyRecord>>,
    key_last_used: RwLock<HashMap<i64, OffsetDateTime>>,
    orgs: RwLock<HashMap<i64, Organization>>,
    teams: RwLock<HashMap<i64, Team>>,
    routes: RwLock<HashMap<String, RouteRecord>>,
    providers: RwLock<Vec<ProviderRecord>>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_key(&self, record: ApiKeyRecord) {
        self.keys
            .write()
            .await
            .insert(record.key_hash.clone(), record);
    }

    pub async fn remove_key(&self, id: i64) {
        self.keys.write().await.retain(|_, k| k.id != id);
    }

    pub async fn insert_org(&self, org: Organization) {
        self.orgs.write().await.insert(org.id, org);
    }

    pub async fn insert_team(&self, team: Team) {
        self.teams.write().await.insert(team.id, team);
    }

    pub async fn insert_route(&self, route: RouteRecord) {
        self.routes
            .write()
            .await
            .insert(route.alias.clone(), route);
    }

    pub async fn set_providers(&self, providers: Vec<ProviderRecord>) {
        *self.providers.write().await = providers;
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.read().await.clone()
    }

    pub async fn key_last_used(&self, id: i64) -> Option<OffsetDateTime> {
        self.key_last_used.read().await.get(&id).copied()
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn key_by_hash(&self, hash: &str) -> StoreResult<ApiKeyRecord> {
        self.keys
            .read()
            .await
            .get(hash)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn touch_key_last_used(&self, id: i64, at: OffsetDateTime) -> StoreResult<()> {
        self.key_last_used.write().await.insert(id, at);
        Ok(())
    }

    async fn org(&self, id: i64) -> StoreResult<Organization> {
        self.orgs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn team(&self, id: i64) -> StoreResult<Team> {
        self.teams
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl RouteStore for MemoryStore {
    async fn route_by_alias(&self, alias: &str) -> StoreResult<RouteRecord> {
        self.routes
            .read()
            .await
            .get(alias)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl ProviderStore for MemoryStore {
    async fn providers(&self) -> StoreResult<Vec<ProviderRecord>> {
        Ok(self.providers.read().await.clone())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn append_usage(&self, records: &[UsageRecord]) -> StoreResult<()> {
        self.usage.write().await.extend_from_slice(records);
        Ok(())
    }

    async fn usage_cost_since(&self, key_id: i64, since: OffsetDateTime) -> StoreResult<f64> {
        Ok(self
            .usage
            .read()
            .await
            .iter()
            .filter(|r| r.key_id == key_id && r.created_at >= since)
            .map(|r| r.cost)
            .sum())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gandalf_common::Role;

    fn key(id: i64, hash: &str) -> ApiKeyRecord {
        ApiKeyRecord {
            id,
            key_hash: hash.to_string(),
            key_prefix: "gnd_test".to_string(),
            org_id: None,
            team_id: None,
            user_id: None,
            role: Role::Member,
            limits: Default::default(),
            allowed_models: None,
            expires_at: None,
            blocked: false,
        }
    }

    #[tokio::test]
    async fn key_lookup_by_hash() {
        let store = MemoryStore::new();
        store.insert_key(key(1, "aa")).await;
        assert_eq!(store.key_by_hash("aa").await.unwrap().id, 1);
        assert!(matches!(
            store.key_by_hash("bb").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn usage_cost_sums_per_key() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let row = |key_id, cost| UsageRecord {
            request_id: "r".to_string(),
            key_id,
            org_id: None,
            team_id: None,
            user_id: None,
            model: "m".to_string(),
            provider: "p".to_string(),
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            cost,
            cached: false,
            latency_ms: 5,
            status: 200,
            created_at: now,
        };
        store
            .append_usage(&[row(1, 0.5), row(1, 0.25), row(2, 1.0)])
            .await
            .unwrap();
        let since = now - time::Duration::minutes(1);
        assert_eq!(store.usage_cost_since(1, since).await.unwrap(), 0.75);
        assert_eq!(store.usage_cost_since(2, since).await.unwrap(), 1.0);
    }
}
