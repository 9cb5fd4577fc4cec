use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use gandalf_common::apikey::{KEY_PREFIX, hash_key};
use gandalf_common::{
    EffectiveLimits, Error, ErrorKind, Identity, LimitOverrides, Result,
};
use gandalf_storage::{ApiKeyRecord, KeyStore, StoreError};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

const CACHE_TTL: Duration = Duration::from_secs(30);
const CACHE_CAPACITY: u64 = 10_000;
const TOUCH_DEADLINE: Duration = Duration::from_secs(2);

/// Named interface the middleware talks to; concrete wiring decides whether
/// keys come from the store, a static table, or a test double.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Raw bearer token → Identity, or one of
    /// `Unauthorized | KeyBlocked | KeyExpired`.
    async fn authenticate(&self, token: &str) -> Result<Identity>;

    /// Drop any cached state for a key; called by admin mutations. After
    /// this returns, no subsequent authenticate serves the stale entry.
    fn invalidate_by_key_id(&self, key_id: i64);
}

#[derive(Clone)]
struct CacheEntry {
    record: Arc<ApiKeyRecord>,
    identity: Identity,
}

/// API-key authenticator with a 30-second bounded lookup cache.
pub struct ApiKeyAuthenticator<S: ?Sized> {
    store: Arc<S>,
    cache: moka::sync::Cache<String, CacheEntry>,
    /// key id → hash, for explicit invalidation.
    hashes_by_id: DashMap<i64, String>,
    default_rpm: u32,
    default_tpm: u32,
}

impl<S: KeyStore + ?Sized + 'static> ApiKeyAuthenticator<S> {
    pub fn new(store: Arc<S>, default_rpm: u32, default_tpm: u32) -> Self {
        Self {
            store,
            cache: moka::sync::Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
            hashes_by_id: DashMap::new(),
            default_rpm,
            default_tpm,
        }
    }

    fn enforce(&self, record: &ApiKeyRecord, hash: &str) -> Result<()> {
        if record.blocked {
            return Err(Error::new(ErrorKind::KeyBlocked, "api key blocked"));
        }
        if let Some(expires_at) = record.expires_at
            && expires_at <= OffsetDateTime::now_utc()
        {
            self.cache.invalidate(hash);
            self.hashes_by_id.remove(&record.id);
            return Err(Error::new(ErrorKind::KeyExpired, "api key expired"));
        }
        Ok(())
    }

    async fn build_identity(&self, record: &ApiKeyRecord) -> Identity {
        let team_limits = match record.team_id {
            Some(id) => self
                .store
                .team(id)
                .await
                .map(|t| t.limits)
                .unwrap_or_default(),
            None => LimitOverrides::default(),
        };
        let org_limits = match record.org_id {
            Some(id) => self
                .store
                .org(id)
                .await
                .map(|o| o.limits)
                .unwrap_or_default(),
            None => LimitOverrides::default(),
        };
        let limits = EffectiveLimits::resolve(
            record.limits,
            team_limits,
            org_limits,
            self.default_rpm,
            self.default_tpm,
        );
        Identity {
            subject: format!("key:{}", record.id),
            key_id: record.id,
            org_id: record.org_id,
            team_id: record.team_id,
            user_id: record.user_id,
            role: record.role,
            permissions: record.role.permissions(),
            limits,
            allowed_models: record.allowed_models.clone(),
        }
    }

    fn touch_last_used(&self, key_id: i64) {
        // Detached and best-effort; a slow store must not hold the request.
        let store = self.store.clone();
        tokio::spawn(async move {
            let _ = tokio::time::timeout(
                TOUCH_DEADLINE,
                store.touch_key_last_used(key_id, OffsetDateTime::now_utc()),
            )
            .await;
        });
    }
}

#[async_trait]
impl<S: KeyStore + ?Sized + 'static> Authenticator for ApiKeyAuthenticator<S> {
    async fn authenticate(&self, token: &str) -> Result<Identity> {
        if !token.starts_with(KEY_PREFIX) {
            return Err(Error::unauthorized("unrecognized key format"));
        }
        let hash = hash_key(token);

        if let Some(entry) = self.cache.get(&hash) {
            self.enforce(&entry.record, &hash)?;
            self.touch_last_used(entry.record.id);
            return Ok(entry.identity.clone());
        }

        let record = match self.store.key_by_hash(&hash).await {
            Ok(record) => record,
            Err(StoreError::NotFound) => {
                return Err(Error::unauthorized("unknown api key"));
            }
            Err(err) => return Err(Error::wrap(ErrorKind::Internal, "key lookup failed", err)),
        };

        // The store is trusted, but the hash is the lookup key; compare in
        // constant time anyway so lookups cannot become a timing oracle.
        if record.key_hash.as_bytes().ct_eq(hash.as_bytes()).unwrap_u8() != 1 {
            return Err(Error::unauthorized("unknown api key"));
        }
        self.enforce(&record, &hash)?;

        let record = Arc::new(record);
        let identity = self.build_identity(&record).await;
        self.hashes_by_id.insert(record.id, hash.clone());
        self.cache.insert(
            hash,
            CacheEntry {
                record: record.clone(),
                identity: identity.clone(),
            },
        );
        self.touch_last_used(record.id);
        Ok(identity)
    }

    fn invalidate_by_key_id(&self, key_id: i64) {
        if let Some((_, hash)) = self.hashes_by_id.remove(&key_id) {
            self.cache.invalidate(&hash);
        }
    }
}
