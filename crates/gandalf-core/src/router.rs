use std::sync::Arc;
use std::time::Duration;

use gandalf_common::{Error, ErrorKind, Result};
use gandalf_storage::{RouteStore, RouteTarget, StoreError};

const MEMO_TTL: Duration = Duration::from_secs(10);
const MEMO_CAPACITY: u64 = 10_000;

/// A resolved model alias: targets in failover order plus the route's
/// response-cache TTL (zero = use the global default).
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub alias: String,
    pub targets: Vec<RouteTarget>,
    pub cache_ttl: Duration,
}

/// Maps client model aliases to priority-ordered upstream targets, with at
/// most one store lookup per alias per memo window. Negative results are
/// memoized too; admin route mutations call `invalidate`.
pub struct RouteResolver<S: ?Sized> {
    store: Arc<S>,
    memo: moka::sync::Cache<String, Option<Arc<ResolvedRoute>>>,
}

impl<S: RouteStore + ?Sized> RouteResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            memo: moka::sync::Cache::builder()
                .max_capacity(MEMO_CAPACITY)
                .time_to_live(MEMO_TTL)
                .build(),
        }
    }

    pub async fn resolve(&self, alias: &str) -> Result<Arc<ResolvedRoute>> {
        if let Some(memoized) = self.memo.get(alias) {
            return memoized
                .ok_or_else(|| Error::not_found(format!("no route for model {alias}")));
        }

        let record = match self.store.route_by_alias(alias).await {
            Ok(record) => record,
            Err(StoreError::NotFound) => {
                self.memo.insert(alias.to_string(), None);
                return Err(Error::not_found(format!("no route for model {alias}")));
            }
            Err(err) => {
                return Err(Error::wrap(ErrorKind::Internal, "route lookup failed", err));
            }
        };
        if record.targets.is_empty() {
            return Err(Error::new(
                ErrorKind::Internal,
                format!("route {alias} has no targets"),
            ));
        }

        let mut targets = record.targets.clone();
        targets.sort_by_key(|t| t.priority);
        let resolved = Arc::new(ResolvedRoute {
            alias: record.alias,
            targets,
            cache_ttl: Duration::from_secs(record.cache_ttl_secs.unwrap_or(0)),
        });
        self.memo
            .insert(alias.to_string(), Some(resolved.clone()));
        Ok(resolved)
    }

    /// Route cache TTL consulted by the response-cache layer.
    pub async fn cache_ttl(&self, alias: &str) -> Duration {
        self.resolve(alias)
            .await
            .map(|route| route.cache_ttl)
            .unwrap_or(Duration::ZERO)
    }

    pub fn invalidate(&self, alias: &str) {
        self.memo.invalidate(alias);
    }
}
