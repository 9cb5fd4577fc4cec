use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use gandalf_common::{Error, ErrorKind, Result};
use gandalf_storage::UsageStore;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::workers::Worker;

/// Flat per-token cost until a real pricing table lands.
pub const COST_PER_TOKEN: f64 = 1e-5;

pub fn token_cost(total_tokens: u32) -> f64 {
    f64::from(total_tokens) * COST_PER_TOKEN
}

/// In-memory per-key spend counters, reconciled periodically against the
/// persisted usage sums so admission checks can short-circuit with 429
/// before any provider call.
#[derive(Default)]
pub struct QuotaTracker {
    spent: DashMap<i64, f64>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cost(&self, key_id: i64, cost: f64) {
        *self.spent.entry(key_id).or_insert(0.0) += cost;
    }

    pub fn spent(&self, key_id: i64) -> f64 {
        self.spent.get(&key_id).map(|v| *v).unwrap_or(0.0)
    }

    /// Pre-dispatch admission check against the identity's budget.
    pub fn check(&self, key_id: i64, max_budget: Option<f64>) -> Result<()> {
        let Some(budget) = max_budget else {
            return Ok(());
        };
        if self.spent(key_id) >= budget {
            return Err(Error::new(ErrorKind::QuotaExceeded, "budget exhausted"));
        }
        Ok(())
    }

    pub fn set_spent(&self, key_id: i64, cost: f64) {
        self.spent.insert(key_id, cost);
    }

    fn tracked_keys(&self) -> Vec<i64> {
        self.spent.iter().map(|entry| *entry.key()).collect()
    }
}

/// Replaces the in-memory counters with the persisted usage sums on an
/// interval. The cadence is a tunable with a conservative default.
pub struct QuotaSyncWorker<S: ?Sized> {
    tracker: Arc<QuotaTracker>,
    store: Arc<S>,
    interval: Duration,
}

impl<S: UsageStore + ?Sized> QuotaSyncWorker<S> {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

    pub fn new(tracker: Arc<QuotaTracker>, store: Arc<S>, interval: Duration) -> Self {
        Self {
            tracker,
            store,
            interval,
        }
    }

    async fn reconcile(&self) {
        for key_id in self.tracker.tracked_keys() {
            match self
                .store
                .usage_cost_since(key_id, OffsetDateTime::UNIX_EPOCH)
                .await
            {
                Ok(cost) => self.tracker.set_spent(key_id, cost),
                Err(err) => {
                    tracing::warn!(key_id, error = %err, "quota reconcile failed");
                }
            }
        }
    }
}

#[async_trait]
impl<S: UsageStore + ?Sized + 'static> Worker for QuotaSyncWorker<S> {
    fn name(&self) -> &'static str {
        "quota-sync"
    }

    async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.reconcile().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gandalf_storage::{MemoryStore, UsageRecord};

    #[test]
    fn check_short_circuits_on_budget() {
        let tracker = QuotaTracker::new();
        assert!(tracker.check(1, None).is_ok());
        assert!(tracker.check(1, Some(1.0)).is_ok());

        tracker.add_cost(1, 0.6);
        assert!(tracker.check(1, Some(1.0)).is_ok());
        tracker.add_cost(1, 0.5);
        let err = tracker.check(1, Some(1.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn cost_model_is_flat_per_token() {
        assert_eq!(token_cost(0), 0.0);
        assert!((token_cost(1_000) - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn reconcile_replaces_counters_with_persisted_sums() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(QuotaTracker::new());
        tracker.add_cost(1, 42.0);

        store
            .append_usage(&[UsageRecord {
                request_id: "r".to_string(),
                key_id: 1,
                org_id: None,
                team_id: None,
                user_id: None,
                model: "m".to_string(),
                provider: "p".to_string(),
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
                cost: 0.25,
                cached: false,
                latency_ms: 1,
                status: 200,
                created_at: OffsetDateTime::now_utc(),
            }])
            .await
            .unwrap();

        let worker =
            QuotaSyncWorker::new(tracker.clone(), store, Duration::from_secs(10));
        worker.reconcile().await;
        assert_eq!(tracker.spent(1), 0.25);
    }
}
