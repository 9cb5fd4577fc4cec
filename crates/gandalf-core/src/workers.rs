use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A background worker that runs until the root context is canceled.
///
/// Every worker owns its teardown: `run` returning means all resources the
/// worker held are released.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, token: CancellationToken);
}

/// Composes the background workers (usage recorder, quota sync, registry
/// eviction sweeps) under a single root cancellation token.
pub struct WorkerRunner {
    token: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Default for WorkerRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRunner {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn(&mut self, worker: Arc<dyn Worker>) {
        let token = self.token.clone();
        let name = worker.name().to_string();
        tracing::debug!(worker = %name, "starting worker");
        let handle = tokio::spawn(async move {
            worker.run(token).await;
        });
        self.handles.push((name, handle));
    }

    /// Cancel the root token and wait (bounded) for workers to drain.
    pub async fn shutdown(self, deadline: Duration) {
        self.token.cancel();
        for (name, handle) in self.handles {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                tracing::warn!(worker = %name, "worker did not stop within the drain deadline");
            }
        }
    }
}

/// Periodic sweep worker driving the registry idle evictions.
pub struct SweepWorker<F> {
    name: &'static str,
    interval: Duration,
    sweep: F,
}

impl<F: Fn() + Send + Sync> SweepWorker<F> {
    pub fn new(name: &'static str, interval: Duration, sweep: F) -> Self {
        Self {
            name,
            interval,
            sweep,
        }
    }
}

#[async_trait]
impl<F: Fn() + Send + Sync> Worker for SweepWorker<F> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => (self.sweep)(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn sweep_worker_fires_and_stops_on_cancel() {
        let count = Arc::new(AtomicU32::new(0));
        let count_in = count.clone();
        let worker = Arc::new(SweepWorker::new(
            "test-sweep",
            Duration::from_secs(1),
            move || {
                count_in.fetch_add(1, Ordering::SeqCst);
            },
        ));

        let mut runner = WorkerRunner::new();
        runner.spawn(worker);
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);
        runner.shutdown(Duration::from_secs(1)).await;
    }
}
