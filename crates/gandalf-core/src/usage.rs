use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gandalf_storage::{UsageRecord, UsageStore};
use prometheus::IntCounter;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::workers::Worker;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Hot-path handle: non-blocking enqueue, drop-on-overflow.
///
/// Drops count straight into the exported `usage_dropped_total` counter so
/// `/metrics` reflects real overflow activity.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<UsageRecord>,
    dropped: IntCounter,
}

impl UsageRecorder {
    /// Build the recorder and the receiver its worker drains.
    pub fn channel(capacity: usize, dropped: IntCounter) -> (Self, mpsc::Receiver<UsageRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, dropped }, rx)
    }

    /// Never blocks: a saturated queue drops the record and counts it.
    pub fn record(&self, record: UsageRecord) {
        if self.tx.try_send(record).is_err() {
            self.dropped.inc();
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.get()
    }
}

/// Background worker: batches up to 100 records or 5 s from the oldest
/// buffered record, whichever comes first, and flushes each batch as a
/// single store write.
pub struct UsageWorker<S: ?Sized> {
    rx: Mutex<Option<mpsc::Receiver<UsageRecord>>>,
    store: Arc<S>,
    dropped: IntCounter,
}

impl<S: UsageStore + ?Sized> UsageWorker<S> {
    pub fn new(rx: mpsc::Receiver<UsageRecord>, store: Arc<S>, recorder: &UsageRecorder) -> Self {
        Self {
            rx: Mutex::new(Some(rx)),
            store,
            dropped: recorder.dropped.clone(),
        }
    }

    async fn flush(&self, batch: &mut Vec<UsageRecord>) {
        if batch.is_empty() {
            return;
        }
        if let Err(err) = self.store.append_usage(batch).await {
            tracing::warn!(count = batch.len(), error = %err, "usage flush failed");
            self.dropped.inc_by(batch.len() as u64);
        }
        batch.clear();
    }

    /// Drain what is left in the queue within the shutdown deadline;
    /// anything past it counts as dropped, not retried.
    async fn drain(&self, rx: &mut mpsc::Receiver<UsageRecord>, batch: &mut Vec<UsageRecord>) {
        let deadline = Instant::now() + DRAIN_DEADLINE;
        rx.close();
        loop {
            match rx.try_recv() {
                Ok(record) => {
                    batch.push(record);
                    if batch.len() >= BATCH_SIZE {
                        if tokio::time::timeout_at(deadline, self.flush(batch))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Err(_) => break,
            }
        }
        if !batch.is_empty()
            && tokio::time::timeout_at(deadline, self.flush(batch))
                .await
                .is_err()
        {
            self.dropped.inc_by(batch.len() as u64);
        }
    }
}

#[async_trait]
impl<S: UsageStore + ?Sized + 'static> Worker for UsageWorker<S> {
    fn name(&self) -> &'static str {
        "usage-recorder"
    }

    async fn run(&self, token: CancellationToken) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            return;
        };
        let mut batch: Vec<UsageRecord> = Vec::with_capacity(BATCH_SIZE);
        let mut flush_at = Instant::now() + FLUSH_INTERVAL;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.drain(&mut rx, &mut batch).await;
                    return;
                }
                maybe = rx.recv() => {
                    match maybe {
                        Some(record) => {
                            if batch.is_empty() {
                                flush_at = Instant::now() + FLUSH_INTERVAL;
                            }
                            batch.push(record);
                            if batch.len() >= BATCH_SIZE {
                                self.flush(&mut batch).await;
                            }
                        }
                        None => {
                            self.flush(&mut batch).await;
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep_until(flush_at), if !batch.is_empty() => {
                    self.flush(&mut batch).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gandalf_storage::MemoryStore;
    use time::OffsetDateTime;

    fn dropped_counter() -> IntCounter {
        IntCounter::new("usage_dropped_total", "dropped usage records").unwrap()
    }

    fn record(n: u32) -> UsageRecord {
        UsageRecord {
            request_id: format!("req-{n}"),
            key_id: 1,
            org_id: None,
            team_id: None,
            user_id: None,
            model: "m".to_string(),
            provider: "p".to_string(),
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            cost: 0.0,
            cached: false,
            latency_ms: 1,
            status: 200,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn overflow_drops_and_counts_instead_of_blocking() {
        let (recorder, _rx) = UsageRecorder::channel(2, dropped_counter());
        for n in 0..5 {
            recorder.record(record(n));
        }
        // Capacity 2 held, the excess 3 dropped.
        assert_eq!(recorder.dropped_count(), 3);
    }

    #[tokio::test]
    async fn batch_flushes_on_size() {
        let (recorder, rx) = UsageRecorder::channel(DEFAULT_QUEUE_CAPACITY, dropped_counter());
        let store = Arc::new(MemoryStore::new());
        let worker = Arc::new(UsageWorker::new(rx, store.clone(), &recorder));
        let token = CancellationToken::new();
        let run_token = token.clone();
        let worker_in = worker.clone();
        let handle = tokio::spawn(async move { worker_in.run(run_token).await });

        for n in 0..(BATCH_SIZE as u32) {
            recorder.record(record(n));
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if store.usage_records().await.len() >= BATCH_SIZE {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("batch flushed");

        token.cancel();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_after_interval() {
        let (recorder, rx) = UsageRecorder::channel(DEFAULT_QUEUE_CAPACITY, dropped_counter());
        let store = Arc::new(MemoryStore::new());
        let worker = Arc::new(UsageWorker::new(rx, store.clone(), &recorder));
        let token = CancellationToken::new();
        let run_token = token.clone();
        let worker_in = worker.clone();
        let handle = tokio::spawn(async move { worker_in.run(run_token).await });

        recorder.record(record(1));
        tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(100)).await;
        assert_eq!(store.usage_records().await.len(), 1);

        token.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn shutdown_drains_the_queue() {
        let (recorder, rx) = UsageRecorder::channel(DEFAULT_QUEUE_CAPACITY, dropped_counter());
        let store = Arc::new(MemoryStore::new());
        let worker = Arc::new(UsageWorker::new(rx, store.clone(), &recorder));
        let token = CancellationToken::new();

        for n in 0..7 {
            recorder.record(record(n));
        }
        token.cancel();
        worker.run(token).await;
        assert_eq!(store.usage_records().await.len(), 7);
    }
}
