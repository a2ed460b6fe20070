//! Bounded, best-effort recorder of cache accesses. Every read funnels
//! through [`AccessTracker::record`]; a background task drains the channel,
//! aggregates by `(tenant, cache key)`, and flushes a batch to a
//! [`RecencySink`] on a fixed interval. Overflow drops the newest event
//! rather than blocking the cache's read path — accuracy of recency
//! tracking is traded for latency on purpose.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devmesh_cache::AccessSink;
use devmesh_core::clock::Clock;
use devmesh_core::metrics::Metrics;
use devmesh_core::model::{AccessEvent, TenantId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Consumer of aggregated access batches. `devmesh-jobs`'s eviction manager
/// is the only implementor in this workspace, but keeping it a trait avoids
/// a hard dependency from the tracker onto eviction internals.
#[async_trait]
pub trait RecencySink: Send + Sync {
    async fn record_batch(&self, batch: Vec<(TenantId, String, u64, DateTime<Utc>)>);
}

pub struct AccessTracker {
    sender: mpsc::Sender<AccessEvent>,
    dropped: Arc<AtomicU64>,
    metrics: Arc<dyn Metrics>,
}

impl AccessTracker {
    /// Spawns the background aggregator and returns the tracker handle used
    /// as an `AccessSink`. `buffer_size` bounds the channel; a full channel
    /// drops the incoming event and increments the dropped-event counter
    /// instead of applying backpressure to the caller.
    pub fn spawn(
        buffer_size: usize,
        flush_interval: Duration,
        recency_sink: Arc<dyn RecencySink>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn Metrics>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let dropped = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(run_aggregator(
            receiver,
            flush_interval,
            recency_sink,
            clock,
            metrics.clone(),
        ));
        (Self { sender, dropped, metrics }, handle)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AccessSink for AccessTracker {
    async fn record(&self, tenant_id: TenantId, cache_key: String) {
        let event = AccessEvent {
            tenant_id,
            cache_key,
            timestamp: Utc::now(),
        };
        if self.sender.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.metrics.incr_counter("tracking.overflow", &[], 1);
            warn!(tenant = %tenant_id, "access tracker buffer full, dropping event");
        }
    }
}

async fn run_aggregator(
    mut receiver: mpsc::Receiver<AccessEvent>,
    flush_interval: Duration,
    recency_sink: Arc<dyn RecencySink>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn Metrics>,
) {
    let mut pending: HashMap<(TenantId, String), (u64, DateTime<Utc>)> = HashMap::new();
    let mut ticker = tokio::time::interval(flush_interval);
    // The first tick fires immediately; skip it so the first real flush
    // happens a full interval after startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            event = receiver.recv() => {
                match event {
                    Some(event) => {
                        let entry = pending
                            .entry((event.tenant_id, event.cache_key))
                            .or_insert((0, event.timestamp));
                        entry.0 += 1;
                        if event.timestamp > entry.1 {
                            entry.1 = event.timestamp;
                        }
                    }
                    None => {
                        flush(&mut pending, &recency_sink, &metrics).await;
                        debug!("access tracker channel closed, aggregator exiting");
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                let _ = clock.now();
                flush(&mut pending, &recency_sink, &metrics).await;
            }
        }
    }
}

async fn flush(
    pending: &mut HashMap<(TenantId, String), (u64, DateTime<Utc>)>,
    recency_sink: &Arc<dyn RecencySink>,
    metrics: &Arc<dyn Metrics>,
) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<(TenantId, String, u64, DateTime<Utc>)> = pending
        .drain()
        .map(|((tenant_id, key), (count, last_seen))| (tenant_id, key, count, last_seen))
        .collect();
    metrics.incr_counter("devmesh_jobs.access_tracker.flush", &[], 1);
    metrics.observe_histogram(
        "devmesh_jobs.access_tracker.batch_size",
        &[],
        batch.len() as f64,
    );
    recency_sink.record_batch(batch).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmesh_core::clock::FixedClock;
    use devmesh_core::metrics::InMemoryMetrics;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    fn tenant() -> TenantId {
        TenantId::new(Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap()).unwrap()
    }

    #[derive(Default)]
    struct CollectingSink {
        batches: Mutex<Vec<Vec<(TenantId, String, u64, DateTime<Utc>)>>>,
    }

    #[async_trait]
    impl RecencySink for CollectingSink {
        async fn record_batch(&self, batch: Vec<(TenantId, String, u64, DateTime<Utc>)>) {
            self.batches.lock().await.push(batch);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aggregates_repeated_accesses_into_one_flush() {
        let sink = Arc::new(CollectingSink::default());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let (tracker, _handle) = AccessTracker::spawn(
            16,
            Duration::from_millis(50),
            sink.clone(),
            clock,
            Arc::new(InMemoryMetrics::new()),
        );

        let t = tenant();
        tracker.record(t, "q1".to_string()).await;
        tracker.record(t, "q1".to_string()).await;
        tracker.record(t, "q2".to_string()).await;

        tokio::time::advance(Duration::from_millis(120)).await;
        tokio::task::yield_now().await;

        let batches = sink.batches.lock().await;
        let flattened: Vec<_> = batches.iter().flatten().collect();
        let q1 = flattened.iter().find(|(_, key, ..)| key == "q1").unwrap();
        assert_eq!(q1.2, 2);
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_counts_it() {
        let sink = Arc::new(CollectingSink::default());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let metrics = Arc::new(InMemoryMetrics::new());
        let (tracker, _handle) = AccessTracker::spawn(
            1,
            Duration::from_secs(3600),
            sink,
            clock,
            metrics.clone(),
        );

        let t = tenant();
        // Fill the single buffer slot, then force an overflow by sending
        // faster than the aggregator can drain on this scheduler tick.
        for _ in 0..50 {
            tracker.record(t, "q".to_string()).await;
        }
        assert!(tracker.dropped_count() > 0);
        assert_eq!(
            metrics.counter_value("tracking.overflow", &[]),
            tracker.dropped_count(),
        );
    }
}
