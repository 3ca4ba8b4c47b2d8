//! Generic batch aggregator
//!
//! Producers push `(key, item)` pairs into a bounded queue. One worker task
//! owns all batch state and flushes when:
//!
//! - items received since the last flush reach `max_batch`
//! - the flush interval elapses with items pending
//! - shutdown is requested (final flush)
//!
//! A flush groups items by key in first-seen order, keeping arrival order
//! inside each key. Each key is prepared then written. A key whose prepare
//! or write fails keeps its items, unchanged and ahead of newer arrivals,
//! for the next flush. Only the final flush can lose items, and it reports
//! how many.

use crate::AccountingResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use relay_common::{AtomicCounter, Shutdown, ShutdownListener};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span};

/// Destination of flushed batches
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    /// Partition key
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    /// Queued payload
    type Item: Send + Sync + 'static;

    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Idempotent per-key preparation run before every write
    async fn prepare(&self, key: &Self::Key) -> AccountingResult<()>;

    /// Write one key's items. On error nothing may be considered written.
    async fn write(&self, key: &Self::Key, items: &[Self::Item]) -> AccountingResult<()>;
}

/// Batching thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Items received since the last flush that trigger a flush; also the
    /// intake queue capacity
    pub max_batch: usize,
    /// Maximum time items wait before a flush
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_batch: 1000, flush_interval: Duration::from_secs(1) }
    }
}

/// Result of the final flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ShutdownReport {
    /// Items written by the final flush
    pub written: u64,
    /// Items that could not be written and were discarded
    pub lost: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicCounter,
    dropped: AtomicCounter,
    written: AtomicCounter,
    deferred: AtomicCounter,
    lost: AtomicCounter,
    flushes: AtomicCounter,
}

/// Aggregator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AggregatorStats {
    /// Items accepted by `add`
    pub enqueued: u64,
    /// Items refused because the aggregator was shut down
    pub dropped: u64,
    /// Items written
    pub written: u64,
    /// Item write attempts that failed and were carried forward
    pub deferred: u64,
    /// Items discarded by the final flush
    pub lost: u64,
    /// Flush cycles run
    pub flushes: u64,
}

/// Batch aggregator over a [`BatchSink`]
pub struct BatchAggregator<S: BatchSink> {
    sink: Arc<S>,
    tx: mpsc::Sender<(S::Key, S::Item)>,
    closed: AtomicBool,
    shutdown: Shutdown,
    worker: Mutex<Option<JoinHandle<ShutdownReport>>>,
    counters: Arc<Counters>,
}

impl<S: BatchSink> BatchAggregator<S> {
    /// Start the worker on the current Tokio runtime
    pub fn spawn(sink: Arc<S>, config: BatchConfig, span: Span) -> Self {
        let max_batch = config.max_batch.max(1);
        let (tx, rx) = mpsc::channel(max_batch);
        let shutdown = Shutdown::new();
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            sink: Arc::clone(&sink),
            rx,
            max_batch,
            pending: Vec::new(),
            fresh: 0,
            counters: Arc::clone(&counters),
        };
        let flush_interval = config.flush_interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(
            worker
                .run(flush_interval, shutdown.listener())
                .instrument(span),
        );

        Self {
            sink,
            tx,
            closed: AtomicBool::new(false),
            shutdown,
            worker: Mutex::new(Some(handle)),
            counters,
        }
    }

    /// Queue an item. Waits only while the intake queue is full. Items
    /// added after shutdown are dropped.
    pub async fn add(&self, key: S::Key, item: S::Item) {
        if self.closed.load(Ordering::Acquire) {
            self.counters.dropped.inc();
            return;
        }
        match self.tx.send((key, item)).await {
            Ok(()) => {
                self.counters.enqueued.inc();
            }
            Err(_) => {
                self.counters.dropped.inc();
            }
        }
    }

    /// Stop intake, drain the queue, run the final flush and report it.
    /// Later calls return an empty report.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.closed.store(true, Ordering::Release);
        self.shutdown.trigger();

        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(sink = self.sink.name(), error = %e, "aggregator worker failed");
                    ShutdownReport::default()
                }
            },
            None => ShutdownReport::default(),
        }
    }

    /// Whether `shutdown` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get aggregator statistics
    pub fn stats(&self) -> AggregatorStats {
        let c = &self.counters;
        AggregatorStats {
            enqueued: c.enqueued.get(),
            dropped: c.dropped.get(),
            written: c.written.get(),
            deferred: c.deferred.get(),
            lost: c.lost.get(),
            flushes: c.flushes.get(),
        }
    }

    /// Sink receiving the batches
    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }
}

struct Worker<S: BatchSink> {
    sink: Arc<S>,
    rx: mpsc::Receiver<(S::Key, S::Item)>,
    max_batch: usize,
    /// Carried-forward items first, then arrivals
    pending: Vec<(S::Key, S::Item)>,
    /// Arrivals since the last flush
    fresh: usize,
    counters: Arc<Counters>,
}

impl<S: BatchSink> Worker<S> {
    async fn run(mut self, flush_interval: Duration, mut shutdown: ShutdownListener) -> ShutdownReport {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        tracing::debug!(sink = self.sink.name(), max_batch = self.max_batch, "aggregator started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.wait() => break,

                received = self.rx.recv() => match received {
                    Some(entry) => {
                        self.pending.push(entry);
                        self.fresh += 1;
                        if self.fresh >= self.max_batch {
                            self.flush().await;
                        }
                    }
                    None => break,
                },

                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        self.rx.close();
        while let Some(entry) = self.rx.recv().await {
            self.pending.push(entry);
        }

        let report = self.final_flush().await;
        tracing::info!(
            sink = self.sink.name(),
            written = report.written,
            lost = report.lost,
            "aggregator stopped"
        );
        report
    }

    /// Write every pending key once; returns items written
    async fn flush(&mut self) -> u64 {
        self.counters.flushes.inc();
        self.fresh = 0;

        let mut written = 0;
        for (key, items) in group_by_key(std::mem::take(&mut self.pending)) {
            let count = items.len() as u64;
            match self.write_partition(&key, &items).await {
                Ok(()) => {
                    written += count;
                    self.counters.written.add(count);
                }
                Err(e) => {
                    self.counters.deferred.add(count);
                    tracing::warn!(
                        sink = self.sink.name(),
                        key = ?key,
                        items = count,
                        error = %e,
                        "batch write failed, carrying forward"
                    );
                    self.pending.extend(items.into_iter().map(|item| (key.clone(), item)));
                }
            }
        }
        written
    }

    async fn final_flush(&mut self) -> ShutdownReport {
        if self.pending.is_empty() {
            return ShutdownReport::default();
        }
        let written = self.flush().await;
        let lost = self.pending.len() as u64;
        if lost > 0 {
            self.counters.lost.add(lost);
            for (key, items) in group_by_key(std::mem::take(&mut self.pending)) {
                tracing::error!(
                    sink = self.sink.name(),
                    key = ?key,
                    items = items.len(),
                    "final flush failed, items lost"
                );
            }
        }
        ShutdownReport { written, lost }
    }

    async fn write_partition(&self, key: &S::Key, items: &[S::Item]) -> AccountingResult<()> {
        self.sink.prepare(key).await?;
        self.sink.write(key, items).await
    }
}

/// Group by key in first-seen order, keeping arrival order within a key
fn group_by_key<K: Clone + Eq + Hash, T>(entries: Vec<(K, T)>) -> Vec<(K, Vec<T>)> {
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(K, Vec<T>)> = Vec::new();
    for (key, item) in entries {
        match index.get(&key) {
            Some(&i) => groups[i].1.push(item),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![item]));
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccountingError;
    use relay_store::StoreError;

    /// Records writes; keys listed in `failing` refuse them
    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<(&'static str, Vec<u32>)>>,
        failing: Mutex<Vec<&'static str>>,
    }

    impl RecordingSink {
        fn writes(&self) -> Vec<(&'static str, Vec<u32>)> {
            self.writes.lock().clone()
        }

        fn set_failing(&self, keys: &[&'static str]) {
            *self.failing.lock() = keys.to_vec();
        }
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        type Key = &'static str;
        type Item = u32;

        fn name(&self) -> &'static str {
            "recording"
        }

        async fn prepare(&self, _key: &Self::Key) -> AccountingResult<()> {
            Ok(())
        }

        async fn write(&self, key: &Self::Key, items: &[u32]) -> AccountingResult<()> {
            if self.failing.lock().contains(key) {
                return Err(AccountingError::Store(StoreError::Unavailable("down".into())));
            }
            self.writes.lock().push((*key, items.to_vec()));
            Ok(())
        }
    }

    fn config(max_batch: usize, flush_ms: u64) -> BatchConfig {
        BatchConfig { max_batch, flush_interval: Duration::from_millis(flush_ms) }
    }

    #[test]
    fn test_group_by_key_order() {
        let groups = group_by_key(vec![("b", 1), ("a", 2), ("b", 3), ("c", 4), ("a", 5)]);
        assert_eq!(groups, vec![("b", vec![1, 3]), ("a", vec![2, 5]), ("c", vec![4])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flush_groups_by_first_seen_key() {
        let sink = Arc::new(RecordingSink::default());
        let agg = BatchAggregator::spawn(Arc::clone(&sink), config(100, 50), Span::none());

        for (key, item) in [("d2", 1), ("d1", 2), ("d2", 3)] {
            agg.add(key, item).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(sink.writes(), vec![("d2", vec![1, 3]), ("d1", vec![2])]);
        assert_eq!(agg.stats().written, 3);
        assert_eq!(agg.shutdown().await, ShutdownReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger() {
        let sink = Arc::new(RecordingSink::default());
        let agg = BatchAggregator::spawn(Arc::clone(&sink), config(3, 3_600_000), Span::none());

        for item in 0..3 {
            agg.add("k", item).await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.writes(), vec![("k", vec![0, 1, 2])]);
        agg.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_key_carried_forward_in_order() {
        let sink = Arc::new(RecordingSink::default());
        sink.set_failing(&["d1"]);
        let agg = BatchAggregator::spawn(Arc::clone(&sink), config(100, 50), Span::none());

        agg.add("d1", 1).await;
        agg.add("d2", 2).await;
        agg.add("d1", 3).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sink.writes(), vec![("d2", vec![2])]);
        assert_eq!(agg.stats().deferred, 2);

        sink.set_failing(&[]);
        agg.add("d3", 4).await;
        agg.add("d1", 5).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            sink.writes(),
            vec![("d2", vec![2]), ("d1", vec![1, 3, 5]), ("d3", vec![4])]
        );
        assert_eq!(agg.shutdown().await.lost, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_loss_and_drops_late_items() {
        let sink = Arc::new(RecordingSink::default());
        sink.set_failing(&["bad"]);
        let agg = BatchAggregator::spawn(Arc::clone(&sink), config(100, 3_600_000), Span::none());

        agg.add("bad", 1).await;
        agg.add("bad", 2).await;
        agg.add("good", 3).await;

        let report = agg.shutdown().await;
        assert_eq!(report, ShutdownReport { written: 1, lost: 2 });
        assert_eq!(sink.writes(), vec![("good", vec![3])]);

        agg.add("good", 4).await;
        let stats = agg.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.lost, 2);
        assert!(agg.is_closed());
        assert_eq!(agg.shutdown().await, ShutdownReport::default());
    }
}
