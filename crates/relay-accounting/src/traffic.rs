//! Traffic log aggregator
//!
//! Partitioned by the UTC day of each record. The day's table is ensured
//! eagerly when a record is queued and again (cached) before every write.

use crate::batcher::{AggregatorStats, BatchAggregator, BatchConfig, BatchSink, ShutdownReport};
use crate::ensure::EnsureGuard;
use crate::AccountingResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use relay_common::{AtomicCounter, DayPartition, TrafficRecord};
use relay_store::AccountingStore;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{Instrument, Span};

/// Days remembered by the ensure guard
const ENSURED_DAYS: u64 = 64;

/// Writes traffic batches into day tables
pub struct TrafficSink<A> {
    store: Arc<A>,
    ensured: EnsureGuard<DayPartition>,
    /// Days with a background ensure still running
    eager: Mutex<HashSet<DayPartition>>,
    eager_started: AtomicCounter,
}

impl<A: AccountingStore + 'static> TrafficSink<A> {
    /// Sink over an accounting store
    pub fn new(store: Arc<A>) -> Self {
        Self {
            store,
            ensured: EnsureGuard::new(ENSURED_DAYS),
            eager: Mutex::new(HashSet::new()),
            eager_started: AtomicCounter::new(0),
        }
    }

    /// Create the day's table once; concurrent callers share the attempt
    pub async fn ensure(&self, day: DayPartition) -> AccountingResult<()> {
        self.ensured
            .ensure(day, self.store.ensure_partition(day))
            .await?;
        Ok(())
    }

    /// Whether the day's table is known to exist
    pub fn is_ensured(&self, day: DayPartition) -> bool {
        self.ensured.is_ensured(&day)
    }

    /// Claim the background ensure for `day`. False when the day is already
    /// ensured or another record's ensure is still running.
    fn claim_eager(&self, day: DayPartition) -> bool {
        if self.is_ensured(day) || !self.eager.lock().insert(day) {
            return false;
        }
        self.eager_started.inc();
        true
    }

    /// Run the claimed ensure and release the claim, so a failed attempt is
    /// retried by the next record for that day
    async fn run_eager(&self, day: DayPartition) {
        if let Err(e) = self.ensure(day).await {
            tracing::warn!(%day, error = %e, "eager partition ensure failed, retrying at flush");
        }
        self.eager.lock().remove(&day);
    }
}

#[async_trait]
impl<A: AccountingStore + 'static> BatchSink for TrafficSink<A> {
    type Key = DayPartition;
    type Item = TrafficRecord;

    fn name(&self) -> &'static str {
        "traffic"
    }

    async fn prepare(&self, day: &DayPartition) -> AccountingResult<()> {
        self.ensure(*day).await
    }

    async fn write(&self, day: &DayPartition, records: &[TrafficRecord]) -> AccountingResult<()> {
        self.store.insert_batch(*day, records).await?;
        tracing::debug!(%day, rows = records.len(), "traffic batch written");
        Ok(())
    }
}

/// Batched, day-partitioned traffic log writer
pub struct TrafficAggregator<A: AccountingStore + 'static> {
    inner: BatchAggregator<TrafficSink<A>>,
    span: Span,
}

impl<A: AccountingStore + 'static> TrafficAggregator<A> {
    /// Start the aggregator on the current Tokio runtime
    pub fn spawn(store: Arc<A>, config: BatchConfig, span: Span) -> Self {
        let sink = Arc::new(TrafficSink::new(store));
        let inner = BatchAggregator::spawn(sink, config, span.clone());
        Self { inner, span }
    }

    /// Queue a record. The first record for a new day also starts creating
    /// that day's table in the background.
    pub async fn record(&self, record: TrafficRecord) {
        let day = record.partition();
        let sink = self.inner.sink();
        if !self.inner.is_closed() && sink.claim_eager(day) {
            let sink = Arc::clone(sink);
            tokio::spawn(async move { sink.run_eager(day).await }.instrument(self.span.clone()));
        }
        self.inner.add(day, record).await;
    }

    /// Drain and run the final flush
    pub async fn shutdown(&self) -> ShutdownReport {
        self.inner.shutdown().await
    }

    /// Get aggregator statistics
    pub fn stats(&self) -> AggregatorStats {
        self.inner.stats()
    }

    /// Background ensures started so far
    pub fn eager_ensures(&self) -> u64 {
        self.inner.sink().eager_started.get()
    }
}
