//! Usage counter aggregator
//!
//! No physical partitioning. Deltas are summed per tenant at write time and
//! applied as relative increments, so concurrent writers never overwrite
//! each other.

use crate::batcher::{AggregatorStats, BatchAggregator, BatchConfig, BatchSink, ShutdownReport};
use crate::AccountingResult;
use async_trait::async_trait;
use relay_common::{TenantId, UsageDelta};
use relay_store::AccountingStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Span;

/// Sum deltas per tenant, keeping first-seen tenant order. Tenants whose
/// sum is zero are left out.
pub fn merge_deltas(deltas: &[UsageDelta]) -> Vec<UsageDelta> {
    let mut index: HashMap<TenantId, usize> = HashMap::new();
    let mut merged: Vec<UsageDelta> = Vec::new();
    for delta in deltas {
        match index.get(&delta.tenant_id) {
            Some(&i) => {
                merged[i].up = merged[i].up.saturating_add(delta.up);
                merged[i].down = merged[i].down.saturating_add(delta.down);
            }
            None => {
                index.insert(delta.tenant_id, merged.len());
                merged.push(*delta);
            }
        }
    }
    merged.retain(|d| !d.is_empty());
    merged
}

/// Writes merged usage increments
pub struct UsageSink<A> {
    store: Arc<A>,
}

impl<A> UsageSink<A> {
    /// Sink over an accounting store
    pub fn new(store: Arc<A>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<A: AccountingStore + 'static> BatchSink for UsageSink<A> {
    type Key = ();
    type Item = UsageDelta;

    fn name(&self) -> &'static str {
        "usage"
    }

    async fn prepare(&self, _key: &()) -> AccountingResult<()> {
        Ok(())
    }

    async fn write(&self, _key: &(), deltas: &[UsageDelta]) -> AccountingResult<()> {
        let merged = merge_deltas(deltas);
        if merged.is_empty() {
            return Ok(());
        }
        self.store.increment_counters_batch(&merged).await?;
        tracing::debug!(deltas = deltas.len(), tenants = merged.len(), "usage counters incremented");
        Ok(())
    }
}

/// Batched per-tenant usage counter writer
pub struct UsageAggregator<A: AccountingStore + 'static> {
    inner: BatchAggregator<UsageSink<A>>,
}

impl<A: AccountingStore + 'static> UsageAggregator<A> {
    /// Start the aggregator on the current Tokio runtime
    pub fn spawn(store: Arc<A>, config: BatchConfig, span: Span) -> Self {
        let sink = Arc::new(UsageSink::new(store));
        Self { inner: BatchAggregator::spawn(sink, config, span) }
    }

    /// Queue a delta
    pub async fn add(&self, delta: UsageDelta) {
        self.inner.add((), delta).await;
    }

    /// Drain and run the final flush
    pub async fn shutdown(&self) -> ShutdownReport {
        self.inner.shutdown().await
    }

    /// Get aggregator statistics
    pub fn stats(&self) -> AggregatorStats {
        self.inner.stats()
    }
}
