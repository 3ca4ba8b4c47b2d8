//! Control plane wiring

use crate::config::ControlConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_accounting::{AggregatorStats, ShutdownReport, TrafficAggregator, UsageAggregator};
use relay_common::{
    FlowDirection, GroupId, RuleId, Shutdown, TenantId, TrafficRecord, UsageDelta,
};
use relay_lifecycle::{LifecycleSweep, SweepStats};
use relay_policy::{Decision, DecisionEngine, EngineStats, PolicyResult};
use relay_store::{AccountingStore, PolicyRepository, SubscriptionStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Everything the plane needs from storage
pub trait ControlStore: PolicyRepository + AccountingStore + SubscriptionStore + 'static {}

impl<T> ControlStore for T where T: PolicyRepository + AccountingStore + SubscriptionStore + 'static {}

/// A finished connection as reported by a forwarding node
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConnectionReport {
    /// Tenant
    pub tenant_id: TenantId,
    /// Direction
    pub direction: FlowDirection,
    /// Listener endpoint
    pub listen: String,
    /// Client endpoint
    pub source: String,
    /// Destination endpoint
    pub target: String,
    /// Transport or upstream protocol
    pub protocol: String,
    /// Bytes client → destination
    pub bytes_up: u64,
    /// Bytes destination → client
    pub bytes_down: u64,
    /// Connection open time
    pub opened_at: DateTime<Utc>,
    /// Connection close time
    pub closed_at: DateTime<Utc>,
}

impl ConnectionReport {
    /// Log row and counter increment for the connection. The row is stamped
    /// with the close time; a close before open counts as zero duration.
    pub fn into_parts(self) -> (TrafficRecord, UsageDelta) {
        let delta = UsageDelta::new(self.tenant_id, self.bytes_up, self.bytes_down);
        let duration = (self.closed_at - self.opened_at).to_std().unwrap_or_default();
        let record = TrafficRecord {
            time: self.closed_at,
            tenant_id: self.tenant_id,
            direction: self.direction,
            listen: self.listen,
            source: self.source,
            target: self.target,
            protocol: self.protocol,
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
            duration,
        };
        (record, delta)
    }
}

/// Final flush results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PlaneShutdownReport {
    /// Traffic aggregator
    pub traffic: ShutdownReport,
    /// Usage aggregator
    pub usage: ShutdownReport,
}

impl PlaneShutdownReport {
    /// Items lost across both aggregators
    pub fn lost(&self) -> u64 {
        self.traffic.lost + self.usage.lost
    }
}

/// Statistics snapshot across components
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlaneStats {
    /// Decision engine
    pub policy: EngineStats,
    /// Traffic aggregator
    pub traffic: AggregatorStats,
    /// Usage aggregator
    pub usage: AggregatorStats,
    /// Lifecycle sweep
    pub sweep: SweepStats,
}

/// Forwarding control plane
///
/// ```text
///  decide ──► DecisionEngine ──► PolicyRepository
///  report ─┬► TrafficAggregator ─┐
///          └► UsageAggregator ───┼─► AccountingStore
///  (timer) ─► LifecycleSweep ────┴─► SubscriptionStore
/// ```
pub struct ControlPlane<S: ControlStore> {
    engine: DecisionEngine<S>,
    traffic: TrafficAggregator<S>,
    usage: UsageAggregator<S>,
    sweep: Arc<LifecycleSweep<S>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Shutdown,
}

impl<S: ControlStore> ControlPlane<S> {
    /// Build every component over one store and start the background tasks
    /// on the current Tokio runtime
    pub fn start(store: Arc<S>, config: &ControlConfig) -> Self {
        let engine = DecisionEngine::new(Arc::clone(&store));
        let traffic = TrafficAggregator::spawn(
            Arc::clone(&store),
            config.traffic.batch_config(),
            tracing::info_span!("accounting", sink = "traffic"),
        );
        let usage = UsageAggregator::spawn(
            Arc::clone(&store),
            config.usage.batch_config(),
            tracing::info_span!("accounting", sink = "usage"),
        );
        let sweep = Arc::new(LifecycleSweep::new(store, config.sweep.sweep_config()));

        let shutdown = Shutdown::new();
        let sweep_task = {
            let sweep = Arc::clone(&sweep);
            let listener = shutdown.listener();
            tokio::spawn(async move { sweep.run(listener).await }.in_current_span())
        };

        tracing::info!(
            traffic_batch = config.traffic.max_batch,
            usage_batch = config.usage.max_batch,
            sweep_interval_secs = config.sweep.interval_secs,
            "control plane started"
        );

        Self {
            engine,
            traffic,
            usage,
            sweep,
            sweep_task: Mutex::new(Some(sweep_task)),
            shutdown,
        }
    }

    /// Route a connection
    pub async fn decide(
        &self,
        tenant_id: TenantId,
        group_id: GroupId,
        rule_id: RuleId,
        destination: &str,
    ) -> PolicyResult<Decision> {
        self.engine.decide(tenant_id, group_id, rule_id, destination).await
    }

    /// Account a finished connection. Never touches storage directly.
    pub async fn report(&self, report: ConnectionReport) {
        let (record, delta) = report.into_parts();
        self.traffic.record(record).await;
        if !delta.is_empty() {
            self.usage.add(delta).await;
        }
    }

    /// Sweep handle, for on-demand ticks
    pub fn sweep(&self) -> &Arc<LifecycleSweep<S>> {
        &self.sweep
    }

    /// Get statistics
    pub fn stats(&self) -> PlaneStats {
        PlaneStats {
            policy: self.engine.stats(),
            traffic: self.traffic.stats(),
            usage: self.usage.stats(),
            sweep: self.sweep.stats(),
        }
    }

    /// Stop the sweep after its current tick, then drain both aggregators.
    /// Later calls return an empty report.
    pub async fn shutdown(&self) -> PlaneShutdownReport {
        self.shutdown.trigger();
        let task = self.sweep_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "sweep task failed");
            }
        }

        let (traffic, usage) = tokio::join!(self.traffic.shutdown(), self.usage.shutdown());
        let report = PlaneShutdownReport { traffic, usage };
        if report.lost() > 0 {
            tracing::error!(
                traffic_lost = traffic.lost,
                usage_lost = usage.lost,
                "control plane stopped with unwritten accounting data"
            );
        } else {
            tracing::info!(
                traffic_written = traffic.written,
                usage_written = usage.written,
                "control plane stopped"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use relay_common::DayPartition;
    use relay_store::MemoryStore;

    fn report(tenant_id: TenantId, up: u64, down: u64) -> ConnectionReport {
        let opened_at = Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 0).unwrap();
        ConnectionReport {
            tenant_id,
            direction: FlowDirection::Outbound,
            listen: "0.0.0.0:1080".into(),
            source: "198.51.100.7:40000".into(),
            target: "example.org:443".into(),
            protocol: "tcp".into(),
            bytes_up: up,
            bytes_down: down,
            opened_at,
            closed_at: opened_at + chrono::Duration::seconds(90),
        }
    }

    #[test]
    fn test_into_parts() {
        let (record, delta) = report(4, 10, 20).into_parts();
        assert_eq!(delta, UsageDelta::new(4, 10, 20));
        assert_eq!(record.duration, std::time::Duration::from_secs(90));
        assert_eq!(record.partition(), DayPartition::of(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()));

        let mut backwards = report(4, 0, 0);
        backwards.closed_at = backwards.opened_at - chrono::Duration::seconds(1);
        assert_eq!(backwards.into_parts().0.duration, std::time::Duration::ZERO);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_everything() {
        let store = Arc::new(MemoryStore::new());
        let plane = ControlPlane::start(Arc::clone(&store), &ControlConfig::default());

        plane.report(report(1, 100, 200)).await;
        plane.report(report(1, 1, 2)).await;
        plane.report(report(2, 0, 0)).await;

        let result = plane.shutdown().await;
        assert_eq!(result.lost(), 0);
        assert_eq!(plane.stats().traffic.written, 3);
        assert_eq!(store.usage(1), (101, 202));
        assert_eq!(store.usage(2), (0, 0));

        let day = report(1, 0, 0).into_parts().0.partition();
        assert_eq!(store.traffic(day).len(), 3);
        assert_eq!(plane.shutdown().await, PlaneShutdownReport::default());
    }
}
