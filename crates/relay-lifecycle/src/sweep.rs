//! Subscription lifecycle sweep
//!
//! Each tick runs two phases against storage:
//!
//! ```text
//! Phase A (paged by id)                   Phase B (paged by expiry, id)
//! ───────────────────────────             ──────────────────────────────────
//! enabled, left=0, in grace  ─► expired   enabled, left≠0, expiry ≤ now
//! enabled|expired, past grace ─► disabled     └─► step periods ─► CAS update
//! ```
//!
//! Phase A updates are batched per page and re-check their predicate.
//! Phase B renewals are compare-and-swap on the old expiry, so a concurrent
//! writer simply wins and the sweep moves on.

use crate::renewal::advance_period;
use chrono::{DateTime, Utc};
use relay_common::{AtomicCounter, ShutdownListener, Subscription, SubscriptionId};
use relay_store::{RenewCursor, RenewalUpdate, SubscriptionStore, Transition};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span};

/// Sweep timing and paging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    /// Time between tick starts
    pub interval: Duration,
    /// How long an expired subscription stays `expired` before `disabled`
    pub grace: chrono::Duration,
    /// Rows per page
    pub page_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            grace: chrono::Duration::days(3),
            page_size: 500,
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TickReport {
    /// Rows moved to `expired`
    pub expired: u64,
    /// Rows moved to `disabled`
    pub disabled: u64,
    /// Rows renewed
    pub renewed: u64,
    /// Renewals skipped because another writer changed the row first
    pub raced: u64,
    /// Failed storage operations
    pub errors: u64,
}

/// Cumulative sweep statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepStats {
    /// Completed ticks
    pub ticks: u64,
    /// Rows moved to `expired`
    pub expired: u64,
    /// Rows moved to `disabled`
    pub disabled: u64,
    /// Rows renewed
    pub renewed: u64,
    /// Renewals lost to another writer
    pub raced: u64,
    /// Failed storage operations
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicCounter,
    expired: AtomicCounter,
    disabled: AtomicCounter,
    renewed: AtomicCounter,
    raced: AtomicCounter,
    errors: AtomicCounter,
}

/// Periodic subscription sweep
pub struct LifecycleSweep<S> {
    store: Arc<S>,
    config: SweepConfig,
    span: Span,
    counters: Counters,
}

impl<S: SubscriptionStore> LifecycleSweep<S> {
    /// Create sweep over a subscription store
    pub fn new(store: Arc<S>, config: SweepConfig) -> Self {
        Self {
            store,
            config,
            span: tracing::info_span!("lifecycle"),
            counters: Counters::default(),
        }
    }

    /// Emit events under the given span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Tick on a fixed interval until shutdown. Ticks never overlap; a tick
    /// in progress when shutdown arrives runs to completion.
    pub async fn run(&self, mut shutdown: ShutdownListener) {
        let span = self.span.clone();
        async move {
            let mut ticker = tokio::time::interval(self.config.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                interval_secs = self.config.interval.as_secs(),
                grace_secs = self.config.grace.num_seconds(),
                "lifecycle sweep started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {}
                }

                let started = Instant::now();
                let report = self.tick().await;
                let elapsed = started.elapsed();
                if elapsed > self.config.interval {
                    tracing::warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        interval_ms = self.config.interval.as_millis() as u64,
                        "sweep tick overran its interval"
                    );
                }
                tracing::debug!(?report, "sweep tick finished");
            }

            tracing::info!("lifecycle sweep stopped");
        }
        .instrument(span)
        .await
    }

    /// Run one tick at the current time
    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let expire = Transition::expire(now, self.config.grace);
        report.expired = self.transition(&expire, &mut report.errors).await;
        let disable = Transition::disable(now, self.config.grace);
        report.disabled = self.transition(&disable, &mut report.errors).await;

        self.renew(now, &mut report).await;

        let c = &self.counters;
        c.ticks.inc();
        c.expired.add(report.expired);
        c.disabled.add(report.disabled);
        c.renewed.add(report.renewed);
        c.raced.add(report.raced);
        c.errors.add(report.errors);

        if report != TickReport::default() {
            tracing::info!(
                expired = report.expired,
                disabled = report.disabled,
                renewed = report.renewed,
                raced = report.raced,
                errors = report.errors,
                "sweep tick applied changes"
            );
        }
        report
    }

    /// Phase A for one transition; returns rows updated
    async fn transition(&self, transition: &Transition, errors: &mut u64) -> u64 {
        let page_size = self.config.page_size.max(1);
        let status = transition.target_status();
        let mut after: Option<SubscriptionId> = None;
        let mut updated = 0;

        loop {
            let ids = match self.store.scan_transition(transition, after, page_size).await {
                Ok(ids) => ids,
                Err(e) => {
                    *errors += 1;
                    tracing::warn!(%status, error = %e, "transition scan failed");
                    break;
                }
            };
            let Some(&last) = ids.last() else { break };
            after = Some(last);

            match self.store.apply_transition(transition, &ids).await {
                Ok(n) => updated += n,
                Err(e) => {
                    *errors += 1;
                    tracing::warn!(%status, rows = ids.len(), error = %e, "transition update failed");
                }
            }
            if ids.len() < page_size {
                break;
            }
        }
        updated
    }

    /// Phase B
    async fn renew(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let page_size = self.config.page_size.max(1);
        let mut cursor: Option<RenewCursor> = None;

        loop {
            let rows = match self.store.scan_renewable(now, cursor, page_size).await {
                Ok(rows) => rows,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(error = %e, "renewal scan failed");
                    break;
                }
            };
            let Some(last) = rows.last() else { break };
            cursor = Some(RenewCursor::at(last));

            for sub in &rows {
                self.renew_one(sub, now, report).await;
            }
            if rows.len() < page_size {
                break;
            }
        }
    }

    async fn renew_one(&self, sub: &Subscription, now: DateTime<Utc>, report: &mut TickReport) {
        let Some(renewal) =
            advance_period(sub.start_time, sub.expiry_time, sub.period_unit, sub.period_left, now)
        else {
            return;
        };

        let update = RenewalUpdate {
            id: sub.id,
            expected_expiry: sub.expiry_time,
            start_time: renewal.start_time,
            expiry_time: renewal.expiry_time,
            period_left: renewal.period_left,
        };
        match self.store.renew_if_unchanged(&update).await {
            Ok(true) => {
                report.renewed += 1;
                tracing::debug!(
                    subscription_id = sub.id,
                    tenant_id = sub.tenant_id,
                    steps = renewal.steps,
                    expiry = %renewal.expiry_time,
                    period_left = renewal.period_left,
                    "subscription renewed"
                );
            }
            Ok(false) => {
                report.raced += 1;
                tracing::debug!(subscription_id = sub.id, "renewal skipped, row changed concurrently");
            }
            Err(e) => {
                report.errors += 1;
                tracing::warn!(subscription_id = sub.id, error = %e, "renewal failed");
            }
        }
    }

    /// Get sweep statistics
    pub fn stats(&self) -> SweepStats {
        let c = &self.counters;
        SweepStats {
            ticks: c.ticks.get(),
            expired: c.expired.get(),
            disabled: c.disabled.get(),
            renewed: c.renewed.get(),
            raced: c.raced.get(),
            errors: c.errors.get(),
        }
    }
}
