//! Storage traits consumed by the engines
//!
//! Backends keep every dialect detail (table names, quoting, placeholders)
//! behind these traits.

use crate::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use relay_common::{
    has_remaining_periods, DayPartition, ForwardTarget, GroupId, PolicyMatcher, RuleId,
    Subscription, SubscriptionId, SubscriptionStatus, TargetId, TenantId, TrafficRecord,
    UsageDelta,
};

/// Normalized inputs for a candidate lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    /// Requesting tenant
    pub tenant_id: TenantId,
    /// Tenant's group
    pub group_id: GroupId,
    /// Forwarding rule the connection arrived on
    pub rule_id: RuleId,
    /// 16-byte destination address, when the destination is an IP
    pub ip: Option<[u8; 16]>,
    /// ASCII lowercase host, when the destination is a domain
    pub host: Option<String>,
    /// Label-reversed host with trailing separator
    pub reversed_host: Option<String>,
}

/// Read side of the policy store
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// At most one best-ranked enabled matcher per class: ip/cidr,
    /// domain_exact, domain_suffix.
    async fn find_candidates(&self, query: &CandidateQuery) -> StoreResult<Vec<PolicyMatcher>>;

    /// Forward target by ID, regardless of status
    async fn forward_target(&self, id: TargetId) -> StoreResult<Option<ForwardTarget>>;
}

/// Write side of traffic and usage accounting
#[async_trait]
pub trait AccountingStore: Send + Sync {
    /// Create the day's traffic table and its indexes if absent. Idempotent.
    async fn ensure_partition(&self, day: DayPartition) -> StoreResult<()>;

    /// Insert all records into the day's table in one transaction
    async fn insert_batch(&self, day: DayPartition, records: &[TrafficRecord]) -> StoreResult<()>;

    /// Apply relative increments `up += Δup, down += Δdown`
    async fn increment_counters_batch(&self, deltas: &[UsageDelta]) -> StoreResult<()>;
}

/// Status transition applied by the lifecycle sweep to terminal subscriptions
/// (`period_left = 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `enabled → expired`: past expiry, still inside the grace window
    Expire {
        /// Tick time
        now: DateTime<Utc>,
        /// `now - grace`
        grace_cutoff: DateTime<Utc>,
    },
    /// `enabled|expired → disabled`: past expiry plus grace
    Disable {
        /// `now - grace`
        grace_cutoff: DateTime<Utc>,
    },
}

impl Transition {
    /// Expire step for a tick
    pub fn expire(now: DateTime<Utc>, grace: Duration) -> Self {
        Self::Expire { now, grace_cutoff: grace_cutoff(now, grace) }
    }

    /// Disable step for a tick
    pub fn disable(now: DateTime<Utc>, grace: Duration) -> Self {
        Self::Disable { grace_cutoff: grace_cutoff(now, grace) }
    }

    /// Status written by the transition
    pub fn target_status(&self) -> SubscriptionStatus {
        match self {
            Self::Expire { .. } => SubscriptionStatus::Expired,
            Self::Disable { .. } => SubscriptionStatus::Disabled,
        }
    }

    /// Statuses the transition applies to
    pub fn source_statuses(&self) -> &'static [SubscriptionStatus] {
        match self {
            Self::Expire { .. } => &[SubscriptionStatus::Enabled],
            Self::Disable { .. } => &[SubscriptionStatus::Enabled, SubscriptionStatus::Expired],
        }
    }

    /// Predicate evaluated against a row
    pub fn matches(&self, sub: &Subscription) -> bool {
        if sub.period_left != 0 || !self.source_statuses().contains(&sub.status) {
            return false;
        }
        match *self {
            Self::Expire { now, grace_cutoff } => {
                sub.expiry_time <= now && sub.expiry_time > grace_cutoff
            }
            Self::Disable { grace_cutoff } => sub.expiry_time <= grace_cutoff,
        }
    }
}

/// `now - grace`, pinned to the earliest instant when grace reaches past it
fn grace_cutoff(now: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(grace).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Keyset cursor for the renewal scan, ordered by `(expiry_time, id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RenewCursor {
    /// Expiry of the last row seen
    pub expiry_time: DateTime<Utc>,
    /// ID of the last row seen
    pub id: SubscriptionId,
}

impl RenewCursor {
    /// Cursor positioned at a row
    pub fn at(sub: &Subscription) -> Self {
        Self { expiry_time: sub.expiry_time, id: sub.id }
    }
}

/// Compare-and-swap renewal. Applies only while the row is still enabled,
/// still has `expected_expiry`, and still has remaining periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalUpdate {
    /// Row
    pub id: SubscriptionId,
    /// Expiry observed when the renewal was computed
    pub expected_expiry: DateTime<Utc>,
    /// New period start
    pub start_time: DateTime<Utc>,
    /// New expiry
    pub expiry_time: DateTime<Utc>,
    /// New remaining periods
    pub period_left: i32,
}

impl RenewalUpdate {
    /// Whether the CAS precondition holds for a row
    pub fn precondition_holds(&self, sub: &Subscription) -> bool {
        sub.id == self.id
            && sub.status == SubscriptionStatus::Enabled
            && sub.expiry_time == self.expected_expiry
            && has_remaining_periods(sub.period_left)
    }
}

/// Subscription access for the lifecycle sweep
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// IDs matching a transition after `after_id` (from the start when `None`),
    /// ascending, at most `limit`
    async fn scan_transition(
        &self,
        transition: &Transition,
        after_id: Option<SubscriptionId>,
        limit: usize,
    ) -> StoreResult<Vec<SubscriptionId>>;

    /// Batch status update over a page of IDs. The transition predicate is
    /// re-checked so rows changed since the scan are left alone.
    async fn apply_transition(
        &self,
        transition: &Transition,
        ids: &[SubscriptionId],
    ) -> StoreResult<u64>;

    /// Enabled rows with remaining periods and `expiry_time <= now`, ordered
    /// by `(expiry_time, id)` after `cursor`, at most `limit`
    async fn scan_renewable(
        &self,
        now: DateTime<Utc>,
        cursor: Option<RenewCursor>,
        limit: usize,
    ) -> StoreResult<Vec<Subscription>>;

    /// Conditional renewal; `Ok(false)` means another writer got there first
    async fn renew_if_unchanged(&self, update: &RenewalUpdate) -> StoreResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use relay_common::PeriodUnit;

    fn sub(status: SubscriptionStatus, period_left: i32, expiry: DateTime<Utc>) -> Subscription {
        Subscription {
            id: 1,
            tenant_id: 1,
            status,
            period_unit: PeriodUnit::Day,
            period_left,
            start_time: expiry - Duration::days(1),
            expiry_time: expiry,
        }
    }

    #[test]
    fn test_transition_windows() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let grace = Duration::days(3);
        let expire = Transition::expire(now, grace);
        let disable = Transition::disable(now, grace);

        let in_grace = sub(SubscriptionStatus::Enabled, 0, now - Duration::days(1));
        assert!(expire.matches(&in_grace));
        assert!(!disable.matches(&in_grace));

        let past_grace = sub(SubscriptionStatus::Enabled, 0, now - Duration::days(5));
        assert!(!expire.matches(&past_grace));
        assert!(disable.matches(&past_grace));

        let expired = sub(SubscriptionStatus::Expired, 0, now - Duration::days(5));
        assert!(disable.matches(&expired));

        let renewable = sub(SubscriptionStatus::Enabled, 2, now - Duration::days(1));
        assert!(!expire.matches(&renewable));

        let future = sub(SubscriptionStatus::Enabled, 0, now + Duration::days(1));
        assert!(!expire.matches(&future));
    }

    #[test]
    fn test_huge_grace_never_disables() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let grace = Duration::seconds(i64::MAX / 1000);
        let expire = Transition::expire(now, grace);
        let disable = Transition::disable(now, grace);

        let ancient = sub(SubscriptionStatus::Enabled, 0, Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap());
        assert!(expire.matches(&ancient));
        assert!(!disable.matches(&ancient));
    }

    #[test]
    fn test_renewal_precondition() {
        let expiry = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let row = sub(SubscriptionStatus::Enabled, 3, expiry);
        let update = RenewalUpdate {
            id: 1,
            expected_expiry: expiry,
            start_time: expiry,
            expiry_time: expiry + Duration::days(1),
            period_left: 2,
        };
        assert!(update.precondition_holds(&row));

        let moved = Subscription { expiry_time: expiry + Duration::days(1), ..row.clone() };
        assert!(!update.precondition_holds(&moved));

        let disabled = Subscription { status: SubscriptionStatus::Disabled, ..row };
        assert!(!update.precondition_holds(&disabled));
    }
}
