//! Subscription types

use crate::{SubscriptionId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `period_left` value meaning "renews forever"
pub const UNLIMITED_PERIODS: i32 = -1;

storage_enum! {
    /// Subscription status. `Disabled` has no way back inside the core.
    pub enum SubscriptionStatus {
        /// Tenant may connect
        Enabled => "enabled",
        /// Past expiry, inside the grace window
        Expired => "expired",
        /// Past expiry and grace
        Disabled => "disabled",
    }
}

storage_enum! {
    /// Renewal cadence
    pub enum PeriodUnit {
        /// One calendar day
        Day => "day",
        /// One calendar month
        Month => "month",
    }
}

/// Time-bounded tenant subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Row ID
    pub id: SubscriptionId,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Current status
    pub status: SubscriptionStatus,
    /// Renewal cadence
    pub period_unit: PeriodUnit,
    /// `-1` unlimited, `0` terminal, `>0` renewals remaining
    pub period_left: i32,
    /// Start of the current period
    pub start_time: DateTime<Utc>,
    /// End of the current period
    pub expiry_time: DateTime<Utc>,
}

impl Subscription {
    /// Whether another renewal is allowed
    #[inline]
    pub fn has_remaining_periods(&self) -> bool {
        has_remaining_periods(self.period_left)
    }

    /// Whether the tenant may connect at `now`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Enabled && now < self.expiry_time
    }
}

/// Remaining-periods predicate shared by scans and compare-and-swap updates
#[inline]
pub fn has_remaining_periods(period_left: i32) -> bool {
    period_left == UNLIMITED_PERIODS || period_left > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_remaining_periods() {
        assert!(has_remaining_periods(UNLIMITED_PERIODS));
        assert!(has_remaining_periods(3));
        assert!(!has_remaining_periods(0));
    }

    #[test]
    fn test_active_at() {
        let sub = Subscription {
            id: 1,
            tenant_id: 1,
            status: SubscriptionStatus::Enabled,
            period_unit: PeriodUnit::Month,
            period_left: 0,
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            expiry_time: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        };
        assert!(sub.is_active_at(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()));
        assert!(!sub.is_active_at(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        assert_eq!("expired".parse::<SubscriptionStatus>().unwrap(), SubscriptionStatus::Expired);
        assert_eq!(PeriodUnit::Day.as_str(), "day");
    }
}
