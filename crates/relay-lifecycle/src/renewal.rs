//! Period stepping
//!
//! A renewal moves a subscription forward whole periods at a time until its
//! expiry is in the future or it runs out of periods. Each step's expiry is
//! computed from the starting expiry (`expiry + k units`) so month steps
//! clamp to month end without drifting: Jan 31 → Feb 29 → Mar 31.

use chrono::{DateTime, Days, Months, Utc};
use relay_common::{has_remaining_periods, PeriodUnit, UNLIMITED_PERIODS};

/// New period boundaries after stepping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Renewal {
    /// Start of the new current period
    pub start_time: DateTime<Utc>,
    /// End of the new current period
    pub expiry_time: DateTime<Utc>,
    /// Remaining periods after stepping
    pub period_left: i32,
    /// Periods stepped
    pub steps: u32,
}

/// `expiry + k units`, or `None` past the representable range
pub fn add_periods(expiry: DateTime<Utc>, unit: PeriodUnit, k: u32) -> Option<DateTime<Utc>> {
    match unit {
        PeriodUnit::Day => expiry.checked_add_days(Days::new(u64::from(k))),
        PeriodUnit::Month => expiry.checked_add_months(Months::new(k)),
    }
}

/// Step a subscription forward from its current expiry.
///
/// Stops once expiry is after `now` or no periods remain; `period_left`
/// decrements per step unless unlimited. Returns `None` when no step applies.
pub fn advance_period(
    start_time: DateTime<Utc>,
    expiry_time: DateTime<Utc>,
    unit: PeriodUnit,
    period_left: i32,
    now: DateTime<Utc>,
) -> Option<Renewal> {
    let mut renewal = Renewal { start_time, expiry_time, period_left, steps: 0 };

    while renewal.expiry_time <= now && has_remaining_periods(renewal.period_left) {
        let Some(next) = add_periods(expiry_time, unit, renewal.steps + 1) else {
            break;
        };
        renewal.start_time = renewal.expiry_time;
        renewal.expiry_time = next;
        renewal.steps += 1;
        if renewal.period_left != UNLIMITED_PERIODS {
            renewal.period_left -= 1;
        }
    }

    (renewal.steps > 0).then_some(renewal)
}
