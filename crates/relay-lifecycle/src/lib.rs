//! Relay Lifecycle - subscription expiry and renewal
//!
//! A single periodic sweep keeps subscription rows honest:
//!
//! ```text
//!             expiry ≤ now, left = 0          expiry + grace ≤ now
//!  enabled ────────────────────────► expired ─────────────────────► disabled
//!     │ ▲
//!     └─┘ expiry ≤ now, left ≠ 0: step whole periods (day / month)
//! ```
//!
//! Several sweeps may run against the same store. Transitions re-check their
//! predicate in the update and renewals are compare-and-swap, so racing
//! sweeps never double-renew a row.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod renewal;
pub mod sweep;

pub use renewal::{add_periods, advance_period, Renewal};
pub use sweep::{LifecycleSweep, SweepConfig, SweepStats, TickReport};
