//! Relay Common - shared types for the forwarding control plane
//!
//! This crate holds everything the engines agree on:
//! - Policy matchers, forward targets and the ranking used to pick a winner
//! - Subscriptions and their period bookkeeping
//! - Traffic records, usage deltas and the day partition key
//! - The shutdown signal every background loop listens to
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        CONTROL PLANE                             │
//! │                                                                  │
//! │  connect ──► Decision Engine ──► dialer ──► report               │
//! │                   │                            │                 │
//! │                   ▼                            ▼                 │
//! │             policy store          traffic + usage aggregators    │
//! │                                                │                 │
//! │  lifecycle sweep ──► subscriptions ◄───────────┘ storage         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every enum that reaches storage has a fixed lowercase encoding exposed by
//! `as_str()` / `FromStr`; those strings are part of the storage contract.

#![warn(missing_docs)]
#![warn(clippy::all)]

#[macro_use]
mod macros;

pub mod error;
pub mod policy;
pub mod rank;
pub mod shutdown;
pub mod subscription;
pub mod traffic;

pub use error::*;
pub use policy::*;
pub use rank::{best_candidate, rank_key};
pub use shutdown::{Shutdown, ShutdownListener};
pub use subscription::*;
pub use traffic::*;

use std::sync::atomic::{AtomicU64, Ordering};

/// Tenant identifier
pub type TenantId = i64;
/// Tenant group identifier
pub type GroupId = i64;
/// Forwarding rule identifier (the listener-side rule a connection arrived on)
pub type RuleId = i64;
/// Policy matcher row identifier
pub type MatcherId = i64;
/// Forward target row identifier
pub type TargetId = i64;
/// Subscription row identifier
pub type SubscriptionId = i64;

/// Lock-free counter for component statistics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_counter() {
        let counter = AtomicCounter::new(0);
        assert_eq!(counter.inc(), 0);
        assert_eq!(counter.add(5), 1);
        assert_eq!(counter.get(), 6);
    }
}
