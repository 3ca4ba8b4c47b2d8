//! Relay Accounting - batched traffic and usage writers
//!
//! The hot path never waits on storage: each finished connection pushes a
//! traffic record and a usage delta into bounded queues, and one worker per
//! aggregator writes them in batches.
//!
//! ```text
//!  report ─┬─► TrafficAggregator ── key: UTC day ──► ensure day table ─► insert
//!          │         (eager ensure on first record of a day)
//!          └─► UsageAggregator ──── key: () ───────► sum per tenant ──► increment
//! ```
//!
//! Writes are at-least-once: a failed partition is retried on the next
//! flush. Only the final flush at shutdown may lose data, and it says so.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batcher;
pub mod ensure;
pub mod error;
pub mod traffic;
pub mod usage;

pub use batcher::{AggregatorStats, BatchAggregator, BatchConfig, BatchSink, ShutdownReport};
pub use ensure::EnsureGuard;
pub use error::{AccountingError, AccountingResult};
pub use traffic::{TrafficAggregator, TrafficSink};
pub use usage::{merge_deltas, UsageAggregator, UsageSink};
