//! Relay Store - storage backends for the forwarding control plane
//!
//! The engines only see three small traits:
//!
//! ```text
//! ┌────────────────────┐   ┌───────────────────┐   ┌────────────────────┐
//! │  PolicyRepository  │   │  AccountingStore  │   │ SubscriptionStore  │
//! │  find_candidates   │   │  ensure_partition │   │  scan / transition │
//! │  forward_target    │   │  insert_batch     │   │  scan_renewable    │
//! │                    │   │  increment_…      │   │  renew_if_unchanged│
//! └─────────┬──────────┘   └─────────┬─────────┘   └─────────┬──────────┘
//!           └────────────────┬───────┴───────────────────────┘
//!                  ┌─────────┴─────────┐
//!                  ▼                   ▼
//!             MemoryStore         SqliteStore
//! ```
//!
//! `MemoryStore` backs unit tests and carries failure injection.
//! `SqliteStore` is the production backend.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod memory;
pub mod repo;
pub mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use repo::{
    AccountingStore, CandidateQuery, PolicyRepository, RenewCursor, RenewalUpdate,
    SubscriptionStore, Transition,
};
pub use sqlite::{PartitionResolver, SqliteStore};
