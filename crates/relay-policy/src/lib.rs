//! Relay Policy - routing decisions for outbound connections
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Decision Engine                          │
//! │                                                              │
//! │  "sub.example.com:443"                                       │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────┐  host, rev  ┌──────────────────┐            │
//! │  │ Normalizer  │────────────►│ Candidate repo   │ ≤3 rows    │
//! │  │ (port, IDNA)│   or ip16   │ ip │ exact │ sfx │──┐         │
//! │  └─────────────┘             └──────────────────┘  │         │
//! │         │ protected                                ▼         │
//! │         ▼                                   best by rank     │
//! │     [REJECT]                     (tenant, priority, id)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod normalize;

pub use engine::{Decision, DecisionEngine, EngineStats, ResolvedForward};
pub use error::{PolicyError, PolicyResult};
pub use normalize::{is_protected, normalize, reverse_labels, strip_port, Destination};
