//! Relay Control - forwarding control plane
//!
//! Wires the decision engine, both accounting aggregators and the lifecycle
//! sweep over one store, and carries the daemon's configuration and tracing
//! setup.
//!
//! ```text
//!            ┌──────────────── ControlPlane ────────────────┐
//!  decide ──►│ DecisionEngine                               │
//!  report ──►│ TrafficAggregator · UsageAggregator          │──► store
//!            │ LifecycleSweep (own task, shutdown-aware)    │
//!            └──────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod plane;
pub mod telemetry;

pub use config::{BatchSettings, ConfigError, ControlConfig, DatabaseConfig, SweepSettings, DEFAULT_CONFIG_PATH};
pub use plane::{ConnectionReport, ControlPlane, ControlStore, PlaneShutdownReport, PlaneStats};
