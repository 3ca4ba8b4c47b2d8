//! Traffic accounting types

use crate::TenantId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

storage_enum! {
    /// Which side opened the connection
    pub enum FlowDirection {
        /// Client to destination
        Outbound => "outbound",
        /// Destination back through a listener
        Inbound => "inbound",
    }
}

/// Immutable per-connection log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    /// Connection close time
    pub time: DateTime<Utc>,
    /// Tenant
    pub tenant_id: TenantId,
    /// Direction
    pub direction: FlowDirection,
    /// Listener endpoint that accepted the connection
    pub listen: String,
    /// Client endpoint
    pub source: String,
    /// Destination endpoint
    pub target: String,
    /// Transport or upstream protocol
    pub protocol: String,
    /// Bytes client → destination
    pub bytes_up: u64,
    /// Bytes destination → client
    pub bytes_down: u64,
    /// Connection lifetime
    pub duration: Duration,
}

impl TrafficRecord {
    /// Day partition the row belongs to
    pub fn partition(&self) -> DayPartition {
        DayPartition::of(self.time)
    }
}

/// UTC calendar day used as the traffic log partition key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DayPartition(NaiveDate);

impl DayPartition {
    /// Partition containing `time`
    pub fn of(time: DateTime<Utc>) -> Self {
        Self(time.date_naive())
    }

    /// Partition for a date
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Calendar date
    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl std::fmt::Display for DayPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// Per-tenant byte counter increment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    /// Tenant
    pub tenant_id: TenantId,
    /// Upload bytes
    pub up: u64,
    /// Download bytes
    pub down: u64,
}

impl UsageDelta {
    /// Create delta
    pub fn new(tenant_id: TenantId, up: u64, down: u64) -> Self {
        Self { tenant_id, up, down }
    }

    /// Whether applying the delta changes nothing
    pub fn is_empty(&self) -> bool {
        self.up == 0 && self.down == 0
    }
}
