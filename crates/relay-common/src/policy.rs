//! Policy matcher and forward target types
//!
//! A matcher maps a destination pattern to an [`Action`]. IP and CIDR
//! matchers are stored as inclusive 16-byte ranges so that IPv4 and IPv6
//! compare with the same byte-wise ordering.

use crate::{GroupId, MatcherId, ModelError, ModelResult, RuleId, TargetId, TenantId};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

storage_enum! {
    /// Matcher kind
    pub enum MatcherKind {
        /// Single IP address
        Ip => "ip",
        /// CIDR block
        Cidr => "cidr",
        /// Exact domain name
        DomainExact => "domain_exact",
        /// Domain and all of its subdomains
        DomainSuffix => "domain_suffix",
    }
}

storage_enum! {
    /// Routing action
    pub enum Action {
        /// Connect to the destination directly
        Direct => "direct",
        /// Relay through a forward target
        Forward => "forward",
        /// Refuse the connection
        Reject => "reject",
    }
}

storage_enum! {
    /// Operator-controlled row status for matchers and targets
    pub enum RuleStatus {
        /// Row takes part in decisions
        Enabled => "enabled",
        /// Row is ignored
        Disabled => "disabled",
    }
}

impl Default for Action {
    fn default() -> Self {
        Self::Direct
    }
}

/// Convert an address into its 16-byte comparable form.
///
/// IPv4 addresses become IPv4-mapped IPv6 (`::ffff:a.b.c.d`).
#[inline]
pub fn ip16(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Inclusive 16-byte IP range. `from <= to` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RangeBounds", into = "RangeBounds")]
pub struct IpRange {
    from: [u8; 16],
    to: [u8; 16],
}

#[derive(Serialize, Deserialize)]
struct RangeBounds {
    from: [u8; 16],
    to: [u8; 16],
}

impl TryFrom<RangeBounds> for IpRange {
    type Error = ModelError;

    fn try_from(bounds: RangeBounds) -> ModelResult<Self> {
        Self::new(bounds.from, bounds.to)
    }
}

impl From<IpRange> for RangeBounds {
    fn from(range: IpRange) -> Self {
        Self { from: range.from, to: range.to }
    }
}

impl IpRange {
    /// Create range from normalized bounds
    pub fn new(from: [u8; 16], to: [u8; 16]) -> ModelResult<Self> {
        if from > to {
            return Err(ModelError::InvalidRange);
        }
        Ok(Self { from, to })
    }

    /// Range covering a single address
    pub fn single(ip: IpAddr) -> Self {
        let bytes = ip16(ip);
        Self { from: bytes, to: bytes }
    }

    /// Range covering a CIDR block such as `10.0.0.0/8` or `2001:db8::/32`
    pub fn from_cidr(cidr: &str) -> ModelResult<Self> {
        let network: IpNetwork = cidr
            .parse()
            .map_err(|_| ModelError::InvalidCidr(cidr.to_string()))?;
        let (first, last) = match network {
            IpNetwork::V4(net) => (IpAddr::V4(net.network()), IpAddr::V4(net.broadcast())),
            IpNetwork::V6(net) => (IpAddr::V6(net.network()), IpAddr::V6(net.broadcast())),
        };
        Self::new(ip16(first), ip16(last))
    }

    /// Decode from stored bytes
    pub fn from_slices(from: &[u8], to: &[u8]) -> ModelResult<Self> {
        let from: [u8; 16] = from
            .try_into()
            .map_err(|_| ModelError::InvalidIpBytes(from.len()))?;
        let to: [u8; 16] = to
            .try_into()
            .map_err(|_| ModelError::InvalidIpBytes(to.len()))?;
        Self::new(from, to)
    }

    /// Lower bound
    pub fn start(&self) -> &[u8; 16] {
        &self.from
    }

    /// Upper bound
    pub fn end(&self) -> &[u8; 16] {
        &self.to
    }

    /// Check whether a normalized address falls in the range
    #[inline]
    pub fn contains(&self, ip: &[u8; 16]) -> bool {
        &self.from <= ip && ip <= &self.to
    }
}

/// What a matcher compares against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPayload {
    /// Single address, stored as a one-element range
    Ip(IpRange),
    /// CIDR block range
    Cidr(IpRange),
    /// Lowercase ASCII domain
    DomainExact(String),
    /// Label-reversed domain with trailing separator, e.g. `com.example.`
    DomainSuffix(String),
}

impl MatchPayload {
    /// Kind implied by the payload
    pub fn kind(&self) -> MatcherKind {
        match self {
            Self::Ip(_) => MatcherKind::Ip,
            Self::Cidr(_) => MatcherKind::Cidr,
            Self::DomainExact(_) => MatcherKind::DomainExact,
            Self::DomainSuffix(_) => MatcherKind::DomainSuffix,
        }
    }

    /// IP range for ip/cidr payloads
    pub fn ip_range(&self) -> Option<&IpRange> {
        match self {
            Self::Ip(range) | Self::Cidr(range) => Some(range),
            _ => None,
        }
    }

    /// Domain value for domain payloads
    pub fn domain(&self) -> Option<&str> {
        match self {
            Self::DomainExact(d) | Self::DomainSuffix(d) => Some(d),
            _ => None,
        }
    }
}

/// Matcher owner. Tenant-owned rows outrank group-owned rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatcherOwner {
    /// Owned by a single tenant
    Tenant(TenantId),
    /// Shared by a tenant group
    Group(GroupId),
}

impl MatcherOwner {
    /// Whether this owner is exactly the given tenant
    #[inline]
    pub fn is_tenant(&self, tenant_id: TenantId) -> bool {
        matches!(self, Self::Tenant(id) if *id == tenant_id)
    }

    /// Whether a request from `(tenant_id, group_id)` may use this row
    #[inline]
    pub fn is_visible_to(&self, tenant_id: TenantId, group_id: GroupId) -> bool {
        match self {
            Self::Tenant(id) => *id == tenant_id,
            Self::Group(id) => *id == group_id,
        }
    }
}

/// Stored policy rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMatcher {
    /// Row ID (newer rows have larger IDs)
    pub id: MatcherId,
    /// Owning tenant or group
    pub owner: MatcherOwner,
    /// Forwarding rule this matcher belongs to
    pub rule_id: RuleId,
    /// Match pattern
    pub payload: MatchPayload,
    /// Action on match
    pub action: Action,
    /// Forward target for `Action::Forward`
    pub target_id: Option<TargetId>,
    /// Higher wins
    pub priority: i32,
    /// Operator status
    pub status: RuleStatus,
}

impl PolicyMatcher {
    /// Matcher kind
    pub fn kind(&self) -> MatcherKind {
        self.payload.kind()
    }

    /// Whether the row takes part in decisions
    pub fn is_enabled(&self) -> bool {
        self.status == RuleStatus::Enabled
    }
}

/// Upstream credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// TLS options for connecting to an upstream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Skip certificate verification
    pub skip_verify: bool,
    /// ALPN protocols, in preference order
    pub alpn: Vec<String>,
    /// Pinned certificate fingerprint (hex SHA-256)
    pub fingerprint: Option<String>,
    /// Refuse handshakes whose SNI differs from the target host
    pub sni_guard: bool,
}

/// Configured upstream for forwarded traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
    /// Row ID
    pub id: TargetId,
    /// Upstream protocol, e.g. `socks5`, `http`
    pub protocol: String,
    /// Upstream `host:port`
    pub address: String,
    /// Optional credentials
    pub credentials: Option<Credentials>,
    /// TLS options
    pub tls: TlsOptions,
    /// Operator status
    pub status: RuleStatus,
}

impl ForwardTarget {
    /// Whether the target may be used
    pub fn is_enabled(&self) -> bool {
        self.status == RuleStatus::Enabled
    }
}
