//! Destination normalization
//!
//! Turns whatever the client asked to connect to into one of:
//!
//! - `Protected`: `localhost`, loopback or unspecified addresses (including
//!   their IPv4-mapped IPv6 forms). Always rejected.
//! - `Ip`: 16-byte comparable form.
//! - `Domain`: IDNA ASCII host plus its label-reversed form.
//! - `Unrecognized`: nothing usable; routed direct.

use relay_common::ip16;
use std::net::IpAddr;

/// Normalized destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Must never be connected to on a tenant's behalf
    Protected,
    /// Literal IP address
    Ip([u8; 16]),
    /// Domain name
    Domain {
        /// Lowercase ASCII host without trailing dot
        host: String,
        /// Label-reversed host with trailing separator
        reversed: String,
    },
    /// Empty or not encodable
    Unrecognized,
}

/// Normalize a destination such as `example.com`, `example.com:443`,
/// `10.0.0.1:80`, `[2001:db8::1]:443` or a bare IPv6 literal.
pub fn normalize(destination: &str) -> Destination {
    let host = canonical_host(destination);
    if host.is_empty() {
        return Destination::Unrecognized;
    }
    if let Some(literal) = classify_literal(&host) {
        return literal;
    }

    // IDNA mapping can turn fullwidth digits and ideographic dots into a
    // loopback literal or a trailing dot, so the ASCII form is checked again.
    match idna::domain_to_ascii(&host) {
        Ok(ascii) => {
            let ascii = ascii.strip_suffix('.').unwrap_or(&ascii);
            if ascii.is_empty() {
                return Destination::Unrecognized;
            }
            if let Some(literal) = classify_literal(ascii) {
                return literal;
            }
            Destination::Domain { host: ascii.to_string(), reversed: reverse_labels(ascii) }
        }
        Err(_) => Destination::Unrecognized,
    }
}

/// `localhost` and IP literals
fn classify_literal(host: &str) -> Option<Destination> {
    if host == "localhost" {
        return Some(Destination::Protected);
    }
    let ip = host.parse::<IpAddr>().ok()?;
    Some(if is_protected_ip(ip) { Destination::Protected } else { Destination::Ip(ip16(ip)) })
}

/// Whether a destination (with or without port) is protected
pub fn is_protected(destination: &str) -> bool {
    matches!(normalize(destination), Destination::Protected)
}

/// Reverse the labels of a domain and append the separator:
/// `sub.example.com` → `com.example.sub.`
///
/// Stored `domain_suffix` values are built with this function, so a suffix
/// match is a plain string-prefix test that respects label boundaries.
pub fn reverse_labels(domain: &str) -> String {
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    let mut reversed = String::with_capacity(domain.len() + 1);
    for label in domain.rsplit('.') {
        reversed.push_str(label);
        reversed.push('.');
    }
    reversed
}

/// Remove a port, if any, from `host`, `host:port`, `[v6]:port` or bare v6
pub fn strip_port(destination: &str) -> &str {
    let destination = destination.trim();

    if let Some(rest) = destination.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => destination,
        };
    }

    // A single colon separates the port; more than one is a bare IPv6
    match destination.rfind(':') {
        Some(idx) if destination[..idx].find(':').is_none() => &destination[..idx],
        _ => destination,
    }
}

/// Port-free, lowercase host with one trailing dot removed
fn canonical_host(destination: &str) -> String {
    let host = strip_port(destination);
    let host = host.strip_suffix('.').unwrap_or(host);
    host.to_ascii_lowercase()
}

fn is_protected_ip(ip: IpAddr) -> bool {
    let ip = ip.to_canonical();
    ip.is_loopback() || ip.is_unspecified()
}
