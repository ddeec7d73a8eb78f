//! Destination policy for the `https` capability.
//!
//! A destination is prohibited when its host is on the deny-list or is an
//! address inside a non-routable or reserved range. Hostnames are also
//! resolved and every resolved address is checked, so a public name that
//! points at a private address is rejected too. The checked addresses are
//! the only ones the connection may use.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use thiserror::Error;
use url::{Host, Url};

/// Hostnames that are always prohibited.
pub const DENIED_HOSTS: &[&str] = &["localhost"];

/// Reserved IPv4 ranges as (network, prefix length).
pub const RESERVED_V4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),         // "this" network
    (Ipv4Addr::new(10, 0, 0, 0), 8),        // private-use
    (Ipv4Addr::new(127, 0, 0, 0), 8),       // loopback
    (Ipv4Addr::new(169, 254, 0, 0), 16),    // link-local
    (Ipv4Addr::new(172, 16, 0, 0), 12),     // private-use
    (Ipv4Addr::new(192, 0, 0, 0), 24),      // IETF protocol assignments
    (Ipv4Addr::new(192, 0, 2, 0), 24),      // TEST-NET-1
    (Ipv4Addr::new(192, 88, 99, 0), 24),    // 6to4 relay anycast
    (Ipv4Addr::new(192, 168, 0, 0), 16),    // private-use
    (Ipv4Addr::new(198, 18, 0, 0), 15),     // benchmarking
    (Ipv4Addr::new(198, 51, 100, 0), 24),   // TEST-NET-2
    (Ipv4Addr::new(203, 0, 113, 0), 24),    // TEST-NET-3
    (Ipv4Addr::new(224, 0, 0, 0), 4),       // multicast
    (Ipv4Addr::new(240, 0, 0, 0), 4),       // reserved
    (Ipv4Addr::new(255, 255, 255, 255), 32), // limited broadcast
];

/// Reserved IPv6 ranges as (network, prefix length).
pub const RESERVED_V6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 128),      // unspecified
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1), 128),      // loopback
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),   // unique-local
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),  // link-local
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32), // documentation
    (Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0), 16),  // 6to4
    (Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 32),  // Teredo
    (Ipv6Addr::new(0x5f00, 0, 0, 0, 0, 0, 0, 0), 8),   // 6bone
    (Ipv6Addr::new(0x3ffe, 0, 0, 0, 0, 0, 0, 0), 16),  // 6bone
    (Ipv6Addr::new(0x2001, 0x10, 0, 0, 0, 0, 0, 0), 28), // ORCHID
    (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8),   // multicast
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("destination host is prohibited: {0}")]
    Prohibited(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("only https URLs are allowed, got '{0}'")]
    InsecureScheme(String),

    #[error("could not resolve {host}: {reason}")]
    Unresolved { host: String, reason: String },
}

/// A destination that passed the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedUrl {
    pub url: Url,
    /// Addresses a domain host resolved to, all vetted. Empty when the host
    /// is an address literal.
    pub addrs: Vec<SocketAddr>,
}

impl CheckedUrl {
    /// Domain name the vetted addresses belong to.
    pub fn domain(&self) -> Option<&str> {
        self.url.domain()
    }
}

/// Name resolution used by [`check_url_with`].
pub type Resolve = fn(&str, u16) -> io::Result<Vec<SocketAddr>>;

/// Resolve through the system resolver.
pub fn system_resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    Ok((host, port).to_socket_addrs()?.collect())
}

fn in_v4_range(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    };
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

fn in_v6_range(ip: Ipv6Addr, network: Ipv6Addr, prefix: u8) -> bool {
    let mask = if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    };
    (u128::from(ip) & mask) == (u128::from(network) & mask)
}

/// Whether an address lies in any reserved range.
pub fn is_reserved_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => RESERVED_V4
            .iter()
            .any(|&(network, prefix)| in_v4_range(v4, network, prefix)),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_reserved_ip(IpAddr::V4(mapped));
            }
            RESERVED_V6
                .iter()
                .any(|&(network, prefix)| in_v6_range(v6, network, prefix))
        }
    }
}

/// Whether a host string (name or address literal) is prohibited.
///
/// Only inspects the string itself; see [`check_url`] for resolution.
pub fn is_prohibited(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let lower = host.trim_end_matches('.').to_ascii_lowercase();
    if DENIED_HOSTS
        .iter()
        .any(|denied| lower == *denied || lower.ends_with(&format!(".{denied}")))
    {
        return true;
    }
    match lower.parse::<IpAddr>() {
        Ok(ip) => is_reserved_ip(ip),
        Err(_) => false,
    }
}

/// Validate an outbound URL against the policy.
pub fn check_url(raw: &str) -> Result<CheckedUrl, PolicyError> {
    check_url_with(raw, system_resolve)
}

/// [`check_url`] with a caller-supplied resolver.
pub fn check_url_with(raw: &str, resolve: Resolve) -> Result<CheckedUrl, PolicyError> {
    let url = Url::parse(raw).map_err(|e| PolicyError::InvalidUrl(e.to_string()))?;
    if url.scheme() != "https" {
        return Err(PolicyError::InsecureScheme(url.scheme().to_string()));
    }

    let host = url
        .host()
        .ok_or_else(|| PolicyError::InvalidUrl("URL missing host".to_string()))?;
    let host_text = match &host {
        Host::Domain(name) => (*name).to_string(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };
    if is_prohibited(&host_text) {
        return Err(PolicyError::Prohibited(host_text));
    }

    let mut addrs = Vec::new();
    if let Host::Domain(name) = host {
        let port = url.port_or_known_default().unwrap_or(443);
        addrs = resolve(name, port).map_err(|e| PolicyError::Unresolved {
            host: name.to_string(),
            reason: e.to_string(),
        })?;
        if addrs.is_empty() {
            return Err(PolicyError::Unresolved {
                host: name.to_string(),
                reason: "no addresses".to_string(),
            });
        }
        if let Some(addr) = addrs.iter().find(|addr| is_reserved_ip(addr.ip())) {
            return Err(PolicyError::Prohibited(format!("{name} ({})", addr.ip())));
        }
    }

    Ok(CheckedUrl { url, addrs })
}
