use crate::error::{Error, Result};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Smallest and largest prefix lengths accepted for a managed segment.
pub const MIN_PREFIX: u8 = 2;
pub const MAX_PREFIX: u8 = 30;

/// Parse and validate a segment CIDR.
///
/// Rejects anything that is not IPv4 `a.b.c.d/n`, and degenerate prefixes
/// (/31, /32) that leave no room for a network and broadcast address.
/// Host bits are truncated, so `10.0.0.7/24` becomes `10.0.0.0/24`.
pub fn parse_segment_cidr(cidr: &str) -> Result<Ipv4Net> {
    let invalid = |reason: &str| Error::InvalidCidr {
        cidr: cidr.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = cidr.trim();
    if !trimmed.contains('/') {
        return Err(invalid("missing prefix length"));
    }
    let net: Ipv4Net = trimmed
        .parse()
        .map_err(|e: ipnet::AddrParseError| invalid(&e.to_string()))?;
    let prefix = net.prefix_len();
    if !(MIN_PREFIX..=MAX_PREFIX).contains(&prefix) {
        return Err(invalid(&format!(
            "prefix /{prefix} outside /{MIN_PREFIX}../{MAX_PREFIX}"
        )));
    }
    Ok(net.trunc())
}

/// Number of usable host addresses (network+1 .. broadcast-1).
pub fn usable_host_count(net: Ipv4Net) -> u64 {
    let start = u32::from(net.network()) as u64;
    let end = u32::from(net.broadcast()) as u64;
    end.saturating_sub(start).saturating_sub(1)
}

/// Lazily iterate the usable hosts of a network, skipping network and broadcast.
pub fn usable_hosts(net: Ipv4Net) -> impl Iterator<Item = Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    let first = if end <= start + 1 { end } else { start + 1 };
    (first..end).map(Ipv4Addr::from)
}

/// True if `ip` is a usable host of `net`.
pub fn is_usable_host(net: Ipv4Net, ip: Ipv4Addr) -> bool {
    net.contains(&ip) && ip != net.network() && ip != net.broadcast()
}

/// Parse a sweep prefix given as the first three octets, e.g. `192.168.1`
/// (a trailing `.` or `.0/24` is tolerated), into its /24 network.
pub fn parse_sweep_prefix(prefix: &str) -> Result<Ipv4Net> {
    let raw = prefix.trim().trim_end_matches("/24").trim_end_matches('.');
    let parts: Vec<&str> = raw.split('.').collect();
    let octets = match parts.len() {
        3 => &parts[..],
        4 if parts[3] == "0" => &parts[..3],
        _ => return Err(Error::InvalidAddress(prefix.to_string())),
    };
    let mut o = [0u8; 3];
    for (slot, part) in o.iter_mut().zip(octets) {
        *slot = part
            .parse::<u8>()
            .map_err(|_| Error::InvalidAddress(prefix.to_string()))?;
    }
    Ok(ipv4_to_default_cidr(Ipv4Addr::new(o[0], o[1], o[2], 0)))
}

/// Detect local non-loopback IPv4 addresses and convert each to a default /24 CIDR network.
///
/// For example, an interface IP `192.168.1.42` becomes `192.168.1.0/24`.
/// Duplicates are removed.
pub fn detect_local_cidrs() -> Result<Vec<Ipv4Net>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            set.insert(ipv4_to_default_cidr(v4.ip));
        }
    }
    let mut cidrs: Vec<Ipv4Net> = set.into_iter().collect();
    // Sort for stable output
    cidrs.sort_by_key(|n| (u32::from(n.network()), n.prefix_len()));
    Ok(cidrs)
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    // /24 is always a valid prefix length
    Ipv4Net::new(net, 24).unwrap_or_else(|_| Ipv4Net::from(net))
}
