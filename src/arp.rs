//! MAC address handling and neighbour-table lookups.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use tracing::debug;

/// Resolves the hardware address currently associated with an IPv4 address.
///
/// Implementations take one snapshot per probe batch so every address in a
/// cycle is resolved against the same table.
pub trait MacResolver: Send + Sync {
    fn snapshot(&self) -> HashMap<Ipv4Addr, String>;
}

/// Reads the kernel neighbour table from `/proc/net/arp`.
pub struct ProcArpResolver {
    path: PathBuf,
}

impl ProcArpResolver {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/proc/net/arp"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcArpResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MacResolver for ProcArpResolver {
    fn snapshot(&self) -> HashMap<Ipv4Addr, String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => parse_arp_table(&content),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "neighbour table unavailable");
                HashMap::new()
            }
        }
    }
}

/// Resolver that never knows any MAC. Used where no neighbour table exists.
pub struct NoMacResolver;

impl MacResolver for NoMacResolver {
    fn snapshot(&self) -> HashMap<Ipv4Addr, String> {
        HashMap::new()
    }
}

/// Parse the Linux `/proc/net/arp` format, skipping incomplete entries.
pub fn parse_arp_table(content: &str) -> HashMap<Ipv4Addr, String> {
    let mut out = HashMap::new();
    for line in content.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 {
            continue;
        }
        let Ok(ip) = cols[0].parse::<Ipv4Addr>() else {
            continue;
        };
        // flags 0x0 marks an incomplete entry
        if cols[2] == "0x0" {
            continue;
        }
        if let Some(mac) = normalize_mac(cols[3]) {
            if mac != "00:00:00:00:00:00" {
                out.insert(ip, mac);
            }
        }
    }
    out
}

/// Normalize a MAC address to upper-case `XX:XX:XX:XX:XX:XX`.
///
/// Accepts colon, dash or dot separated input and bare 12-digit hex.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let hex: String = mac
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let separated = mac.trim().contains(|c: char| c == ':' || c == '-');
    if separated {
        let groups: Vec<&str> = mac.trim().split(|c: char| c == ':' || c == '-').collect();
        if groups.len() != 6 || groups.iter().any(|g| g.len() != 2) {
            return None;
        }
    }
    let upper = hex.to_ascii_uppercase();
    let pairs: Vec<&str> = (0..6).map(|i| &upper[i * 2..i * 2 + 2]).collect();
    Some(pairs.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_forms() {
        assert_eq!(normalize_mac("aa:bb:cc:dd:ee:01").as_deref(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(normalize_mac("AA-BB-CC-DD-EE-01").as_deref(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(normalize_mac("aabb.ccdd.ee01").as_deref(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(normalize_mac("aabbccddee01").as_deref(), Some("AA:BB:CC:DD:EE:01"));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(normalize_mac("aa:bb:cc"), None);
        assert_eq!(normalize_mac("zz:bb:cc:dd:ee:01"), None);
        assert_eq!(normalize_mac("aab:bcc:dd:ee:01:0"), None);
    }

    #[test]
    fn parses_proc_net_arp() {
        let table = "\
IP address       HW type     Flags       HW address            Mask     Device
10.0.0.1         0x1         0x2         00:11:22:33:44:01     *        eth0
10.0.0.2         0x1         0x0         00:00:00:00:00:00     *        eth0
10.0.0.3         0x1         0x2         de:ad:be:ef:00:03     *        eth0
";
        let map = parse_arp_table(table);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&Ipv4Addr::new(10, 0, 0, 1)], "00:11:22:33:44:01");
        assert_eq!(map[&Ipv4Addr::new(10, 0, 0, 3)], "DE:AD:BE:EF:00:03");
    }

    #[test]
    fn missing_table_is_empty() {
        let resolver = ProcArpResolver::with_path("/nonexistent/arp");
        assert!(resolver.snapshot().is_empty());
    }
}
