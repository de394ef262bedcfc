use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

pub type SegmentId = i64;
pub type AddressId = i64;

/// A managed subnet. The CIDR is fixed once the segment exists.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: SegmentId,
    pub name: String,
    pub cidr: String,
    pub vlan_id: Option<u16>,
    pub gateway: Option<String>,
    pub dns_primary: Option<String>,
    pub dns_secondary: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub created_at: String,
}

/// Fields accepted when creating a segment.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct NewSegment {
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub vlan_id: Option<u16>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns_primary: Option<String>,
    #[serde(default)]
    pub dns_secondary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Usage counters computed over a segment's address pool.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage_percent: f64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SegmentWithStats {
    #[serde(flatten)]
    pub segment: Segment,
    pub stats: SegmentStats,
}

/// Administrative allocation state of an address.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AddressStatus {
    Free,
    InUse,
    Reserved,
    Blocked,
    Gateway,
}

impl AddressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::InUse => "in_use",
            Self::Reserved => "reserved",
            Self::Blocked => "blocked",
            Self::Gateway => "gateway",
        }
    }

    /// Addresses an operator has handed out or pinned.
    pub fn is_assigned(&self) -> bool {
        matches!(self, Self::InUse | Self::Reserved | Self::Gateway)
    }
}

impl fmt::Display for AddressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "in_use" => Ok(Self::InUse),
            "reserved" => Ok(Self::Reserved),
            "blocked" => Ok(Self::Blocked),
            "gateway" => Ok(Self::Gateway),
            other => Err(format!("unknown address status: {other}")),
        }
    }
}

/// One row of a segment's address pool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IpAddress {
    pub id: AddressId,
    pub address: String,
    pub segment_id: SegmentId,
    pub status: AddressStatus,
    pub device_id: Option<i64>,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub notes: Option<String>,
}

impl IpAddress {
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.address.parse().ok()
    }
}

/// Raw outcome of probing one address. Never persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub address: Ipv4Addr,
    pub alive: bool,
    pub rtt_ms: Option<u64>,
    pub mac: Option<String>,
    pub timestamp: String,
}

/// Observed liveness of an address.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStatus {
    Online,
    Offline,
    Blocked,
    Unknown,
}

impl LivenessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Blocked => "blocked",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for LivenessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "blocked" => Ok(Self::Blocked),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown liveness status: {other}")),
        }
    }
}

/// Latest observed status of one address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LivenessRecord {
    pub address: String,
    pub status: LivenessStatus,
    pub response_time_ms: Option<u64>,
    pub mac: Option<String>,
    pub previous_mac: Option<String>,
    pub conflict: bool,
    pub updated_at: String,
}

/// Records keyed by dotted-quad address.
pub type LivenessMap = BTreeMap<String, LivenessRecord>;

/// Counters for one evaluated cycle.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub online: u64,
    /// Every address that did not reply and is not blocked, `unknown` included.
    pub offline: u64,
    pub blocked: u64,
    pub unknown: u64,
    pub conflicts: u64,
    pub total: u64,
    pub avg_response_time: Option<f64>,
}

/// Outcome of one probe → aggregate → commit cycle.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub segment_id: SegmentId,
    pub results: LivenessMap,
    pub summary: ScanSummary,
}

/// A host that answered during a subnet sweep.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SweepHit {
    pub ip: String,
    pub latency_ms: u64,
    pub mac: Option<String>,
}

/// Current UTC time as RFC 3339.
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
