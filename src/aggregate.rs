//! Turn a probe batch into per-address liveness records and a summary.
//!
//! Aggregation is a pure function of the segment's addresses, the previously
//! cached records and the probe results. Record timestamps come from the
//! probe results, so identical inputs give identical output.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::debug;

use crate::types::{
    IpAddress, LivenessMap, LivenessRecord, LivenessStatus, ProbeResult, ScanSummary,
};

/// What is known about an address that did not answer.
#[derive(Debug, Clone, Copy)]
pub struct SilentAddress<'a> {
    pub address: &'a IpAddress,
    pub previous: Option<&'a LivenessRecord>,
    pub observed_mac: Option<&'a str>,
}

/// Decides whether a silent address is `blocked` (filtering probes but in
/// use) rather than `offline`. Only consulted for addresses with a prior
/// record; a silent address never seen before is always `unknown`.
pub type BlockedPolicy = fn(&SilentAddress<'_>) -> bool;

/// Default policy: an administratively assigned address whose MAC is
/// resolvable now, or was on record, is filtering rather than down.
pub fn mac_seen_while_assigned(silent: &SilentAddress<'_>) -> bool {
    silent.address.status.is_assigned()
        && (silent.observed_mac.is_some()
            || silent.previous.and_then(|p| p.mac.as_ref()).is_some())
}

/// Policy that never reports `blocked`.
pub fn never_blocked(_: &SilentAddress<'_>) -> bool {
    false
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub records: LivenessMap,
    pub summary: ScanSummary,
}

pub fn aggregate(
    addresses: &[IpAddress],
    previous: &LivenessMap,
    results: &[ProbeResult],
    policy: BlockedPolicy,
) -> Aggregation {
    let by_ip: HashMap<Ipv4Addr, &ProbeResult> = results.iter().map(|r| (r.address, r)).collect();
    let mut records = LivenessMap::new();

    for address in addresses {
        let Some(result) = address.ipv4().and_then(|ip| by_ip.get(&ip)) else {
            debug!(address = %address.address, "no probe result, skipped");
            continue;
        };
        let prev = previous.get(&address.address);
        let record = if result.alive {
            online_record(address, prev, result)
        } else {
            silent_record(address, prev, result, policy)
        };
        records.insert(address.address.clone(), record);
    }

    let summary = summarize(&records);
    Aggregation { records, summary }
}

fn online_record(
    address: &IpAddress,
    prev: Option<&LivenessRecord>,
    result: &ProbeResult,
) -> LivenessRecord {
    let known_mac = prev.and_then(|p| p.mac.clone());
    let conflict = matches!(
        (&result.mac, &known_mac),
        (Some(seen), Some(known)) if seen != known
    );
    let previous_mac = if conflict {
        known_mac.clone()
    } else {
        prev.and_then(|p| p.previous_mac.clone())
    };
    LivenessRecord {
        address: address.address.clone(),
        status: LivenessStatus::Online,
        response_time_ms: result.rtt_ms,
        mac: result.mac.clone().or(known_mac),
        previous_mac,
        conflict,
        updated_at: result.timestamp.clone(),
    }
}

fn silent_record(
    address: &IpAddress,
    prev: Option<&LivenessRecord>,
    result: &ProbeResult,
    policy: BlockedPolicy,
) -> LivenessRecord {
    let silent = SilentAddress {
        address,
        previous: prev,
        observed_mac: result.mac.as_deref(),
    };
    let status = if prev.is_none() {
        LivenessStatus::Unknown
    } else if policy(&silent) {
        LivenessStatus::Blocked
    } else {
        LivenessStatus::Offline
    };
    LivenessRecord {
        address: address.address.clone(),
        status,
        response_time_ms: None,
        mac: result.mac.clone().or_else(|| prev.and_then(|p| p.mac.clone())),
        previous_mac: prev.and_then(|p| p.previous_mac.clone()),
        conflict: false,
        updated_at: result.timestamp.clone(),
    }
}

/// Counters over a set of records. `offline` includes `unknown`.
pub fn summarize(records: &LivenessMap) -> ScanSummary {
    let mut summary = ScanSummary::default();
    let mut rtt_sum = 0u64;
    let mut rtt_count = 0u64;
    for record in records.values() {
        summary.total += 1;
        match record.status {
            LivenessStatus::Online => summary.online += 1,
            LivenessStatus::Blocked => summary.blocked += 1,
            LivenessStatus::Offline => summary.offline += 1,
            LivenessStatus::Unknown => {
                summary.unknown += 1;
                summary.offline += 1;
            }
        }
        if record.conflict {
            summary.conflicts += 1;
        }
        if let Some(rtt) = record.response_time_ms {
            rtt_sum += rtt;
            rtt_count += 1;
        }
    }
    if rtt_count > 0 {
        let avg = rtt_sum as f64 / rtt_count as f64;
        summary.avg_response_time = Some((avg * 100.0).round() / 100.0);
    }
    summary
}
