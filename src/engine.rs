//! One scan cycle: addresses → probe batch → aggregation → cache commit.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use ipnet::Ipv4Net;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::address_space::AddressSpace;
use crate::aggregate::{aggregate, mac_seen_while_assigned, Aggregation, BlockedPolicy};
use crate::arp::MacResolver;
use crate::cache::StatusCache;
use crate::error::Result;
use crate::scanner::{probe_batch, sweep_subnet, ProbeOptions, Prober};
use crate::types::{CycleReport, LivenessMap, LivenessStatus, SegmentId, SweepHit};

/// Held for the whole of a segment's cycle. Dropping it ends the cycle.
pub type CycleGuard = OwnedMutexGuard<()>;

pub struct LivenessEngine {
    space: AddressSpace,
    cache: Arc<StatusCache>,
    prober: Arc<dyn Prober>,
    resolver: Arc<dyn MacResolver>,
    opts: ProbeOptions,
    policy: BlockedPolicy,
    cycles: Mutex<HashMap<SegmentId, Arc<AsyncMutex<()>>>>,
}

impl LivenessEngine {
    pub fn new(
        space: AddressSpace,
        cache: Arc<StatusCache>,
        prober: Arc<dyn Prober>,
        resolver: Arc<dyn MacResolver>,
        opts: ProbeOptions,
    ) -> Self {
        Self {
            space,
            cache,
            prober,
            resolver,
            opts,
            policy: mac_seen_while_assigned,
            cycles: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_blocked_policy(mut self, policy: BlockedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn cache(&self) -> &StatusCache {
        &self.cache
    }

    pub fn probe_options(&self) -> ProbeOptions {
        self.opts
    }

    fn cycle_slot(&self, segment_id: SegmentId) -> Arc<AsyncMutex<()>> {
        self.cycles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(segment_id)
            .or_default()
            .clone()
    }

    /// Claim the segment's cycle slot, or `None` if a cycle is in flight.
    pub fn try_begin_cycle(&self, segment_id: SegmentId) -> Option<CycleGuard> {
        self.cycle_slot(segment_id).try_lock_owned().ok()
    }

    /// Claim the segment's cycle slot, waiting for an in-flight cycle to end.
    pub async fn begin_cycle(&self, segment_id: SegmentId) -> CycleGuard {
        self.cycle_slot(segment_id).lock_owned().await
    }

    /// Probe the segment and aggregate against the cached state, without
    /// committing. The caller proves it owns the cycle slot.
    pub async fn evaluate(&self, segment_id: SegmentId, _cycle: &CycleGuard) -> Result<Aggregation> {
        let addresses = self.space.segment_addresses(segment_id)?;
        let targets: Vec<Ipv4Addr> = addresses.iter().filter_map(|a| a.ipv4()).collect();
        let previous = self.cache.latest_for_segment(segment_id);
        let results =
            probe_batch(self.prober.clone(), self.resolver.as_ref(), &targets, self.opts).await?;
        Ok(aggregate(&addresses, &previous, &results, self.policy))
    }

    /// Write a cycle's records to the cache. Addresses that have never
    /// answered (`unknown`) get no record.
    pub fn commit(&self, segment_id: SegmentId, aggregation: &Aggregation) -> Result<()> {
        let records: LivenessMap = aggregation
            .records
            .iter()
            .filter(|(_, r)| r.status != LivenessStatus::Unknown)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.cache.put(segment_id, records)
    }

    /// Run one full cycle for `segment_id`, waiting for any in-flight one.
    pub async fn run_cycle(&self, segment_id: SegmentId) -> Result<CycleReport> {
        let cycle = self.begin_cycle(segment_id).await;
        let aggregation = self.evaluate(segment_id, &cycle).await?;
        if let Err(e) = self.commit(segment_id, &aggregation) {
            warn!(segment_id, error = %e, "cycle result not cached");
            return Err(e);
        }
        let summary = aggregation.summary.clone();
        info!(
            segment_id,
            online = summary.online,
            offline = summary.offline,
            blocked = summary.blocked,
            conflicts = summary.conflicts,
            "cycle complete"
        );
        Ok(CycleReport {
            segment_id,
            results: aggregation.records,
            summary,
        })
    }

    /// Drop per-segment bookkeeping for a deleted segment.
    pub fn forget(&self, segment_id: SegmentId) {
        self.cycles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&segment_id);
        self.cache.evict(segment_id);
    }

    /// Isolated /24 sweep with its own timing, independent of any segment.
    pub async fn sweep(&self, net: Ipv4Net, opts: ProbeOptions) -> Result<Vec<SweepHit>> {
        sweep_subnet(self.prober.clone(), self.resolver.as_ref(), net, opts).await
    }
}
