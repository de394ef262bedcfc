#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lan_ipam_rs::address_space::AddressSpace;
use lan_ipam_rs::arp::MacResolver;
use lan_ipam_rs::cache::StatusCache;
use lan_ipam_rs::db::Database;
use lan_ipam_rs::engine::LivenessEngine;
use lan_ipam_rs::scanner::{ProbeOptions, ProbeOutcome, Prober};

/// Answers listed addresses with a fixed RTT after `delay`; the rest stay
/// silent until the batch timeout.
pub struct FakeProber {
    replies: Mutex<HashMap<Ipv4Addr, u64>>,
    delay: Duration,
    denied: AtomicBool,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl FakeProber {
    pub fn new(delay: Duration) -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            delay,
            denied: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn reply(&self, ip: &str, rtt_ms: u64) {
        self.replies.lock().unwrap().insert(ip.parse().unwrap(), rtt_ms);
    }

    /// Every probe fails as if the process lacked the privilege to send it.
    pub fn deny_all(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    pub fn silence(&self, ip: &str) {
        self.replies.lock().unwrap().remove(&ip.parse::<Ipv4Addr>().unwrap());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        if self.denied.load(Ordering::SeqCst) {
            return ProbeOutcome::PermissionDenied("operation not permitted".into());
        }

        let rtt = self.replies.lock().unwrap().get(&ip).copied();
        match rtt {
            Some(ms) => {
                tokio::time::sleep(self.delay).await;
                ProbeOutcome::Reply {
                    rtt: Duration::from_millis(ms),
                }
            }
            None => {
                tokio::time::sleep(timeout.min(self.delay)).await;
                ProbeOutcome::Timeout
            }
        }
    }
}

/// Neighbour table whose contents tests can change between cycles.
#[derive(Default)]
pub struct FakeNeighbors {
    table: Mutex<HashMap<Ipv4Addr, String>>,
}

impl FakeNeighbors {
    pub fn set(&self, ip: &str, mac: &str) {
        self.table
            .lock()
            .unwrap()
            .insert(ip.parse().unwrap(), mac.to_string());
    }
}

impl MacResolver for FakeNeighbors {
    fn snapshot(&self) -> HashMap<Ipv4Addr, String> {
        self.table.lock().unwrap().clone()
    }
}

pub struct Harness {
    pub db: Database,
    pub engine: Arc<LivenessEngine>,
    pub prober: Arc<FakeProber>,
    pub neighbors: Arc<FakeNeighbors>,
}

pub fn harness(delay: Duration) -> Harness {
    let db = Database::open_in_memory().unwrap();
    let space = AddressSpace::new(db.clone());
    let cache = Arc::new(StatusCache::open(db.clone()).unwrap());
    let prober = Arc::new(FakeProber::new(delay));
    let neighbors = Arc::new(FakeNeighbors::default());
    let engine = Arc::new(LivenessEngine::new(
        space,
        cache,
        prober.clone(),
        neighbors.clone(),
        ProbeOptions {
            timeout: Duration::from_millis(1000),
            concurrency: 254,
        },
    ));
    Harness {
        db,
        engine,
        prober,
        neighbors,
    }
}
