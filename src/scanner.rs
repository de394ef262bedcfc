use crate::arp::MacResolver;
use crate::error::{Error, Result};
use crate::netdetect::usable_hosts;
use crate::types::{now_rfc3339, ProbeResult, SweepHit};
use async_trait::async_trait;
use futures::future::select_ok;
use ipnet::Ipv4Net;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, SurgeError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// Outcome of a single reachability attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reply { rtt: Duration },
    Timeout,
    /// The host could not be reached; expected and absorbed as "not alive".
    Unreachable(String),
    /// The process lacks the privilege to send probes at all.
    PermissionDenied(String),
}

/// One way of asking "is this address alive?".
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> ProbeOutcome;
}

/// ICMP echo prober on a shared raw/datagram socket.
pub struct IcmpProber {
    client: Client,
    ident: AtomicU16,
}

impl IcmpProber {
    /// Open the ICMP socket. Lack of privilege surfaces here, once, as
    /// [`Error::ProbeUnavailable`].
    pub fn new() -> Result<Self> {
        let client = Client::new(&Config::default()).map_err(|e| {
            Error::ProbeUnavailable(format!(
                "cannot open ICMP socket ({e}); run with CAP_NET_RAW, widen \
                 net.ipv4.ping_group_range or use the tcp probe method"
            ))
        })?;
        Ok(Self {
            client,
            ident: AtomicU16::new(std::process::id() as u16),
        })
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> ProbeOutcome {
        let ident = PingIdentifier(self.ident.fetch_add(1, Ordering::Relaxed));
        let mut pinger = self.client.pinger(IpAddr::V4(ip), ident).await;
        pinger.timeout(timeout);
        let payload = [0u8; 56];
        match pinger.ping(PingSequence(0), &payload).await {
            Ok((_packet, rtt)) => ProbeOutcome::Reply { rtt },
            Err(SurgeError::Timeout { .. }) => ProbeOutcome::Timeout,
            Err(SurgeError::IOError(e)) => io_outcome(&e),
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        }
    }
}

/// TCP connect prober. A completed handshake or an active refusal both prove
/// that something answers at the address.
pub struct TcpProber {
    ports: Vec<u16>,
}

impl TcpProber {
    pub fn new(ports: Vec<u16>) -> Self {
        let ports = if ports.is_empty() { vec![80] } else { ports };
        Self { ports }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        let attempts = self.ports.iter().map(|&port| {
            let addr = SocketAddr::new(IpAddr::V4(ip), port);
            Box::pin(async move {
                match time::timeout(timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(_stream)) => Ok(()),
                    Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(()),
                    Ok(Err(e)) => Err(io_outcome(&e)),
                    Err(_) => Err(ProbeOutcome::Timeout),
                }
            })
        });
        match select_ok(attempts).await {
            Ok(((), _rest)) => ProbeOutcome::Reply {
                rtt: start.elapsed(),
            },
            Err(last) => last,
        }
    }
}

fn io_outcome(e: &io::Error) -> ProbeOutcome {
    match e.kind() {
        io::ErrorKind::PermissionDenied => ProbeOutcome::PermissionDenied(e.to_string()),
        _ => ProbeOutcome::Unreachable(e.to_string()),
    }
}

/// Batch tuning.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    /// Hard per-probe timeout.
    pub timeout: Duration,
    /// Upper bound on in-flight probes.
    pub concurrency: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            concurrency: 254,
        }
    }
}

/// Probe every address concurrently and return one result per address.
///
/// - Each probe runs in its own task under `tokio::time::timeout`, so a batch
///   takes roughly one timeout, not the sum.
/// - Results flow through a single `mpsc` consumer; order is not preserved.
/// - Timeouts and transport failures become `alive: false`. Only a batch in
///   which every probe was denied permission fails, with
///   [`Error::ProbeUnavailable`].
/// - MACs are attached from one neighbour-table snapshot taken after the
///   batch, when replies have populated it.
pub async fn probe_batch(
    prober: Arc<dyn Prober>,
    resolver: &dyn MacResolver,
    addresses: &[Ipv4Addr],
    opts: ProbeOptions,
) -> Result<Vec<ProbeResult>> {
    if addresses.is_empty() {
        return Ok(Vec::new());
    }
    let sem = Arc::new(Semaphore::new(opts.concurrency.clamp(1, 5_000)));
    let (tx, mut rx) = mpsc::channel::<(Ipv4Addr, ProbeOutcome)>(addresses.len());
    let mut set = JoinSet::new();

    for &ip in addresses {
        let sem = sem.clone();
        let tx = tx.clone();
        let prober = prober.clone();
        let timeout = opts.timeout;
        set.spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return;
            };
            let outcome = match time::timeout(timeout, prober.probe(ip, timeout)).await {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::Timeout,
            };
            let _ = tx.send((ip, outcome)).await;
        });
    }
    drop(tx);

    let mut outcomes = Vec::with_capacity(addresses.len());
    while let Some(item) = rx.recv().await {
        outcomes.push(item);
    }
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "probe task failed");
        }
    }

    let denied = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, ProbeOutcome::PermissionDenied(_)))
        .count();
    if denied == addresses.len() {
        let reason = outcomes
            .iter()
            .find_map(|(_, o)| match o {
                ProbeOutcome::PermissionDenied(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap_or_default();
        return Err(Error::ProbeUnavailable(reason));
    }

    let macs = resolver.snapshot();
    let timestamp = now_rfc3339();
    let mut results: Vec<ProbeResult> = outcomes
        .into_iter()
        .map(|(ip, outcome)| {
            let (alive, rtt_ms) = match outcome {
                ProbeOutcome::Reply { rtt } => (true, Some(rtt.as_millis() as u64)),
                other => {
                    debug!(ip = %ip, outcome = ?other, "no reply");
                    (false, None)
                }
            };
            ProbeResult {
                address: ip,
                alive,
                rtt_ms,
                mac: macs.get(&ip).cloned(),
                timestamp: timestamp.clone(),
            }
        })
        .collect();

    // A panicked task never reported; it still owes a result.
    if results.len() < addresses.len() {
        let seen: std::collections::HashSet<Ipv4Addr> =
            results.iter().map(|r| r.address).collect();
        for &ip in addresses {
            if !seen.contains(&ip) {
                results.push(ProbeResult {
                    address: ip,
                    alive: false,
                    rtt_ms: None,
                    mac: macs.get(&ip).cloned(),
                    timestamp: timestamp.clone(),
                });
            }
        }
    }
    Ok(results)
}

/// Probe `.1`–`.254` of a /24 and return only the hosts that replied,
/// sorted by address. Used to seed a segment's known hosts.
pub async fn sweep_subnet(
    prober: Arc<dyn Prober>,
    resolver: &dyn MacResolver,
    net: Ipv4Net,
    opts: ProbeOptions,
) -> Result<Vec<SweepHit>> {
    let targets: Vec<Ipv4Addr> = usable_hosts(net).collect();
    let mut alive: Vec<ProbeResult> = probe_batch(prober, resolver, &targets, opts)
        .await?
        .into_iter()
        .filter(|r| r.alive)
        .collect();
    alive.sort_by_key(|r| r.address);
    Ok(alive
        .into_iter()
        .map(|r| SweepHit {
            ip: r.address.to_string(),
            latency_ms: r.rtt_ms.unwrap_or_default(),
            mac: r.mac,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arp::NoMacResolver;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// Replies for the listed addresses after their delay; everything else hangs.
    struct ScriptedProber {
        replies: HashMap<Ipv4Addr, Duration>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedProber {
        fn new(replies: &[(Ipv4Addr, u64)]) -> Self {
            Self {
                replies: replies
                    .iter()
                    .map(|&(ip, ms)| (ip, Duration::from_millis(ms)))
                    .collect(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, ip: Ipv4Addr, _timeout: Duration) -> ProbeOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let outcome = match self.replies.get(&ip) {
                Some(&delay) => {
                    time::sleep(delay).await;
                    ProbeOutcome::Reply { rtt: delay }
                }
                None => {
                    time::sleep(Duration::from_secs(3600)).await;
                    ProbeOutcome::Timeout
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    struct DeniedProber;

    #[async_trait]
    impl Prober for DeniedProber {
        async fn probe(&self, _ip: Ipv4Addr, _timeout: Duration) -> ProbeOutcome {
            ProbeOutcome::PermissionDenied("operation not permitted".into())
        }
    }

    fn hosts(n: u8) -> Vec<Ipv4Addr> {
        (1..=n).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect()
    }

    #[tokio::test]
    async fn batch_bounded_by_single_timeout() {
        let addrs = hosts(200);
        let prober = Arc::new(ScriptedProber::new(&[(addrs[0], 5), (addrs[99], 10)]));
        let opts = ProbeOptions {
            timeout: Duration::from_millis(200),
            concurrency: 254,
        };
        let start = Instant::now();
        let results = probe_batch(prober.clone(), &NoMacResolver, &addrs, opts)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(results.len(), 200);
        assert_eq!(results.iter().filter(|r| r.alive).count(), 2);
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
        assert!(prober.peak.load(Ordering::SeqCst) > 100);
    }

    #[tokio::test]
    async fn concurrency_limit_respected() {
        let addrs = hosts(40);
        let replies: Vec<(Ipv4Addr, u64)> = addrs.iter().map(|&ip| (ip, 20)).collect();
        let prober = Arc::new(ScriptedProber::new(&replies));
        let opts = ProbeOptions {
            timeout: Duration::from_millis(500),
            concurrency: 8,
        };
        let results = probe_batch(prober.clone(), &NoMacResolver, &addrs, opts)
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.alive));
        assert!(prober.peak.load(Ordering::SeqCst) <= 8);
    }

    #[tokio::test]
    async fn systemic_permission_failure_surfaces() {
        let err = probe_batch(
            Arc::new(DeniedProber),
            &NoMacResolver,
            &hosts(4),
            ProbeOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ProbeUnavailable(_)));
    }

    #[tokio::test]
    async fn sweep_returns_only_replying_hosts_sorted() {
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let prober = Arc::new(ScriptedProber::new(&[
            (Ipv4Addr::new(10, 0, 0, 200), 1),
            (Ipv4Addr::new(10, 0, 0, 7), 3),
        ]));
        let hits = sweep_subnet(
            prober,
            &NoMacResolver,
            net,
            ProbeOptions {
                timeout: Duration::from_millis(100),
                concurrency: 254,
            },
        )
        .await
        .unwrap();
        let ips: Vec<&str> = hits.iter().map(|h| h.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.7", "10.0.0.200"]);
        assert_eq!(hits[0].latency_ms, 3);
    }

    #[tokio::test]
    async fn tcp_refused_counts_as_alive() {
        // Bind then drop to find a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let prober = TcpProber::new(vec![port]);
        let outcome = prober
            .probe(Ipv4Addr::LOCALHOST, Duration::from_millis(500))
            .await;
        assert!(matches!(outcome, ProbeOutcome::Reply { .. }), "{outcome:?}");
    }

    #[tokio::test]
    async fn tcp_open_port_counts_as_alive() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = TcpProber::new(vec![port]);
        let outcome = prober
            .probe(Ipv4Addr::LOCALHOST, Duration::from_millis(500))
            .await;
        assert!(matches!(outcome, ProbeOutcome::Reply { .. }));
    }
}
