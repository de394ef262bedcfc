use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use lan_ipam_rs::address_space::AddressSpace;
use lan_ipam_rs::arp::{MacResolver, ProcArpResolver};
use lan_ipam_rs::cache::StatusCache;
use lan_ipam_rs::config::{self, AppConfig, ProbeMethod};
use lan_ipam_rs::db::Database;
use lan_ipam_rs::engine::LivenessEngine;
use lan_ipam_rs::netdetect;
use lan_ipam_rs::scanner::{sweep_subnet, IcmpProber, Prober, TcpProber};
use lan_ipam_rs::scheduler::PollingScheduler;
use lan_ipam_rs::server::{self, AppState};
use lan_ipam_rs::types::SweepHit;

/// lan-ipam-rs: subnet address manager with continuous liveness monitoring.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "lan-ipam-rs",
    version,
    about = "Subnet address manager with continuous liveness monitoring and MAC conflict detection.",
    long_about = None
)]
struct Cli {
    /// Config file (extension optional).
    #[arg(short, long, default_value = "lan-ipam")]
    config: String,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    bind: Option<String>,

    /// SQLite database path (overrides config).
    #[arg(long)]
    database: Option<PathBuf>,

    /// Probe method: icmp or tcp (overrides config).
    #[arg(long = "probe-method")]
    probe_method: Option<String>,

    /// Per-probe timeout in milliseconds (overrides config).
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Segment id to start polling immediately.
    #[arg(long)]
    segment: Option<i64>,

    /// Sweep a /24 given as its first three octets (e.g. 192.168.1) and exit.
    /// Without a value, sweeps every locally attached /24.
    #[arg(long, num_args = 0..=1, default_missing_value = "auto")]
    sweep: Option<String>,

    /// Write sweep results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let cfg = resolve_config(&cli)?;

    info!(
        bind = %cfg.bind,
        database = %cfg.database,
        method = ?cfg.probe.method,
        timeout_ms = cfg.probe.timeout_ms,
        concurrency = cfg.probe.concurrency,
        "lan-ipam-rs configuration"
    );

    let prober: Arc<dyn Prober> = match cfg.probe.method {
        ProbeMethod::Icmp => Arc::new(IcmpProber::new()?),
        ProbeMethod::Tcp => Arc::new(TcpProber::new(cfg.probe.tcp_ports.clone())),
    };

    let resolver = Arc::new(ProcArpResolver::new());

    // A sweep touches neither the database nor the status cache.
    if let Some(prefix) = cli.sweep.as_deref() {
        return run_sweep(prober, resolver.as_ref(), &cfg, prefix, cli.output.as_deref()).await;
    }

    let db = Database::open(&cfg.database)?;
    let space = AddressSpace::new(db.clone()).with_host_limit(cfg.max_segment_hosts);
    let cache = Arc::new(StatusCache::open(db)?);
    let engine = Arc::new(LivenessEngine::new(
        space,
        cache,
        prober,
        resolver,
        cfg.probe.options(),
    ));

    let scheduler = PollingScheduler::new(
        engine.clone(),
        Duration::from_millis(cfg.scheduler.error_backoff_ms),
    );
    if let Some(segment_id) = cli.segment.or(cfg.scheduler.autostart_segment) {
        if let Err(e) = scheduler.start(segment_id).await {
            warn!(segment_id, error = %e, "could not start polling");
        }
    }

    let state = AppState {
        engine,
        scheduler: scheduler.clone(),
        sweep: cfg.sweep.options(cfg.probe.concurrency),
    };
    let bind = cfg.bind.clone();
    let server_task = tokio::spawn(async move { server::spawn_server(&bind, state).await });

    tokio::select! {
        res = server_task => {
            match res {
                Ok(Err(e)) => warn!(error = %e, "HTTP server error"),
                Err(e) => warn!(error = %e, "HTTP server task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    scheduler.shutdown().await;
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut cfg = config::load(&cli.config)?;
    if let Some(bind) = &cli.bind {
        cfg.bind = bind.clone();
    }
    if let Some(db) = &cli.database {
        cfg.database = db.display().to_string();
    }
    if let Some(method) = cli.probe_method.as_deref() {
        cfg.probe.method = match method.to_lowercase().as_str() {
            "icmp" => ProbeMethod::Icmp,
            "tcp" => ProbeMethod::Tcp,
            other => anyhow::bail!("Invalid probe method: {other}. Choose: icmp, tcp"),
        };
    }
    if let Some(ms) = cli.timeout_ms {
        cfg.probe.timeout_ms = ms;
    }
    Ok(cfg)
}

async fn run_sweep(
    prober: Arc<dyn Prober>,
    resolver: &dyn MacResolver,
    cfg: &AppConfig,
    prefix: &str,
    output: Option<&std::path::Path>,
) -> Result<()> {
    let nets = if prefix == "auto" {
        let detected = netdetect::detect_local_cidrs()?;
        if detected.is_empty() {
            anyhow::bail!("no local IPv4 networks detected; pass --sweep a.b.c");
        }
        detected
    } else {
        vec![netdetect::parse_sweep_prefix(prefix)?]
    };

    let opts = cfg.sweep.options(cfg.probe.concurrency);
    let mut hits = Vec::new();
    for net in nets {
        info!(network = %net, timeout_ms = cfg.sweep.timeout_ms, "sweeping");
        hits.extend(sweep_subnet(prober.clone(), resolver, net, opts).await?);
    }
    print_hits_table(&hits);

    if let Some(path) = output {
        match write_hits_json(path, &hits) {
            Ok(()) => println!("Wrote JSON results to {}", path.display()),
            Err(e) => eprintln!("Failed to write JSON to {}: {}", path.display(), e),
        }
    }
    Ok(())
}

fn print_hits_table(hits: &[SweepHit]) {
    let mut ip_w = "ip".len();
    for h in hits {
        ip_w = ip_w.max(h.ip.len());
    }
    let lat_w = "latency_ms".len();
    let mac_w = 17usize;

    println!("\nHosts up: {}", hits.len());
    println!(
        "{:<ip_w$}  {:>lat_w$}  {:<mac_w$}",
        "ip",
        "latency_ms",
        "mac",
        ip_w = ip_w,
        lat_w = lat_w,
        mac_w = mac_w
    );
    println!(
        "{:-<ip_w$}  {:-<lat_w$}  {:-<mac_w$}",
        "",
        "",
        "",
        ip_w = ip_w,
        lat_w = lat_w,
        mac_w = mac_w
    );
    for h in hits {
        println!(
            "{:<ip_w$}  {:>lat_w$}  {:<mac_w$}",
            h.ip,
            h.latency_ms,
            h.mac.as_deref().unwrap_or("-"),
            ip_w = ip_w,
            lat_w = lat_w,
            mac_w = mac_w
        );
    }
}

fn write_hits_json(path: &std::path::Path, hits: &[SweepHit]) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, hits)?;
    Ok(())
}
