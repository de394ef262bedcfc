//! Layered configuration.
//!
//! Loaded from an optional TOML file (default `lan-ipam.toml`) and
//! `LAN_IPAM__` environment variables, e.g. `LAN_IPAM__PROBE__TIMEOUT_MS=500`.

use std::time::Duration;

use serde::Deserialize;

use crate::scanner::ProbeOptions;
use crate::types::SegmentId;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listen address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// SQLite database path.
    #[serde(default = "default_database")]
    pub database: String,

    /// Largest address pool a segment may have.
    #[serde(default = "default_max_segment_hosts")]
    pub max_segment_hosts: u64,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub sweep: SweepConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    /// ICMP echo; needs CAP_NET_RAW or an unprivileged ping group.
    #[default]
    Icmp,
    /// TCP connect to `tcp_ports`; needs no privilege.
    Tcp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub method: ProbeMethod,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_tcp_ports")]
    pub tcp_ports: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Pause after a failed cycle before retrying.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_ms: u64,
    /// Segment to start polling at launch.
    #[serde(default)]
    pub autostart_segment: Option<SegmentId>,
}

impl ProbeConfig {
    pub fn options(&self) -> ProbeOptions {
        ProbeOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            concurrency: self.concurrency,
        }
    }
}

impl SweepConfig {
    pub fn options(&self, concurrency: usize) -> ProbeOptions {
        ProbeOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            concurrency,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_database() -> String {
    "lan-ipam.db".to_string()
}

fn default_max_segment_hosts() -> u64 {
    65_534
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_concurrency() -> usize {
    254
}

fn default_tcp_ports() -> Vec<u16> {
    vec![22, 80, 443, 445, 3389]
}

fn default_sweep_timeout() -> u64 {
    300
}

fn default_error_backoff() -> u64 {
    1000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            method: ProbeMethod::default(),
            timeout_ms: default_probe_timeout(),
            concurrency: default_concurrency(),
            tcp_ports: default_tcp_ports(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sweep_timeout(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            error_backoff_ms: default_error_backoff(),
            autostart_segment: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            database: default_database(),
            max_segment_hosts: default_max_segment_hosts(),
            probe: ProbeConfig::default(),
            sweep: SweepConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Build the configuration from `file_prefix` (extension optional) and the
/// environment.
pub fn load(file_prefix: &str) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("LAN_IPAM")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("probe.tcp_ports"),
        )
        .build()?
        .try_deserialize()
}
