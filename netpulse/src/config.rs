//! Configuration loading and validation. All probe settings are passed in
//! at construction; nothing reads configuration from global state.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ip_check::Provider;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub log_level: String,

    // Job intervals
    pub ip_check_interval_secs: u64,
    pub trace_interval_secs: u64,
    pub ping_sweep_interval_secs: u64,
    pub port_scan_interval_secs: u64,

    // Public IP consensus
    pub ip_providers: Vec<Provider>,
    pub ip_timeout_secs: u64,

    // Traceroute
    pub trace_targets: Vec<String>,
    pub trace_max_hops: u32,
    pub trace_hop_wait_secs: u64,

    // Ping sweep; an empty subnet disables the job
    pub sweep_subnet: String,
    pub sweep_concurrency: usize,
    pub sweep_timeout_ms: u64,

    // Port scan
    pub scan_ports: Vec<u16>,
    pub scan_concurrency: usize,
    pub scan_host_concurrency: usize,
    pub scan_timeout_ms: u64,

    // DNS monitor
    pub dns_check_interval_secs: u64,
    pub dns_probe_hostname: String,
    pub dns_query_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Config {
            data_dir: home.join(".netpulse"),
            log_level: "info".into(),

            ip_check_interval_secs: 300,
            trace_interval_secs: 900,
            ping_sweep_interval_secs: 1800,
            port_scan_interval_secs: 3600,

            ip_providers: ip_check::default_providers(),
            ip_timeout_secs: 10,

            trace_targets: vec!["8.8.8.8".into(), "1.1.1.1".into(), "185.97.0.1".into()],
            trace_max_hops: 30,
            trace_hop_wait_secs: 2,

            sweep_subnet: "192.168.1.0/24".into(),
            sweep_concurrency: 50,
            sweep_timeout_ms: 2000,

            scan_ports: port_scan::default_ports(),
            scan_concurrency: 20,
            scan_host_concurrency: 5,
            scan_timeout_ms: 3000,

            dns_check_interval_secs: 60,
            dns_probe_hostname: "google.com".into(),
            dns_query_timeout_ms: 2000,
        }
    }
}

impl Config {
    /// Load configuration. An explicit path must exist and parse; otherwise
    /// `./netpulse.yaml` and `<data_dir>/config.yaml` are tried in order,
    /// falling back to the defaults. Fields absent from the file keep their
    /// default values.
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        let defaults = Config::default();
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let local = Path::new("netpulse.yaml");
                let home = defaults.data_dir.join("config.yaml");
                if local.exists() {
                    Some(local.to_path_buf())
                } else if home.exists() {
                    Some(home)
                } else {
                    None
                }
            }
        };

        let cfg: Config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", p.display()))?
            }
            None => defaults,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Synchronous validation of everything that would otherwise only fail
    /// deep inside a probe at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.ip_providers.is_empty() {
            bail!("ip_providers must not be empty");
        }
        for provider in &self.ip_providers {
            url::Url::parse(&provider.url)
                .with_context(|| format!("provider {} has an invalid url", provider.name))?;
        }
        if !self.sweep_subnet.is_empty() {
            self.sweep_subnet
                .parse::<ipnet::IpNet>()
                .with_context(|| format!("invalid sweep_subnet {:?}", self.sweep_subnet))?;
        }
        if self.scan_ports.iter().any(|&p| p == 0) {
            bail!("scan_ports must not contain 0");
        }
        if self.dns_probe_hostname.is_empty() {
            bail!("dns_probe_hostname must not be empty");
        }
        Ok(())
    }
}
