//! netpulse: a long-running network reachability and composition monitor.

mod config;
mod daemon;
mod jobs;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use netpulse_core::model::DnsMetric;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::daemon::Daemon;

#[derive(Debug, Parser)]
#[command(name = "netpulse", version, about = "Network reachability and composition monitor")]
struct Cli {
    /// Optional config file (YAML). Defaults to ./netpulse.yaml, then
    /// ~/.netpulse/config.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit one-shot results as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the monitoring daemon in the foreground
    Run,
    /// Detect the public IP once, with identity metadata
    Ip,
    /// Trace the path to a target once
    Trace {
        /// Hostname or IP to trace
        target: String,
    },
    /// Sweep a subnet for live hosts once
    Sweep {
        /// CIDR to sweep (defaults to the configured subnet)
        cidr: Option<String>,
    },
    /// Re-check specific hosts, preserving input order
    Ping {
        /// Host IPs to check
        #[arg(required = true)]
        ips: Vec<IpAddr>,
    },
    /// Scan a host for open ports once
    Scan {
        /// Host IP to scan
        host: IpAddr,
        /// Comma-separated ports (defaults to the configured set)
        #[arg(long)]
        ports: Option<String>,
    },
    /// Measure DNS resolution across the default targets once
    Dns,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Root token for one-shot commands, wired to ctrl-c.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let inner = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            inner.cancel();
        }
    });
    cancel
}

fn parse_port_list(spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let port: u16 = part
            .parse()
            .map_err(|_| anyhow!("invalid port: {part}"))?;
        if port == 0 {
            bail!("invalid port: 0");
        }
        ports.push(port);
    }
    if ports.is_empty() {
        bail!("no ports given");
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    init_tracing(&cfg.log_level);

    match cli.command {
        Commands::Run => Daemon::new(cfg)?.run().await,
        Commands::Ip => ip_once(&cfg, cli.json).await,
        Commands::Trace { target } => trace_once(&cfg, &target, cli.json).await,
        Commands::Sweep { cidr } => sweep_once(&cfg, cidr, cli.json).await,
        Commands::Ping { ips } => ping_once(&cfg, &ips, cli.json).await,
        Commands::Scan { host, ports } => scan_once(&cfg, host, ports, cli.json).await,
        Commands::Dns => dns_once(&cfg, cli.json).await,
    }
}

async fn ip_once(cfg: &Config, json: bool) -> Result<()> {
    let cancel = interrupt_token();
    let probe = ip_check::IpCheck::new(
        cfg.ip_providers.clone(),
        Duration::from_secs(cfg.ip_timeout_secs),
    )?;
    let ip = probe.public_ip(&cancel).await?;
    let enricher = ip_check::Enricher::new(Duration::from_secs(cfg.ip_timeout_secs))?;
    let identity = enricher.enrich(&cancel, &ip).await.ok();

    if json {
        let obj = serde_json::json!({ "ip": ip, "identity": identity });
        println!("{}", serde_json::to_string(&obj)?);
    } else {
        match identity {
            Some(id) => println!("{} ({}, {}, {})", ip, id.isp, id.city, id.country),
            None => println!("{ip}"),
        }
    }
    Ok(())
}

async fn trace_once(cfg: &Config, target: &str, json: bool) -> Result<()> {
    let cancel = interrupt_token();
    let tracer = traceroute::Traceroute::new(
        cfg.trace_max_hops,
        Duration::from_secs(cfg.trace_hop_wait_secs),
    );
    let result = tracer.trace(&cancel, target).await?;

    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        println!("trace to {} ({} hops):", result.target, result.hops.len());
        for hop in &result.hops {
            if hop.lost {
                println!("{:>3}  *", hop.hop);
            } else {
                println!(
                    "{:>3}  {:<15}  {:.3} ms",
                    hop.hop,
                    hop.ip.map(|ip| ip.to_string()).unwrap_or_default(),
                    hop.latency_ms.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn sweep_once(cfg: &Config, cidr: Option<String>, json: bool) -> Result<()> {
    let cidr = cidr.unwrap_or_else(|| cfg.sweep_subnet.clone());
    if cidr.is_empty() {
        bail!("no subnet given and none configured");
    }
    let cancel = interrupt_token();
    let sweep = ping_sweep::PingSweep::new(
        cfg.sweep_concurrency,
        Duration::from_millis(cfg.sweep_timeout_ms),
    );
    let mut hosts = sweep.sweep(&cancel, &cidr).await?;
    hosts.retain(|h| h.alive);
    hosts.sort_by_key(|h| h.ip);

    if json {
        for host in &hosts {
            println!("{}", serde_json::to_string(host)?);
        }
    } else {
        println!("live hosts in {} ({}):", cidr, hosts.len());
        for host in &hosts {
            println!(
                "{:<15}  {:<30}  {:.1} ms",
                host.ip.to_string(),
                host.hostname.as_deref().unwrap_or("-"),
                host.latency_ms.unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn ping_once(cfg: &Config, ips: &[IpAddr], json: bool) -> Result<()> {
    let cancel = interrupt_token();
    let sweep = ping_sweep::PingSweep::new(
        cfg.sweep_concurrency,
        Duration::from_millis(cfg.sweep_timeout_ms),
    );
    let hosts = sweep.ping_hosts(&cancel, ips).await;

    if json {
        for host in &hosts {
            println!("{}", serde_json::to_string(host)?);
        }
    } else {
        for host in &hosts {
            if host.alive {
                println!(
                    "{:<15}  alive  {:.1} ms  {}",
                    host.ip.to_string(),
                    host.latency_ms.unwrap_or_default(),
                    host.hostname.as_deref().unwrap_or("-")
                );
            } else {
                println!("{:<15}  down", host.ip.to_string());
            }
        }
    }
    Ok(())
}

async fn scan_once(
    cfg: &Config,
    host: IpAddr,
    ports: Option<String>,
    json: bool,
) -> Result<()> {
    let ports = match ports {
        Some(spec) => parse_port_list(&spec)?,
        None => cfg.scan_ports.clone(),
    };
    let scanned = ports.len();
    let cancel = interrupt_token();
    let scanner = port_scan::PortScan::new(
        cfg.scan_concurrency,
        cfg.scan_host_concurrency,
        Duration::from_millis(cfg.scan_timeout_ms),
        ports,
    );
    let mut open = scanner.scan_host(&cancel, host).await;
    open.sort_by_key(|p| p.port);

    if json {
        for port in &open {
            println!("{}", serde_json::to_string(port)?);
        }
    } else if open.is_empty() {
        println!("{host}: no open ports found ({scanned} scanned)");
    } else {
        println!("{host}: {} open ports ({scanned} scanned)", open.len());
        for port in &open {
            let banner = port.banner.replace(['\r', '\n'], " ");
            println!("{:>5}/{}  {:<14}  {}", port.port, port.protocol, port.service, banner.trim());
        }
    }
    Ok(())
}

async fn dns_once(cfg: &Config, json: bool) -> Result<()> {
    let cancel = interrupt_token();
    let monitor = dns_monitor::DnsMonitor::new(
        Duration::from_secs(cfg.dns_check_interval_secs),
        cfg.dns_probe_hostname.clone(),
        Duration::from_millis(cfg.dns_query_timeout_ms),
    )?;

    let collected: Arc<Mutex<Vec<DnsMetric>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_collected = collected.clone();
    let provider: dns_monitor::TargetProvider = Arc::new(Vec::new);
    let sink: dns_monitor::MetricSink =
        Arc::new(move |metric| sink_collected.lock().unwrap().push(metric));
    monitor.check_once(&cancel, &provider, &sink).await;

    let mut metrics = collected.lock().unwrap().clone();
    metrics.sort_by(|a, b| a.server.cmp(&b.server).then(a.protocol.to_string().cmp(&b.protocol.to_string())));

    if json {
        for metric in &metrics {
            println!("{}", serde_json::to_string(metric)?);
        }
    } else if metrics.is_empty() {
        println!("no resolver answered");
    } else {
        for metric in &metrics {
            println!(
                "{:<12} {:<4} {:>5} ms  {}",
                metric.server, metric.protocol, metric.latency_ms, metric.resolved_ip
            );
        }
    }
    Ok(())
}
