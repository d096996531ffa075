//! Subnet liveness sweep over TCP connect attempts, with best-effort
//! reverse-DNS enrichment of live hosts.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use ipnet::IpNet;
use netpulse_core::model::ScanHost;
use netpulse_core::{pool, ProbeError};
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Ports tried in order when deciding liveness. A successful connect *or* a
/// refusal on any of them proves a host exists at the address.
const LIVENESS_PORTS: [u16; 6] = [80, 443, 22, 21, 445, 139];

/// Largest block `expand_cidr` will enumerate: 2^20 addresses.
const MAX_HOST_BITS: u8 = 20;

/// Expand a CIDR block into candidate scan addresses.
///
/// Blocks with more than two addresses lose their first (network) and last
/// (broadcast) entry. This is a scan-hygiene default, not general network
/// math; callers wanting the full range must not go through this function.
pub fn expand_cidr(cidr: &str) -> Result<Vec<IpAddr>, ProbeError> {
    let net: IpNet = cidr
        .trim()
        .parse()
        .map_err(|_| ProbeError::InvalidRange(cidr.to_string()))?;

    let host_bits = net.max_prefix_len() - net.prefix_len();
    if host_bits > MAX_HOST_BITS {
        return Err(ProbeError::InvalidRange(format!(
            "{cidr}: block too large to sweep"
        )));
    }

    let ips: Vec<IpAddr> = match net {
        IpNet::V4(v4) => {
            let start = u32::from(v4.network());
            let end = u32::from(v4.broadcast());
            (start..=end).map(|n| IpAddr::V4(Ipv4Addr::from(n))).collect()
        }
        IpNet::V6(v6) => {
            let start = u128::from(v6.network());
            let end = u128::from(v6.broadcast());
            (start..=end).map(|n| IpAddr::V6(Ipv6Addr::from(n))).collect()
        }
    };

    if ips.len() > 2 {
        Ok(ips[1..ips.len() - 1].to_vec())
    } else {
        Ok(ips)
    }
}

/// Classifies whether a failed connect still proves a responder at the
/// address: refused/reset means something actively rejected the packet.
/// Structural classification on the OS error kind, never string matching.
fn proves_liveness(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
    )
}

/// Sweeps subnets and re-checks individual hosts.
pub struct PingSweep {
    workers: usize,
    attempt_timeout: Duration,
    resolver: Option<TokioAsyncResolver>,
}

impl PingSweep {
    /// Zero values fall back to the defaults (50 workers, 2s per attempt).
    pub fn new(workers: usize, attempt_timeout: Duration) -> Self {
        PingSweep {
            workers: if workers == 0 { 50 } else { workers },
            attempt_timeout: if attempt_timeout.is_zero() {
                Duration::from_secs(2)
            } else {
                attempt_timeout
            },
            resolver: TokioAsyncResolver::tokio_from_system_conf().ok(),
        }
    }

    /// Classify every candidate address in `cidr` concurrently. Result order
    /// is completion order.
    pub async fn sweep(
        &self,
        cancel: &CancellationToken,
        cidr: &str,
    ) -> Result<Vec<ScanHost>, ProbeError> {
        let ips = expand_cidr(cidr)?;
        debug!(subnet = cidr, candidates = ips.len(), "starting ping sweep");

        let attempt_timeout = self.attempt_timeout;
        let resolver = self.resolver.clone();
        let inner = cancel.clone();
        let hosts = pool::run_unordered(cancel, ips, self.workers, move |ip| {
            let cancel = inner.clone();
            let resolver = resolver.clone();
            async move { Some(ping_host(&cancel, ip, attempt_timeout, resolver).await) }
        })
        .await;
        Ok(hosts)
    }

    /// Targeted re-check of specific addresses. The output matches the input
    /// positionally; addresses skipped by cancellation come back offline.
    pub async fn ping_hosts(
        &self,
        cancel: &CancellationToken,
        ips: &[IpAddr],
    ) -> Vec<ScanHost> {
        let attempt_timeout = self.attempt_timeout;
        let resolver = self.resolver.clone();
        let inner = cancel.clone();
        let results = pool::run_indexed(cancel, ips.to_vec(), self.workers, move |ip| {
            let cancel = inner.clone();
            let resolver = resolver.clone();
            async move { ping_host(&cancel, ip, attempt_timeout, resolver).await }
        })
        .await;

        results
            .into_iter()
            .zip(ips.iter())
            .map(|(res, ip)| res.unwrap_or_else(|| ScanHost::offline(*ip)))
            .collect()
    }
}

/// Try the liveness ports in order; the first connect or refusal settles the
/// host and its latency, and remaining ports are skipped.
async fn ping_host(
    cancel: &CancellationToken,
    ip: IpAddr,
    attempt_timeout: Duration,
    resolver: Option<TokioAsyncResolver>,
) -> ScanHost {
    let mut host = ScanHost::offline(ip);

    for port in LIVENESS_PORTS {
        let addr = SocketAddr::new(ip, port);
        let started = Instant::now();
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return host,
            res = timeout(attempt_timeout, TcpStream::connect(addr)) => res,
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match attempt {
            Ok(Ok(_stream)) => {
                host.alive = true;
                host.latency_ms = Some(latency_ms);
                break;
            }
            Ok(Err(err)) if proves_liveness(&err) => {
                host.alive = true;
                host.latency_ms = Some(latency_ms);
                break;
            }
            // Timed out or unreachable: nothing answered on this port.
            _ => {}
        }
    }

    if host.alive {
        host.last_seen = OffsetDateTime::now_utc();
        if let Some(resolver) = &resolver {
            host.hostname = reverse_lookup(resolver, ip, attempt_timeout).await;
        }
    }
    host
}

/// Best-effort PTR lookup; any failure yields no hostname.
async fn reverse_lookup(
    resolver: &TokioAsyncResolver,
    ip: IpAddr,
    lookup_timeout: Duration,
) -> Option<String> {
    let lookup = timeout(lookup_timeout, resolver.reverse_lookup(ip))
        .await
        .ok()?
        .ok()?;
    let name = lookup.iter().next()?;
    Some(name.0.to_utf8().trim_end_matches('.').to_string())
}
