//! TCP connect port scanning with bounded concurrency and passive banner
//! grabs. Only open ports produce results; connect failures of any kind are
//! recorded as absence.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use netpulse_core::model::ScanPort;
use netpulse_core::pool;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The 50 most common ports, scanned when no explicit set is configured.
pub fn default_ports() -> Vec<u16> {
    vec![
        21, 22, 23, 25, 53, 80, 110, 111, 135, 139, 143, 443, 445, 993, 995, 1723, 3306, 3389,
        5432, 5900, 8080, 8443, 8888, 27017, 6379, 11211, 1433, 1521, 5984, 9200, 2181, 9092,
        6443, 10250, 2379, 4443, 7443, 8000, 8001, 8002, 9000, 9001, 9090, 9091, 9443, 10000,
        10443, 15672, 27018, 27019,
    ]
}

/// Well-known service name for a port, `"unknown"` otherwise.
pub fn service_name(port: u16) -> &'static str {
    match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "dns",
        80 => "http",
        110 => "pop3",
        111 => "rpc",
        135 => "msrpc",
        139 => "netbios",
        143 => "imap",
        443 => "https",
        445 => "smb",
        993 => "imaps",
        995 => "pop3s",
        1433 => "mssql",
        1521 => "oracle",
        1723 => "pptp",
        3306 => "mysql",
        3389 => "rdp",
        5432 => "postgresql",
        5900 => "vnc",
        5984 => "couchdb",
        6379 => "redis",
        8080 | 8888 => "http-alt",
        8443 => "https-alt",
        9092 => "kafka",
        9200 => "elasticsearch",
        11211 => "memcached",
        27017 => "mongodb",
        _ => "unknown",
    }
}

const BANNER_READ_LIMIT: usize = 1024;
const BANNER_KEEP: usize = 200;

/// Scans one or many hosts against a fixed port set.
#[derive(Clone)]
pub struct PortScan {
    workers: usize,
    host_workers: usize,
    connect_timeout: Duration,
    ports: Vec<u16>,
}

impl PortScan {
    /// Zero/empty values fall back to the defaults (20 port workers, 5
    /// concurrent hosts, 3s timeout, the common-port set).
    pub fn new(
        workers: usize,
        host_workers: usize,
        connect_timeout: Duration,
        ports: Vec<u16>,
    ) -> Self {
        PortScan {
            workers: if workers == 0 { 20 } else { workers },
            host_workers: if host_workers == 0 { 5 } else { host_workers },
            connect_timeout: if connect_timeout.is_zero() {
                Duration::from_secs(3)
            } else {
                connect_timeout
            },
            ports: if ports.is_empty() { default_ports() } else { ports },
        }
    }

    /// Test the configured port set against one host. Returns only the open
    /// ports, in completion order.
    pub async fn scan_host(&self, cancel: &CancellationToken, host: IpAddr) -> Vec<ScanPort> {
        let connect_timeout = self.connect_timeout;
        let inner = cancel.clone();
        let open = pool::run_unordered(cancel, self.ports.clone(), self.workers, move |port| {
            let cancel = inner.clone();
            async move { probe_port(&cancel, host, port, connect_timeout).await }
        })
        .await;
        debug!(host = %host, open = open.len(), scanned = self.ports.len(), "port scan finished");
        open
    }

    /// Scan several hosts, holding host-level concurrency well below the
    /// per-host worker count so total socket use stays at
    /// `host_workers * workers`. Hosts with no open ports are omitted.
    pub async fn scan_many(
        &self,
        cancel: &CancellationToken,
        hosts: &[IpAddr],
    ) -> HashMap<IpAddr, Vec<ScanPort>> {
        let sem = Arc::new(Semaphore::new(self.host_workers));
        let mut set: JoinSet<(IpAddr, Vec<ScanPort>)> = JoinSet::new();

        for &host in hosts {
            if cancel.is_cancelled() {
                break;
            }
            let permit = sem.clone().acquire_owned().await.unwrap();
            let cancel = cancel.clone();
            let scanner = self.clone();
            set.spawn(async move {
                let _permit = permit;
                let open = scanner.scan_host(&cancel, host).await;
                (host, open)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((host, open)) = joined {
                if !open.is_empty() {
                    results.insert(host, open);
                }
            }
        }
        results
    }
}

/// Connect to one port. Success means open (with a best-effort banner);
/// every failure mode means no result.
async fn probe_port(
    cancel: &CancellationToken,
    host: IpAddr,
    port: u16,
    connect_timeout: Duration,
) -> Option<ScanPort> {
    let addr = SocketAddr::new(host, port);
    let stream = tokio::select! {
        _ = cancel.cancelled() => return None,
        res = timeout(connect_timeout, TcpStream::connect(addr)) => res.ok()?.ok()?,
    };

    let banner = read_banner(stream, connect_timeout / 2).await;
    Some(ScanPort {
        port,
        protocol: "tcp".to_string(),
        service: service_name(port).to_string(),
        state: "open".to_string(),
        banner,
        last_seen: OffsetDateTime::now_utc(),
    })
}

/// Passive banner grab: whatever the service volunteers within half the
/// connect timeout, truncated. Silence or errors yield an empty banner.
async fn read_banner(mut stream: TcpStream, read_timeout: Duration) -> String {
    let mut buf = vec![0u8; BANNER_READ_LIMIT];
    match timeout(read_timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            let mut banner = String::from_utf8_lossy(&buf[..n]).into_owned();
            banner.truncate(BANNER_KEEP);
            banner
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn known_and_unknown_services() {
        assert_eq!(service_name(22), "ssh");
        assert_eq!(service_name(443), "https");
        assert_eq!(service_name(6379), "redis");
        assert_eq!(service_name(47808), "unknown");
    }

    #[test]
    fn default_port_set_is_fifty_unique_ports() {
        let ports = default_ports();
        assert_eq!(ports.len(), 50);
        let mut dedup = ports.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), 50);
    }

    #[tokio::test]
    async fn open_port_is_reported_with_service_and_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(b"SSH-2.0-testd\r\n").await;
            }
        });

        let scanner = PortScan::new(4, 2, Duration::from_millis(500), vec![port]);
        let cancel = CancellationToken::new();
        let open = scanner
            .scan_host(&cancel, "127.0.0.1".parse().unwrap())
            .await;

        assert_eq!(open.len(), 1);
        assert_eq!(open[0].port, port);
        assert_eq!(open[0].state, "open");
        assert!(open[0].banner.starts_with("SSH-2.0-testd"));
    }

    #[tokio::test]
    async fn closed_port_yields_no_result() {
        // Bind then drop to get a port that actively refuses.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let scanner = PortScan::new(4, 2, Duration::from_millis(300), vec![port]);
        let cancel = CancellationToken::new();
        let open = scanner
            .scan_host(&cancel, "127.0.0.1".parse().unwrap())
            .await;
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn hosts_without_open_ports_are_omitted_from_map() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let scanner = PortScan::new(4, 2, Duration::from_millis(300), vec![port]);
        let cancel = CancellationToken::new();
        let with_listener: IpAddr = "127.0.0.1".parse().unwrap();
        let without: IpAddr = "127.0.0.2".parse().unwrap();
        let results = scanner
            .scan_many(&cancel, &[with_listener, without])
            .await;

        assert!(results.contains_key(&with_listener));
        assert!(!results.contains_key(&without));
    }
}
