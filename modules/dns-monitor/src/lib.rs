//! Dual-path DNS resolution measurement: a direct UDP query to each
//! target's resolver (system resolution bypassed) and, where configured, a
//! DNS-over-HTTPS query. Runs on its own fixed ticker rather than under the
//! scheduler because its natural period differs from the other probes.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use netpulse_core::model::{DnsMetric, DnsProtocol, DnsTarget};
use netpulse_core::ProbeError;
use reqwest::Client;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Supplies the user-maintained target list on every tick, so edits take
/// effect without a restart.
pub type TargetProvider = Arc<dyn Fn() -> Vec<DnsTarget> + Send + Sync>;

/// Receives one call per successful measurement; persistence lives behind
/// this seam.
pub type MetricSink = Arc<dyn Fn(DnsMetric) + Send + Sync>;

/// Resolvers checked on every tick regardless of user configuration.
pub fn default_targets() -> Vec<DnsTarget> {
    vec![
        DnsTarget {
            name: "Google".into(),
            resolver_ip: Some(IpAddr::from([8, 8, 8, 8])),
            doh_url: Some("https://dns.google/resolve".into()),
        },
        DnsTarget {
            name: "Cloudflare".into(),
            resolver_ip: Some(IpAddr::from([1, 1, 1, 1])),
            doh_url: Some("https://cloudflare-dns.com/dns-query".into()),
        },
        DnsTarget {
            name: "Quad9".into(),
            resolver_ip: Some(IpAddr::from([9, 9, 9, 9])),
            doh_url: Some("https://dns.quad9.net/dns-query".into()),
        },
    ]
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status", default)]
    status: i32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    rtype: u16,
    data: String,
}

const A_RECORD: u16 = 1;

/// Measures resolution latency per target over UDP and DoH.
#[derive(Clone)]
pub struct DnsMonitor {
    interval: Duration,
    hostname: String,
    query_timeout: Duration,
    client: Client,
}

impl DnsMonitor {
    /// Zero/empty values fall back to the defaults (60s tick, google.com,
    /// 2s per query).
    pub fn new(
        interval: Duration,
        hostname: impl Into<String>,
        query_timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let hostname = hostname.into();
        let query_timeout = if query_timeout.is_zero() {
            Duration::from_secs(2)
        } else {
            query_timeout
        };
        let client = Client::builder()
            .timeout(query_timeout)
            .user_agent(format!("netpulse/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ProbeError::Config(err.to_string()))?;
        Ok(DnsMonitor {
            interval: if interval.is_zero() {
                Duration::from_secs(60)
            } else {
                interval
            },
            hostname: if hostname.is_empty() {
                "google.com".into()
            } else {
                hostname
            },
            query_timeout,
            client,
        })
    }

    /// Tick until the token fires. The first check runs immediately.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        provider: TargetProvider,
        sink: MetricSink,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, host = %self.hostname, "dns monitor started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("dns monitor stopping");
                    return;
                }
                _ = ticker.tick() => self.check_once(&cancel, &provider, &sink).await,
            }
        }
    }

    /// One round: built-in defaults plus whatever the provider supplies
    /// right now, every target measured concurrently.
    pub async fn check_once(
        &self,
        cancel: &CancellationToken,
        provider: &TargetProvider,
        sink: &MetricSink,
    ) {
        let mut targets = default_targets();
        targets.extend(provider());

        let mut set = JoinSet::new();
        for target in targets {
            let monitor = self.clone();
            let cancel = cancel.clone();
            let sink = sink.clone();
            set.spawn(async move { monitor.check_target(&cancel, &target, &sink).await });
        }
        while set.join_next().await.is_some() {}
    }

    /// Measure both paths of one target. A failed path logs and produces no
    /// metric; there is no retry within the tick.
    async fn check_target(
        &self,
        cancel: &CancellationToken,
        target: &DnsTarget,
        sink: &MetricSink,
    ) {
        let both = async {
            let udp = async {
                if let Some(ip) = target.resolver_ip {
                    match self.measure_udp(ip).await {
                        Ok((latency_ms, resolved_ip)) => (sink.as_ref())(DnsMetric {
                            server: target.name.clone(),
                            protocol: DnsProtocol::Udp,
                            resolved_ip,
                            latency_ms,
                            timestamp: OffsetDateTime::now_utc(),
                        }),
                        Err(err) => {
                            debug!(target = %target.name, error = %err, "udp resolution failed");
                        }
                    }
                }
            };
            let doh = async {
                if let Some(url) = &target.doh_url {
                    match self.measure_doh(url).await {
                        Ok((latency_ms, resolved_ip)) => (sink.as_ref())(DnsMetric {
                            server: target.name.clone(),
                            protocol: DnsProtocol::Doh,
                            resolved_ip,
                            latency_ms,
                            timestamp: OffsetDateTime::now_utc(),
                        }),
                        Err(err) => {
                            debug!(target = %target.name, error = %err, "doh resolution failed");
                        }
                    }
                }
            };
            tokio::join!(udp, doh);
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = both => {}
        }
    }

    /// Resolve the probe hostname directly against `resolver`, returning
    /// latency and the first answer.
    pub async fn measure_udp(&self, resolver: IpAddr) -> Result<(u64, String), ProbeError> {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(resolver, 53),
            Protocol::Udp,
        ));
        let mut opts = ResolverOpts::default();
        opts.timeout = self.query_timeout;
        opts.attempts = 1;
        let resolver = TokioAsyncResolver::tokio(config, opts);

        let started = Instant::now();
        let lookup = resolver
            .lookup_ip(self.hostname.as_str())
            .await
            .map_err(|err| ProbeError::Other(err.to_string()))?;
        let resolved = lookup
            .iter()
            .next()
            .ok_or_else(|| ProbeError::Other("empty answer".into()))?;
        Ok((
            started.elapsed().as_millis() as u64,
            resolved.to_string(),
        ))
    }

    /// Resolve the probe hostname through a DoH endpoint speaking the JSON
    /// wire format, returning latency and the first A answer.
    pub async fn measure_doh(&self, url: &str) -> Result<(u64, String), ProbeError> {
        let started = Instant::now();
        let resp = self
            .client
            .get(url)
            .query(&[("name", self.hostname.as_str()), ("type", "A")])
            .header("accept", "application/dns-json")
            .send()
            .await
            .map_err(|err| ProbeError::Other(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(ProbeError::Other(format!("status {}", resp.status())));
        }
        let doh: DohResponse = resp
            .json()
            .await
            .map_err(|err| ProbeError::Other(err.to_string()))?;
        if doh.status != 0 {
            return Err(ProbeError::Other(format!("dns status {}", doh.status)));
        }
        let answer = doh
            .answer
            .iter()
            .find(|a| a.rtype == A_RECORD)
            .ok_or_else(|| ProbeError::Other("no A record in answer".into()))?;
        Ok((
            started.elapsed().as_millis() as u64,
            answer.data.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn defaults_cover_both_paths() {
        let targets = default_targets();
        assert_eq!(targets.len(), 3);
        for t in &targets {
            assert!(t.resolver_ip.is_some());
            assert!(t.doh_url.is_some());
        }
    }

    #[test]
    fn doh_json_decodes_and_picks_a_records() {
        let body = r#"{
            "Status": 0,
            "Answer": [
                {"name":"google.com","type":5,"TTL":300,"data":"alias.example."},
                {"name":"google.com","type":1,"TTL":300,"data":"142.250.74.110"}
            ]
        }"#;
        let doh: DohResponse = serde_json::from_str(body).unwrap();
        assert_eq!(doh.status, 0);
        let a = doh.answer.iter().find(|a| a.rtype == A_RECORD).unwrap();
        assert_eq!(a.data, "142.250.74.110");
    }

    #[test]
    fn doh_json_without_answers_decodes_empty() {
        let doh: DohResponse = serde_json::from_str(r#"{"Status": 2}"#).unwrap();
        assert_eq!(doh.status, 2);
        assert!(doh.answer.is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let monitor =
            DnsMonitor::new(Duration::from_secs(60), "google.com", Duration::from_secs(1))
                .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let seen: Arc<Mutex<Vec<DnsMetric>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let provider: TargetProvider = Arc::new(Vec::new);
        let sink: MetricSink = Arc::new(move |m| sink_seen.lock().unwrap().push(m));
        // Token already fired: the loop must exit before the first check.
        monitor.run(cancel, provider, sink).await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
