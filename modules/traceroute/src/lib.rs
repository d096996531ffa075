//! Path discovery through the system traceroute binary, with an ICMP
//! fallback and a line-oriented hop parser.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use netpulse_core::model::{TraceHop, TraceResult};
use netpulse_core::ProbeError;
use regex::Regex;
use time::OffsetDateTime;
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Matches one hop line: either `N ip latency ms` or `N` followed only by
/// timeout stars (one or more, to cover single-probe runs).
fn hop_regex() -> &'static Regex {
    static HOP_RE: OnceLock<Regex> = OnceLock::new();
    HOP_RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\s+(?:(\d+\.\d+\.\d+\.\d+)\s+(\d+\.?\d*)\s*ms|\*(?:\s+\*)*\s*$)")
            .unwrap()
    })
}

/// Runs traceroute against one or many targets.
#[derive(Clone)]
pub struct Traceroute {
    max_hops: u32,
    hop_wait: Duration,
}

impl Default for Traceroute {
    fn default() -> Self {
        Traceroute {
            max_hops: 30,
            hop_wait: Duration::from_secs(2),
        }
    }
}

impl Traceroute {
    /// Out-of-range values fall back to the defaults (30 hops, 2s per hop).
    pub fn new(max_hops: u32, hop_wait: Duration) -> Self {
        Traceroute {
            max_hops: if (1..=64).contains(&max_hops) { max_hops } else { 30 },
            hop_wait: if hop_wait.is_zero() {
                Duration::from_secs(2)
            } else {
                hop_wait
            },
        }
    }

    /// Trace the path to `target`. The default UDP probe is retried once
    /// with ICMP before giving up.
    pub async fn trace(
        &self,
        cancel: &CancellationToken,
        target: &str,
    ) -> Result<TraceResult, ProbeError> {
        let timestamp = OffsetDateTime::now_utc();
        let output = match self.run_system_traceroute(cancel, target, false).await {
            Ok(out) => out,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(first) => {
                debug!(target, error = %first, "traceroute failed, retrying with icmp");
                self.run_system_traceroute(cancel, target, true)
                    .await
                    .map_err(|second| {
                        if second.is_cancelled() {
                            second
                        } else {
                            ProbeError::TracerouteFailed(format!(
                                "{target}: {first}; icmp fallback: {second}"
                            ))
                        }
                    })?
            }
        };

        let hops = parse_output(&output);
        debug!(target, hops = hops.len(), "traceroute complete");
        Ok(TraceResult {
            target: target.to_string(),
            timestamp,
            hops,
        })
    }

    /// Trace every target concurrently (target lists are small and
    /// operator-configured, so no pool bound). One bad target never blocks
    /// the rest: all completed results are returned together with the first
    /// error encountered, if any.
    pub async fn trace_many(
        &self,
        cancel: &CancellationToken,
        targets: &[String],
    ) -> (Vec<TraceResult>, Option<ProbeError>) {
        let mut set = JoinSet::new();
        for target in targets {
            let tracer = self.clone();
            let cancel = cancel.clone();
            let target = target.clone();
            set.spawn(async move { tracer.trace(&cancel, &target).await });
        }

        let mut results = Vec::new();
        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(_) => {}
            }
        }
        (results, first_err)
    }

    async fn run_system_traceroute(
        &self,
        cancel: &CancellationToken,
        target: &str,
        icmp: bool,
    ) -> Result<String, ProbeError> {
        let mut cmd = Command::new("traceroute");
        // -n numeric, -q 1 single probe per hop, -w per-hop wait.
        cmd.arg("-n").arg("-q").arg("1");
        cmd.arg("-w").arg(self.hop_wait.as_secs().max(1).to_string());
        cmd.arg("-m").arg(self.max_hops.to_string());
        if icmp {
            cmd.arg("-I");
        }
        cmd.arg(target);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            res = cmd.output() => {
                res.map_err(|err| ProbeError::TracerouteFailed(err.to_string()))?
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::TracerouteFailed(format!(
                "exit {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse traceroute output into hops. Lines that are neither a reporting
/// hop nor a timeout line (headers, garbage) are skipped, so hop numbers in
/// the result need not be contiguous.
pub fn parse_output(output: &str) -> Vec<TraceHop> {
    let re = hop_regex();
    let mut hops = Vec::new();
    for line in output.lines() {
        let Some(caps) = re.captures(line) else { continue };
        let Ok(hop) = caps[1].parse::<u32>() else { continue };

        match caps.get(2) {
            Some(ip_match) => {
                // An implausible dotted quad (e.g. octet > 255) degrades to
                // a lost hop so positional information survives.
                let ip = ip_match.as_str().parse().ok();
                let latency_ms = caps
                    .get(3)
                    .and_then(|m| m.as_str().parse::<f64>().ok())
                    .filter(|_| ip.is_some());
                hops.push(TraceHop {
                    hop,
                    ip,
                    hostname: None,
                    latency_ms,
                    lost: ip.is_none(),
                });
            }
            None => hops.push(TraceHop {
                hop,
                ip: None,
                hostname: None,
                latency_ms: None,
                lost: true,
            }),
        }
    }
    hops
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn parses_reporting_and_lost_hops() {
        let hops = parse_output("1 192.168.0.1 1.234 ms\n2 * * *\n");
        assert_eq!(hops.len(), 2);

        assert_eq!(hops[0].hop, 1);
        assert_eq!(hops[0].ip, Some("192.168.0.1".parse::<IpAddr>().unwrap()));
        assert_eq!(hops[0].latency_ms, Some(1.234));
        assert!(!hops[0].lost);

        assert_eq!(hops[1].hop, 2);
        assert!(hops[1].ip.is_none());
        assert!(hops[1].latency_ms.is_none());
        assert!(hops[1].lost);
    }

    #[test]
    fn accepts_single_probe_timeout_lines() {
        let hops = parse_output(" 3  *\n");
        assert_eq!(hops.len(), 1);
        assert!(hops[0].lost);
    }

    #[test]
    fn skips_headers_and_garbage() {
        let output = "traceroute to 8.8.8.8 (8.8.8.8), 30 hops max, 60 byte packets\n\
                      1  10.0.0.1  0.512 ms\n\
                      something unparseable\n\
                      4  172.16.0.1  12.0 ms\n";
        let hops = parse_output(output);
        assert_eq!(hops.len(), 2);
        // Hop numbers are carried through as printed, not renumbered.
        assert_eq!(hops[0].hop, 1);
        assert_eq!(hops[1].hop, 4);
    }

    #[test]
    fn real_world_shape_with_indentation() {
        let output = " 1  192.168.1.1  0.734 ms\n \
                      2  * * *\n \
                      3  100.64.0.1  8.901 ms\n";
        let hops = parse_output(output);
        assert_eq!(hops.len(), 3);
        assert!(hops[1].lost);
        assert_eq!(hops[2].latency_ms, Some(8.901));
    }

    #[tokio::test]
    async fn missing_binary_reports_failure_not_panic() {
        // Point at a name that cannot exist so both attempts fail fast.
        let tracer = Traceroute::new(5, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        // The target is irrelevant; spawning may fail (no binary) or the
        // binary may reject the flags. Either way this must surface as
        // TracerouteFailed, not a panic.
        let res = tracer.trace(&cancel, "203.0.113.1").await;
        if let Err(err) = res {
            assert!(matches!(err, ProbeError::TracerouteFailed(_)));
        }
    }

    #[tokio::test]
    async fn cancelled_trace_reports_cancellation() {
        let tracer = Traceroute::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = tracer.trace(&cancel, "203.0.113.1").await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
