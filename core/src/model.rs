//! Result records handed from probes to the storage collaborator.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A public IP observation with whatever identity metadata enrichment produced.
/// Append-only; one row per ip-check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpRecord {
    pub ip: String,
    pub asn: String,
    pub isp: String,
    pub country: String,
    pub city: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// One host classified by a ping sweep. Identity key is `ip`.
///
/// `display_name`, `tags` and `icon` are user-assigned through the storage
/// layer; probes always leave them empty and upserts never overwrite them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanHost {
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub alive: bool,
    pub latency_ms: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl ScanHost {
    /// A host that did not answer any liveness attempt.
    pub fn offline(ip: IpAddr) -> Self {
        ScanHost {
            ip,
            hostname: None,
            alive: false,
            latency_ms: None,
            last_seen: OffsetDateTime::now_utc(),
            display_name: None,
            tags: None,
            icon: None,
        }
    }
}

/// An open port observed on a host. Closed/filtered ports are never recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanPort {
    pub port: u16,
    pub protocol: String,
    pub service: String,
    pub state: String,
    pub banner: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// A complete traceroute run. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceResult {
    pub target: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub hops: Vec<TraceHop>,
}

/// One hop of a traceroute. A lost hop keeps its position but carries no
/// address or latency. Hop numbers are ascending but not necessarily
/// contiguous; hops the prober never reported are simply absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceHop {
    pub hop: u32,
    pub ip: Option<IpAddr>,
    pub hostname: Option<String>,
    pub latency_ms: Option<f64>,
    pub lost: bool,
}

/// A DNS resolver to measure. `resolver_ip` drives the UDP path, `doh_url`
/// the DNS-over-HTTPS path; either may be absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsTarget {
    pub name: String,
    pub resolver_ip: Option<IpAddr>,
    pub doh_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProtocol {
    Udp,
    Doh,
}

impl fmt::Display for DnsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsProtocol::Udp => write!(f, "udp"),
            DnsProtocol::Doh => write!(f, "doh"),
        }
    }
}

impl DnsProtocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "udp" => Some(DnsProtocol::Udp),
            "doh" => Some(DnsProtocol::Doh),
            _ => None,
        }
    }
}

/// One successful resolution measurement. Append-only probe output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsMetric {
    pub server: String,
    pub protocol: DnsProtocol,
    pub resolved_ip: String,
    pub latency_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_protocol_round_trip() {
        assert_eq!(DnsProtocol::parse("udp"), Some(DnsProtocol::Udp));
        assert_eq!(DnsProtocol::parse("doh"), Some(DnsProtocol::Doh));
        assert_eq!(DnsProtocol::parse("tcp"), None);
        assert_eq!(DnsProtocol::Udp.to_string(), "udp");
    }

    #[test]
    fn offline_host_has_no_latency() {
        let h = ScanHost::offline("10.0.0.9".parse().unwrap());
        assert!(!h.alive);
        assert!(h.latency_ms.is_none());
        assert!(h.hostname.is_none());
    }
}
