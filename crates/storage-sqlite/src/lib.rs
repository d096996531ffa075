//! SQLite persistence for probe results: IP history, traces, hosts, ports
//! and DNS measurements. Probes never touch this crate; the daemon's job
//! closures bridge probe output into it.

mod insert;
mod open;
mod query;
mod schema;

pub use open::Db;

use time::OffsetDateTime;

pub(crate) fn to_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_ms(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpulse_core::model::{
        DnsMetric, DnsProtocol, DnsTarget, IpRecord, ScanHost, ScanPort, TraceHop, TraceResult,
    };
    use std::net::IpAddr;

    fn record(ip: &str) -> IpRecord {
        IpRecord {
            ip: ip.into(),
            asn: "AS64500 Example".into(),
            isp: "Example Net".into(),
            country: "NL".into(),
            city: "Amsterdam".into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn host(ip: &str) -> ScanHost {
        ScanHost {
            ip: ip.parse().unwrap(),
            hostname: Some("printer.lan".into()),
            alive: true,
            latency_ms: Some(1.5),
            last_seen: OffsetDateTime::now_utc(),
            display_name: None,
            tags: None,
            icon: None,
        }
    }

    #[test]
    fn ip_history_round_trips() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.latest_ip().unwrap().is_none());

        db.save_ip_record(&record("203.0.113.7")).unwrap();
        db.save_ip_record(&record("203.0.113.9")).unwrap();

        let latest = db.latest_ip().unwrap().unwrap();
        assert_eq!(latest.ip, "203.0.113.9");
        assert_eq!(latest.isp, "Example Net");

        let since = OffsetDateTime::now_utc() - time::Duration::hours(1);
        assert_eq!(db.ip_history_since(since).unwrap().len(), 2);
    }

    #[test]
    fn trace_round_trips_with_lost_hops() {
        let db = Db::open_in_memory().unwrap();
        let trace = TraceResult {
            target: "8.8.8.8".into(),
            timestamp: OffsetDateTime::now_utc(),
            hops: vec![
                TraceHop {
                    hop: 1,
                    ip: Some("192.168.1.1".parse().unwrap()),
                    hostname: None,
                    latency_ms: Some(0.7),
                    lost: false,
                },
                TraceHop {
                    hop: 2,
                    ip: None,
                    hostname: None,
                    latency_ms: None,
                    lost: true,
                },
                TraceHop {
                    hop: 4,
                    ip: Some("100.64.0.1".parse().unwrap()),
                    hostname: None,
                    latency_ms: Some(9.2),
                    lost: false,
                },
            ],
        };
        db.save_trace(&trace).unwrap();

        let loaded = db.latest_trace("8.8.8.8").unwrap().unwrap();
        assert_eq!(loaded.hops.len(), 3);
        assert_eq!(loaded.hops[0].hop, 1);
        assert!(loaded.hops[1].lost);
        assert!(loaded.hops[1].ip.is_none());
        assert_eq!(loaded.hops[2].hop, 4);
        assert_eq!(loaded.hops[2].latency_ms, Some(9.2));
        assert!(db.latest_trace("1.1.1.1").unwrap().is_none());
    }

    #[test]
    fn host_upsert_preserves_user_fields() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_host(&host("192.168.1.10")).unwrap();
        db.set_host_display("192.168.1.10".parse().unwrap(), Some("NAS"), Some("storage"), None)
            .unwrap();

        // A later sweep must refresh probe fields without clobbering what
        // the user assigned.
        let mut seen_again = host("192.168.1.10");
        seen_again.latency_ms = Some(3.25);
        db.upsert_host(&seen_again).unwrap();

        let hosts = db.alive_hosts().unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].latency_ms, Some(3.25));
        assert_eq!(hosts[0].display_name.as_deref(), Some("NAS"));
        assert_eq!(hosts[0].tags.as_deref(), Some("storage"));
    }

    #[test]
    fn dead_hosts_are_not_listed_alive() {
        let db = Db::open_in_memory().unwrap();
        let mut gone = host("192.168.1.11");
        gone.alive = false;
        gone.latency_ms = None;
        db.upsert_host(&gone).unwrap();
        assert!(db.alive_hosts().unwrap().is_empty());
    }

    #[test]
    fn ports_round_trip_per_host() {
        let db = Db::open_in_memory().unwrap();
        let ip: IpAddr = "192.168.1.10".parse().unwrap();
        db.upsert_host(&host("192.168.1.10")).unwrap();

        let port = ScanPort {
            port: 22,
            protocol: "tcp".into(),
            service: "ssh".into(),
            state: "open".into(),
            banner: "SSH-2.0-OpenSSH_9.6".into(),
            last_seen: OffsetDateTime::now_utc(),
        };
        db.save_port(ip, &port).unwrap();
        // Re-observation updates in place instead of duplicating.
        db.save_port(ip, &port).unwrap();

        let ports = db.open_ports(ip).unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 22);
        assert_eq!(ports[0].service, "ssh");

        let unknown: IpAddr = "192.168.1.99".parse().unwrap();
        assert!(db.save_port(unknown, &port).is_err());
    }

    #[test]
    fn dns_targets_and_metrics_round_trip() {
        let db = Db::open_in_memory().unwrap();
        db.add_dns_target(&DnsTarget {
            name: "Internal".into(),
            resolver_ip: Some("10.0.0.53".parse().unwrap()),
            doh_url: None,
        })
        .unwrap();

        let targets = db.dns_targets().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "Internal");
        assert!(targets[0].doh_url.is_none());

        db.save_dns_metric(&DnsMetric {
            server: "Internal".into(),
            protocol: DnsProtocol::Udp,
            resolved_ip: "142.250.74.110".into(),
            latency_ms: 12,
            timestamp: OffsetDateTime::now_utc(),
        })
        .unwrap();

        let metrics = db.recent_dns_metrics(10).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].protocol, DnsProtocol::Udp);
        assert_eq!(metrics[0].latency_ms, 12);
    }
}
