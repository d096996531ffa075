use std::net::IpAddr;

use anyhow::Result;
use netpulse_core::model::{
    DnsMetric, DnsProtocol, DnsTarget, IpRecord, ScanHost, ScanPort, TraceHop, TraceResult,
};
use rusqlite::params;
use time::OffsetDateTime;

use crate::{from_ms, to_ms, Db};

impl Db {
    /// The most recent IP observation, if any.
    pub fn latest_ip(&self) -> Result<Option<IpRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ip, asn, isp, country, city, timestamp_ms
             FROM ip_history ORDER BY timestamp_ms DESC, id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], ip_record_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn ip_history_since(&self, since: OffsetDateTime) -> Result<Vec<IpRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ip, asn, isp, country, city, timestamp_ms
             FROM ip_history WHERE timestamp_ms >= ? ORDER BY timestamp_ms DESC",
        )?;
        let rows = stmt.query_map(params![to_ms(since)], ip_record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The most recent trace to `target`, hops in hop-number order.
    pub fn latest_trace(&self, target: &str) -> Result<Option<TraceResult>> {
        let conn = self.conn.lock().unwrap();
        let found: Option<(i64, i64)> = conn
            .query_row(
                "SELECT id, timestamp_ms FROM traces
                 WHERE target = ? ORDER BY timestamp_ms DESC, id DESC LIMIT 1",
                params![target],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some((trace_id, timestamp_ms)) = found else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT hop_num, ip, hostname, latency_ms, lost
             FROM trace_hops WHERE trace_id = ? ORDER BY hop_num ASC",
        )?;
        let rows = stmt.query_map(params![trace_id], |r| {
            Ok((
                r.get::<_, u32>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<f64>>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })?;
        let mut hops = Vec::new();
        for row in rows {
            let (hop, ip, hostname, latency_ms, lost) = row?;
            hops.push(TraceHop {
                hop,
                ip: ip.and_then(|s| s.parse().ok()),
                hostname,
                latency_ms,
                lost: lost != 0,
            });
        }
        Ok(Some(TraceResult {
            target: target.to_string(),
            timestamp: from_ms(timestamp_ms),
            hops,
        }))
    }

    /// Hosts the last sweep saw alive; port scans feed from this.
    pub fn alive_hosts(&self) -> Result<Vec<ScanHost>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ip, hostname, alive, latency_ms, last_seen_ms, display_name, tags, icon
             FROM scan_hosts WHERE alive = 1 ORDER BY ip",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, Option<f64>>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, Option<String>>(7)?,
            ))
        })?;
        let mut hosts = Vec::new();
        for row in rows {
            let (ip, hostname, alive, latency_ms, last_seen_ms, display_name, tags, icon) = row?;
            let Ok(ip) = ip.parse::<IpAddr>() else { continue };
            hosts.push(ScanHost {
                ip,
                hostname,
                alive: alive != 0,
                latency_ms,
                last_seen: from_ms(last_seen_ms),
                display_name,
                tags,
                icon,
            });
        }
        Ok(hosts)
    }

    /// Open ports recorded for a host, ascending.
    pub fn open_ports(&self, host_ip: IpAddr) -> Result<Vec<ScanPort>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT p.port, p.protocol, p.service, p.state, p.banner, p.last_seen_ms
             FROM scan_ports p JOIN scan_hosts h ON h.id = p.host_id
             WHERE h.ip = ? ORDER BY p.port ASC",
        )?;
        let rows = stmt.query_map(params![host_ip.to_string()], |r| {
            Ok(ScanPort {
                port: r.get(0)?,
                protocol: r.get(1)?,
                service: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                state: r.get(3)?,
                banner: r.get::<_, Option<String>>(4)?.unwrap_or_default(),
                last_seen: from_ms(r.get(5)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The user-maintained DNS target list.
    pub fn dns_targets(&self) -> Result<Vec<DnsTarget>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT name, resolver_ip, doh_url FROM dns_targets ORDER BY id")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, Option<String>>(2)?,
            ))
        })?;
        let mut targets = Vec::new();
        for row in rows {
            let (name, resolver_ip, doh_url) = row?;
            targets.push(DnsTarget {
                name,
                resolver_ip: resolver_ip.and_then(|s| s.parse().ok()),
                doh_url,
            });
        }
        Ok(targets)
    }

    pub fn recent_dns_metrics(&self, limit: usize) -> Result<Vec<DnsMetric>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT server, protocol, resolved_ip, latency_ms, timestamp_ms
             FROM dns_metrics ORDER BY timestamp_ms DESC, id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })?;
        let mut metrics = Vec::new();
        for row in rows {
            let (server, protocol, resolved_ip, latency_ms, timestamp_ms) = row?;
            metrics.push(DnsMetric {
                server,
                protocol: DnsProtocol::parse(&protocol).unwrap_or(DnsProtocol::Udp),
                resolved_ip: resolved_ip.unwrap_or_default(),
                latency_ms: latency_ms.max(0) as u64,
                timestamp: from_ms(timestamp_ms),
            });
        }
        Ok(metrics)
    }
}

fn ip_record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<IpRecord> {
    Ok(IpRecord {
        ip: r.get(0)?,
        asn: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
        isp: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
        country: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
        city: r.get::<_, Option<String>>(4)?.unwrap_or_default(),
        timestamp: crate::from_ms(r.get(5)?),
    })
}
