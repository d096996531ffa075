use std::net::IpAddr;

use anyhow::{bail, Result};
use netpulse_core::model::{DnsMetric, DnsTarget, IpRecord, ScanHost, ScanPort, TraceResult};
use rusqlite::params;

use crate::{to_ms, Db};

impl Db {
    /// Append one IP observation to the history log.
    pub fn save_ip_record(&self, record: &IpRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ip_history (ip, asn, isp, country, city, timestamp_ms)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record.ip,
                record.asn,
                record.isp,
                record.country,
                record.city,
                to_ms(record.timestamp)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Store a trace and all of its hops in one transaction.
    pub fn save_trace(&self, trace: &TraceResult) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO traces (target, timestamp_ms) VALUES (?, ?)",
            params![trace.target, to_ms(trace.timestamp)],
        )?;
        let trace_id = tx.last_insert_rowid();
        for hop in &trace.hops {
            tx.execute(
                "INSERT INTO trace_hops (trace_id, hop_num, ip, hostname, latency_ms, lost)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    trace_id,
                    hop.hop,
                    hop.ip.map(|ip| ip.to_string()),
                    hop.hostname,
                    hop.latency_ms,
                    hop.lost as i64
                ],
            )?;
        }
        tx.commit()?;
        Ok(trace_id)
    }

    /// Insert or refresh a host by IP. Probe columns are overwritten;
    /// user-assigned display columns are left alone.
    pub fn upsert_host(&self, host: &ScanHost) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scan_hosts (ip, hostname, alive, latency_ms, last_seen_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(ip) DO UPDATE SET
               hostname = excluded.hostname,
               alive = excluded.alive,
               latency_ms = excluded.latency_ms,
               last_seen_ms = excluded.last_seen_ms",
            params![
                host.ip.to_string(),
                host.hostname,
                host.alive as i64,
                host.latency_ms,
                to_ms(host.last_seen)
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM scan_hosts WHERE ip = ?",
            params![host.ip.to_string()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    /// Set the user-facing fields of a host. This is the only writer of
    /// display_name/tags/icon; probe upserts never touch them.
    pub fn set_host_display(
        &self,
        ip: IpAddr,
        display_name: Option<&str>,
        tags: Option<&str>,
        icon: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE scan_hosts SET display_name = ?, tags = ?, icon = ? WHERE ip = ?",
            params![display_name, tags, icon, ip.to_string()],
        )?;
        if updated == 0 {
            bail!("unknown host {ip}");
        }
        Ok(())
    }

    /// Insert or refresh an open-port observation for a known host.
    pub fn save_port(&self, host_ip: IpAddr, port: &ScanPort) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let host_id: i64 = match conn.query_row(
            "SELECT id FROM scan_hosts WHERE ip = ?",
            params![host_ip.to_string()],
            |r| r.get(0),
        ) {
            Ok(id) => id,
            Err(rusqlite::Error::QueryReturnedNoRows) => bail!("unknown host {host_ip}"),
            Err(err) => return Err(err.into()),
        };
        conn.execute(
            "INSERT INTO scan_ports (host_id, port, protocol, service, state, banner, last_seen_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(host_id, port, protocol) DO UPDATE SET
               service = excluded.service,
               state = excluded.state,
               banner = excluded.banner,
               last_seen_ms = excluded.last_seen_ms",
            params![
                host_id,
                port.port,
                port.protocol,
                port.service,
                port.state,
                port.banner,
                to_ms(port.last_seen)
            ],
        )?;
        Ok(())
    }

    pub fn add_dns_target(&self, target: &DnsTarget) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO dns_targets (name, resolver_ip, doh_url) VALUES (?, ?, ?)",
            params![
                target.name,
                target.resolver_ip.map(|ip| ip.to_string()),
                target.doh_url
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn save_dns_metric(&self, metric: &DnsMetric) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO dns_metrics (server, protocol, resolved_ip, latency_ms, timestamp_ms)
             VALUES (?, ?, ?, ?, ?)",
            params![
                metric.server,
                metric.protocol.to_string(),
                metric.resolved_ip,
                metric.latency_ms as i64,
                to_ms(metric.timestamp)
            ],
        )?;
        Ok(())
    }
}
