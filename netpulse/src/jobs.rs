//! The recurring probe jobs. Each closure bridges one probe to storage so
//! the probes themselves stay storage-agnostic.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dns_monitor::{MetricSink, TargetProvider};
use ip_check::{Enricher, IpCheck};
use netpulse_core::model::IpRecord;
use netpulse_core::scheduler::{Job, Scheduler};
use netpulse_core::ProbeError;
use ping_sweep::PingSweep;
use port_scan::PortScan;
use storage_sqlite::Db;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use traceroute::Traceroute;

use crate::config::Config;

/// Build the four probe jobs from configuration and register them.
pub fn register_jobs(scheduler: &Scheduler, cfg: &Config, db: &Arc<Db>) -> Result<()> {
    // ip_check: consensus address, identity enrichment, change detection.
    let probe = Arc::new(IpCheck::new(
        cfg.ip_providers.clone(),
        Duration::from_secs(cfg.ip_timeout_secs),
    )?);
    let enricher = Arc::new(Enricher::new(Duration::from_secs(cfg.ip_timeout_secs))?);
    let db_job = db.clone();
    scheduler.add_job(Job::new(
        "ip_check",
        Duration::from_secs(cfg.ip_check_interval_secs),
        move |cancel| {
            let probe = probe.clone();
            let enricher = enricher.clone();
            let db = db_job.clone();
            Box::pin(async move { run_ip_check(cancel, &probe, &enricher, &db).await })
        },
    ));

    // traceroute: all configured targets, partial failures tolerated.
    let tracer = Traceroute::new(
        cfg.trace_max_hops,
        Duration::from_secs(cfg.trace_hop_wait_secs),
    );
    let targets = cfg.trace_targets.clone();
    let db_job = db.clone();
    scheduler.add_job(Job::new(
        "traceroute",
        Duration::from_secs(cfg.trace_interval_secs),
        move |cancel| {
            let tracer = tracer.clone();
            let targets = targets.clone();
            let db = db_job.clone();
            Box::pin(async move { run_traceroute(cancel, &tracer, &targets, &db).await })
        },
    ));

    // ping_sweep: classify the configured subnet.
    let sweep = Arc::new(PingSweep::new(
        cfg.sweep_concurrency,
        Duration::from_millis(cfg.sweep_timeout_ms),
    ));
    let subnet = cfg.sweep_subnet.clone();
    let db_job = db.clone();
    scheduler.add_job(Job::new(
        "ping_sweep",
        Duration::from_secs(cfg.ping_sweep_interval_secs),
        move |cancel| {
            let sweep = sweep.clone();
            let subnet = subnet.clone();
            let db = db_job.clone();
            Box::pin(async move { run_ping_sweep(cancel, &sweep, &subnet, &db).await })
        },
    ));

    // port_scan: every host the last sweep saw alive.
    let scanner = Arc::new(PortScan::new(
        cfg.scan_concurrency,
        cfg.scan_host_concurrency,
        Duration::from_millis(cfg.scan_timeout_ms),
        cfg.scan_ports.clone(),
    ));
    let db_job = db.clone();
    scheduler.add_job(Job::new(
        "port_scan",
        Duration::from_secs(cfg.port_scan_interval_secs),
        move |cancel| {
            let scanner = scanner.clone();
            let db = db_job.clone();
            Box::pin(async move { run_port_scan(cancel, &scanner, &db).await })
        },
    ));

    Ok(())
}

/// DNS monitor target provider backed by the user-editable table.
pub fn dns_provider(db: &Arc<Db>) -> TargetProvider {
    let db = db.clone();
    Arc::new(move || match db.dns_targets() {
        Ok(targets) => targets,
        Err(err) => {
            warn!(error = %err, "failed to load dns targets");
            Vec::new()
        }
    })
}

/// DNS monitor sink persisting each successful measurement.
pub fn dns_sink(db: &Arc<Db>) -> MetricSink {
    let db = db.clone();
    Arc::new(move |metric| {
        if let Err(err) = db.save_dns_metric(&metric) {
            warn!(server = %metric.server, error = %err, "failed to save dns metric");
        }
    })
}

async fn run_ip_check(
    cancel: CancellationToken,
    probe: &IpCheck,
    enricher: &Enricher,
    db: &Db,
) -> Result<(), ProbeError> {
    let ip = probe.public_ip(&cancel).await?;
    info!(ip = %ip, "detected public ip");

    let identity = match enricher.enrich(&cancel, &ip).await {
        Ok(info) => Some(info),
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => {
            warn!(error = %err, "identity enrichment failed");
            None
        }
    };

    let previous = db.latest_ip().map_err(storage_err)?;
    let changed = previous.map(|p| p.ip != ip).unwrap_or(false);

    let mut record = IpRecord {
        ip: ip.clone(),
        asn: String::new(),
        isp: String::new(),
        country: String::new(),
        city: String::new(),
        timestamp: OffsetDateTime::now_utc(),
    };
    if let Some(identity) = identity {
        record.asn = identity.asn;
        record.isp = identity.isp;
        record.country = identity.country;
        record.city = identity.city;
    }
    db.save_ip_record(&record).map_err(storage_err)?;

    if changed {
        info!(ip = %ip, isp = %record.isp, "public ip changed");
    }
    Ok(())
}

async fn run_traceroute(
    cancel: CancellationToken,
    tracer: &Traceroute,
    targets: &[String],
    db: &Db,
) -> Result<(), ProbeError> {
    if targets.is_empty() {
        debug!("traceroute disabled (no targets configured)");
        return Ok(());
    }

    let (results, first_err) = tracer.trace_many(&cancel, targets).await;
    for result in &results {
        match db.save_trace(result) {
            Ok(_) => info!(target = %result.target, hops = result.hops.len(), "trace saved"),
            Err(err) => warn!(target = %result.target, error = %err, "failed to save trace"),
        }
    }

    match first_err {
        Some(err) if err.is_cancelled() => Err(err),
        // Everything failed: surface it so the job backs off for retry.
        Some(err) if results.is_empty() => Err(err),
        Some(err) => {
            warn!(error = %err, "some trace targets failed");
            Ok(())
        }
        None => Ok(()),
    }
}

async fn run_ping_sweep(
    cancel: CancellationToken,
    sweep: &PingSweep,
    subnet: &str,
    db: &Db,
) -> Result<(), ProbeError> {
    if subnet.is_empty() {
        debug!("ping sweep disabled (no subnet configured)");
        return Ok(());
    }

    let hosts = sweep.sweep(&cancel, subnet).await?;
    let mut alive = 0;
    for host in &hosts {
        if let Err(err) = db.upsert_host(host) {
            warn!(host = %host.ip, error = %err, "failed to save host");
        }
        if host.alive {
            alive += 1;
        }
    }
    info!(alive, total = hosts.len(), "ping sweep complete");
    Ok(())
}

async fn run_port_scan(
    cancel: CancellationToken,
    scanner: &PortScan,
    db: &Db,
) -> Result<(), ProbeError> {
    let hosts = db.alive_hosts().map_err(storage_err)?;
    if hosts.is_empty() {
        debug!("no alive hosts to scan");
        return Ok(());
    }

    let ips: Vec<IpAddr> = hosts.iter().map(|h| h.ip).collect();
    let results = scanner.scan_many(&cancel, &ips).await;

    let mut total = 0;
    for (ip, ports) in &results {
        for port in ports {
            if let Err(err) = db.save_port(*ip, port) {
                warn!(host = %ip, port = port.port, error = %err, "failed to save port");
            }
        }
        total += ports.len();
    }
    info!(open_ports = total, hosts = results.len(), "port scan complete");
    Ok(())
}

fn storage_err(err: anyhow::Error) -> ProbeError {
    ProbeError::Storage(err.to_string())
}
