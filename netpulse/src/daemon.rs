//! Composition root: owns storage, the scheduler, the DNS monitor and the
//! root cancellation token, and wires signal handling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dns_monitor::DnsMonitor;
use netpulse_core::scheduler::{JobStatus, Scheduler};
use serde::Serialize;
use storage_sqlite::Db;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::jobs;

pub struct Daemon {
    config: Config,
    db: Arc<Db>,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    started_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct DaemonStatus {
    pub pid: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub uptime_secs: u64,
    pub jobs: Vec<JobStatus>,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("creating data directory {}", config.data_dir.display())
        })?;
        let db = Arc::new(
            Db::open_or_create(config.data_dir.join("netpulse.db"))
                .context("opening database")?,
        );
        let cancel = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(cancel.clone()));
        Ok(Daemon {
            config,
            db,
            scheduler,
            cancel,
            started_at: OffsetDateTime::now_utc(),
        })
    }

    /// Run in the foreground until interrupted or [`Daemon::shutdown`].
    pub async fn run(&self) -> Result<()> {
        self.write_pid_file()?;
        jobs::register_jobs(&self.scheduler, &self.config, &self.db)?;

        let monitor = DnsMonitor::new(
            Duration::from_secs(self.config.dns_check_interval_secs),
            self.config.dns_probe_hostname.clone(),
            Duration::from_millis(self.config.dns_query_timeout_ms),
        )?;
        let monitor_handle = tokio::spawn({
            let cancel = self.cancel.clone();
            let provider = jobs::dns_provider(&self.db);
            let sink = jobs::dns_sink(&self.db);
            async move { monitor.run(cancel, provider, sink).await }
        });

        let scheduler_handle = tokio::spawn({
            let scheduler = self.scheduler.clone();
            async move { scheduler.run().await }
        });

        info!(pid = std::process::id(), data_dir = %self.config.data_dir.display(), "daemon started");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, shutting down");
                self.cancel.cancel();
            }
            _ = self.cancel.cancelled() => {}
        }

        if scheduler_handle.await.is_err() {
            warn!("scheduler task panicked");
        }
        if monitor_handle.await.is_err() {
            warn!("dns monitor task panicked");
        }
        self.remove_pid_file();
        info!("daemon stopped");
        Ok(())
    }

    /// Fire the root token; every in-flight probe sees it.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> DaemonStatus {
        let uptime = OffsetDateTime::now_utc() - self.started_at;
        DaemonStatus {
            pid: std::process::id(),
            started_at: self.started_at,
            uptime_secs: uptime.whole_seconds().max(0) as u64,
            jobs: self.scheduler.statuses(),
        }
    }

    pub fn trigger_job(&self, name: &str) -> bool {
        self.scheduler.trigger_job(name)
    }

    fn pid_file(&self) -> PathBuf {
        self.config.data_dir.join("netpulse.pid")
    }

    fn write_pid_file(&self) -> Result<()> {
        std::fs::write(self.pid_file(), std::process::id().to_string())
            .context("writing pid file")
    }

    fn remove_pid_file(&self) {
        let _ = std::fs::remove_file(self.pid_file());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(tag: &str) -> Config {
        let mut cfg = Config::default();
        cfg.data_dir = std::env::temp_dir().join(format!(
            "netpulse-test-{}-{}",
            tag,
            std::process::id()
        ));
        cfg
    }

    #[tokio::test]
    async fn daemon_starts_and_stops_cleanly() {
        let daemon = Daemon::new(test_config("lifecycle")).unwrap();
        // Shut down before running: the run loop must still write the pid
        // file, register jobs, then exit and clean up without touching the
        // network.
        daemon.shutdown();
        daemon.run().await.unwrap();

        assert!(!daemon.pid_file().exists());
        let status = daemon.status();
        assert_eq!(status.jobs.len(), 4);
        let names: Vec<&str> = status.jobs.iter().map(|j| j.name.as_str()).collect();
        assert!(names.contains(&"ip_check"));
        assert!(names.contains(&"traceroute"));
        assert!(names.contains(&"ping_sweep"));
        assert!(names.contains(&"port_scan"));

        let _ = std::fs::remove_dir_all(&daemon.config.data_dir);
    }

    #[tokio::test]
    async fn unknown_job_cannot_be_triggered() {
        let daemon = Daemon::new(test_config("trigger")).unwrap();
        assert!(!daemon.trigger_job("nonsense"));
        let _ = std::fs::remove_dir_all(&daemon.config.data_dir);
    }
}
