//! Recurring job scheduling with per-job state machines.
//!
//! The scheduler polls on a fixed one-second tick and launches every due,
//! idle job as an independent task; the tick loop itself never waits on job
//! work. Due times are kept on the monotonic clock so they derive from each
//! completion, not from wall-clock drift of the loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProbeError;

/// Delay before a freshly registered job first becomes due.
const START_DELAY: Duration = Duration::from_secs(5);

pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), ProbeError>> + Send>>;
pub type JobFn = Arc<dyn Fn(CancellationToken) -> JobFuture + Send + Sync>;

/// A named unit of recurring work: an interval, a run function and mutable
/// execution state. State is only touched by the scheduler's execution
/// wrapper, under the job's own lock.
pub struct Job {
    name: String,
    interval: Duration,
    run: JobFn,
    state: Mutex<JobState>,
}

struct JobState {
    last_run: Option<OffsetDateTime>,
    next_run: Instant,
    running: bool,
    last_error: Option<String>,
    error_count: u32,
}

/// Point-in-time snapshot of a job, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub interval_secs: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub next_run: OffsetDateTime,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub running: bool,
}

impl Job {
    pub fn new<F>(name: impl Into<String>, interval: Duration, run: F) -> Self
    where
        F: Fn(CancellationToken) -> JobFuture + Send + Sync + 'static,
    {
        Job {
            name: name.into(),
            interval,
            run: Arc::new(run),
            state: Mutex::new(JobState {
                last_run: None,
                next_run: Instant::now() + START_DELAY,
                running: false,
                last_error: None,
                error_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn status(&self) -> JobStatus {
        let st = self.state.lock().unwrap();
        let now = Instant::now();
        let now_wall = OffsetDateTime::now_utc();
        let next_run = if st.next_run > now {
            let until = st.next_run - now;
            now_wall + time::Duration::try_from(until).unwrap_or(time::Duration::ZERO)
        } else {
            now_wall
        };
        JobStatus {
            name: self.name.clone(),
            interval_secs: self.interval.as_secs(),
            last_run: st.last_run,
            next_run,
            last_error: st.last_error.clone(),
            error_count: st.error_count,
            running: st.running,
        }
    }
}

/// Owns the job set and the polling loop.
pub struct Scheduler {
    jobs: RwLock<Vec<Arc<Job>>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Scheduler {
            jobs: RwLock::new(Vec::new()),
            cancel,
        }
    }

    /// Register a job. It first becomes due [`START_DELAY`] from now.
    pub fn add_job(&self, job: Job) {
        self.jobs.write().unwrap().push(Arc::new(job));
    }

    /// Run the tick loop until the root token fires.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(jobs = self.jobs.read().unwrap().len(), "scheduler started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("scheduler stopping");
                    return;
                }
                _ = ticker.tick() => self.check_jobs(),
            }
        }
    }

    fn check_jobs(&self) {
        let jobs: Vec<Arc<Job>> = self.jobs.read().unwrap().clone();
        let now = Instant::now();
        for job in jobs {
            let due = {
                let st = job.state.lock().unwrap();
                !st.running && now >= st.next_run
            };
            if due {
                let cancel = self.cancel.clone();
                tokio::spawn(execute(job, cancel));
            }
        }
    }

    /// Force a job to become due immediately. Leaves interval and error
    /// state untouched. Returns false for unknown names.
    pub fn trigger_job(&self, name: &str) -> bool {
        let jobs = self.jobs.read().unwrap();
        match jobs.iter().find(|j| j.name == name) {
            Some(job) => {
                job.state.lock().unwrap().next_run = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.jobs.read().unwrap().iter().map(|j| j.status()).collect()
    }
}

/// Run one job execution: flip to running under a double-check, bound the
/// run by the job's own interval, then reschedule from the completion.
async fn execute(job: Arc<Job>, cancel: CancellationToken) {
    {
        let mut st = job.state.lock().unwrap();
        if st.running {
            return;
        }
        st.running = true;
        st.last_run = Some(OffsetDateTime::now_utc());
    }
    debug!(job = %job.name, "job started");

    let child = cancel.child_token();
    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(ProbeError::Cancelled),
        res = tokio::time::timeout(job.interval, (job.run)(child.clone())) => {
            match res {
                Ok(r) => r,
                Err(_) => {
                    child.cancel();
                    Err(ProbeError::Timeout(job.interval))
                }
            }
        }
    };

    let now = Instant::now();
    let mut st = job.state.lock().unwrap();
    st.running = false;
    match outcome {
        Ok(()) => {
            debug!(job = %job.name, "job completed");
            st.last_error = None;
            st.next_run = now + job.interval;
        }
        Err(err) if err.is_cancelled() => {
            debug!(job = %job.name, "job cancelled");
            st.next_run = now + job.interval;
        }
        Err(err) => {
            warn!(job = %job.name, error = %err, "job failed");
            st.last_error = Some(err.to_string());
            st.error_count += 1;
            // Shorter retry under failure; the probes are idempotent reads.
            st.next_run = now + job.interval / 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_job(
        name: impl Into<String>,
        interval: Duration,
        counter: Arc<AtomicU32>,
        fail: bool,
    ) -> Job {
        Job::new(name, interval, move |_cancel| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(ProbeError::Other("boom".into()))
                } else {
                    Ok(())
                }
            })
        })
    }

    async fn run_for(scheduler: Arc<Scheduler>, dur: Duration) {
        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run().await }
        });
        tokio::time::sleep(dur).await;
        scheduler.cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_backs_off_to_half_interval() {
        let scheduler = Arc::new(Scheduler::new(CancellationToken::new()));
        let runs = Arc::new(AtomicU32::new(0));
        scheduler.add_job(counting_job(
            "bad",
            Duration::from_secs(10),
            runs.clone(),
            true,
        ));

        // Start delay 5s, then every interval/2 = 5s: runs at ~5, 10, 15.
        run_for(scheduler.clone(), Duration::from_secs(17)).await;

        let status = &scheduler.statuses()[0];
        let count = runs.load(Ordering::SeqCst);
        assert!(count >= 3, "expected >= 3 runs at half interval, got {count}");
        assert_eq!(status.error_count, count);
        assert!(status.last_error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_job_keeps_full_interval() {
        let scheduler = Arc::new(Scheduler::new(CancellationToken::new()));
        let runs = Arc::new(AtomicU32::new(0));
        scheduler.add_job(counting_job(
            "good",
            Duration::from_secs(10),
            runs.clone(),
            false,
        ));

        // Start delay 5s, then every 10s: runs at ~5, 15 only.
        run_for(scheduler.clone(), Duration::from_secs(17)).await;

        let status = &scheduler.statuses()[0];
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(status.error_count, 0);
        assert!(status.last_error.is_none());
        assert!(status.last_run.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_execution_per_job() {
        let scheduler = Arc::new(Scheduler::new(CancellationToken::new()));
        let runs = Arc::new(AtomicU32::new(0));
        let runs2 = runs.clone();
        scheduler.add_job(Job::new(
            "slow",
            Duration::from_secs(60),
            move |_cancel| {
                let runs = runs2.clone();
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(20)).await;
                    Ok(())
                })
            },
        ));

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run().await }
        });
        tokio::time::sleep(Duration::from_secs(7)).await;
        // First execution is in flight; repeated triggers must not overlap it.
        assert!(scheduler.trigger_job("slow"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(scheduler.trigger_job("slow"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        scheduler.cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_makes_job_due_now() {
        let scheduler = Arc::new(Scheduler::new(CancellationToken::new()));
        let runs = Arc::new(AtomicU32::new(0));
        scheduler.add_job(counting_job(
            "manual",
            Duration::from_secs(3600),
            runs.clone(),
            false,
        ));
        assert!(!scheduler.trigger_job("missing"));

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run().await }
        });
        // Before the 5s start delay nothing has run.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(scheduler.trigger_job("manual"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        scheduler.cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_a_failure() {
        let cancel = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(cancel.clone()));
        scheduler.add_job(Job::new(
            "patient",
            Duration::from_secs(600),
            move |token| {
                Box::pin(async move {
                    token.cancelled().await;
                    Err(ProbeError::Cancelled)
                })
            },
        ));

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run().await }
        });
        // Let the job launch, then shut the daemon down mid-execution.
        tokio::time::sleep(Duration::from_secs(7)).await;
        cancel.cancel();
        handle.await.unwrap();
        // Give the execution wrapper a beat to record the outcome.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = &scheduler.statuses()[0];
        assert_eq!(status.error_count, 0);
        assert!(status.last_error.is_none());
        assert!(!status.running);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_job_times_out_and_counts_as_failure() {
        let scheduler = Arc::new(Scheduler::new(CancellationToken::new()));
        scheduler.add_job(Job::new("hung", Duration::from_secs(4), |_cancel| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
        }));

        // Due at 5s, timeout after interval (4s) more.
        run_for(scheduler.clone(), Duration::from_secs(11)).await;

        let status = &scheduler.statuses()[0];
        assert!(status.error_count >= 1);
        assert!(status.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn staggered_jobs_fire_at_their_own_cadence() {
        let scheduler = Arc::new(Scheduler::new(CancellationToken::new()));
        let counts: Vec<Arc<AtomicU32>> =
            (0..3).map(|_| Arc::new(AtomicU32::new(0))).collect();
        for (i, count) in counts.iter().enumerate() {
            scheduler.add_job(counting_job(
                format!("job{}", i + 1),
                Duration::from_secs(i as u64 + 1),
                count.clone(),
                false,
            ));
        }

        // 5 seconds of useful schedule after the 5s registration stagger.
        run_for(scheduler.clone(), Duration::from_secs(11)).await;

        assert!(counts[0].load(Ordering::SeqCst) >= 4);
        assert!(counts[1].load(Ordering::SeqCst) >= 2);
        assert!(counts[2].load(Ordering::SeqCst) >= 1);
    }
}
