//! Probe error taxonomy shared across all probe modules.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by probes and job executions.
///
/// Transient per-item I/O failures (a refused connect, a slow provider) are
/// not represented here; probes encode those as absence of a result. This
/// type covers whole-operation failures plus the two cases the scheduler
/// must tell apart from ordinary failure: cancellation and timeout.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The subnet/range input could not be parsed or is unusable.
    #[error("invalid address range: {0}")]
    InvalidRange(String),

    /// No public-IP provider returned a usable address.
    #[error("no provider returned a usable address")]
    NoConsensus,

    /// Both traceroute invocations (default and ICMP fallback) failed.
    #[error("traceroute failed: {0}")]
    TracerouteFailed(String),

    /// The job-level deadline elapsed before the probe finished.
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// The root cancellation token fired; the daemon is shutting down.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration detected at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The storage collaborator rejected a result.
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ProbeError {
    /// True when this error means shutdown rather than probe failure.
    /// Cancelled executions must not count against a job's error state.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProbeError::Cancelled)
    }
}

pub type ProbeResult<T> = Result<T, ProbeError>;
