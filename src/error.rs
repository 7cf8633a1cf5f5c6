//! Error taxonomy for the crawl execution engine.
//!
//! Per-item failures never abort a job; the variants here encode which
//! layer gave up and what the caller is expected to do about it.

use std::time::Duration;
use thiserror::Error;

/// Why a job submission was rejected at the admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionReason {
    #[error("system-wide job limit ({0}) reached")]
    SystemLimit(usize),
    #[error("per-user job limit ({0}) reached")]
    UserLimit(usize),
    #[error("admission paused under memory pressure")]
    MemoryPressure,
}

/// Unified error type surfaced by every engine component.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-level failure worth retrying (timeout, reset, 5xx).
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// HTTP client failure. Treated as transient by the retry layer.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Browser-side failure (launch, navigation, content read).
    #[error("render error: {0}")]
    Render(String),

    /// The site is isolated; callers should try again after the cooldown.
    #[error("circuit open for site {site}")]
    CircuitOpen { site: String },

    /// No worker became available before the acquisition timeout.
    #[error("no browser worker available within {timeout:?}")]
    PoolExhausted { timeout: Duration },

    /// Acquisition was interrupted by a forced pool reset. Callers retry
    /// the acquisition once.
    #[error("browser pool was reset while acquiring a worker")]
    PoolReset,

    /// The pool has been shut down and accepts no further acquires.
    #[error("browser pool is shut down")]
    PoolClosed,

    /// Submission rejected outright; no partial job state was created.
    #[error("admission denied: {0}")]
    AdmissionDenied(AdmissionReason),

    /// The retry layer gave up. `source` is the last underlying cause.
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    /// A single URL could not be fetched by either strategy.
    #[error("fetch failed for site {site}")]
    FetchFailed {
        site: String,
        #[source]
        cause: Box<EngineError>,
    },

    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl EngineError {
    /// Whether the retry layer should attempt this operation again.
    ///
    /// Circuit-open and pool-accounting errors are surfaced as-is:
    /// retrying a circuit rejection would bypass the breaker, and an
    /// exhausted pool is load to report, not a fault to paper over.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Http(_) | Self::Render(_))
    }
}

/// Error fragments that indicate the underlying browser session is gone
/// rather than the individual request having failed.
///
/// A worker whose render fails with one of these is destroyed instead of
/// being returned to the pool.
const SESSION_DEAD_KEYWORDS: &[&str] = &[
    "connection refused",
    "connection aborted",
    "connection reset",
    "connection closed",
    "broken pipe",
    "session not created",
    "invalid session",
    "no such session",
    "session timed out",
    "browser closed",
    "websocket",
];

/// Classify an error message as a dead browser session.
pub fn is_session_dead(message: &str) -> bool {
    let lower = message.to_lowercase();
    SESSION_DEAD_KEYWORDS.iter().any(|kw| lower.contains(kw))
}
