//! Circuit breaker for per-site failure isolation.
//!
//! Tracks site health across three states:
//! - Closed: normal operation, requests proceed
//! - Open: too many consecutive failures, requests fast-fail
//! - `HalfOpen`: cooldown elapsed, a single probe is allowed
//!
//! The Open state holds only while wall-clock time is inside the
//! cooldown window; the transition to `HalfOpen` happens lazily on the
//! next check, without external action. While `HalfOpen`, exactly one
//! in-flight probe is admitted; everyone else keeps fast-failing until
//! the probe settles the state.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

use crate::error::EngineError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

/// Health tracking for a single site.
#[derive(Debug, Clone)]
pub struct SiteHealth {
    pub state: CircuitState,
    /// Consecutive failures without an intervening success.
    pub consecutive_failures: u32,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub last_failure: Option<Instant>,
    /// When the circuit last opened; anchors the cooldown window.
    pub opened_at: Option<Instant>,
    /// A `HalfOpen` probe has been handed out and not yet resolved.
    pub probe_in_flight: bool,
}

impl SiteHealth {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_attempts: 0,
            total_successes: 0,
            last_failure: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Per-site circuit breaker.
///
/// Site entries are created lazily and never removed; `reset_all`
/// (driven by a policy reload) returns every entry to Closed.
pub struct CircuitBreaker {
    sites: DashMap<String, SiteHealth>,
    /// Consecutive failures before the circuit opens.
    trip_threshold: u32,
    /// How long an opened circuit rejects calls before allowing a probe.
    cooldown: Duration,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(trip_threshold: u32, cooldown: Duration) -> Self {
        Self {
            sites: DashMap::new(),
            trip_threshold,
            cooldown,
        }
    }

    /// Gate a call against the site's circuit.
    ///
    /// Returns `Ok(())` when the call may proceed. An Open circuit whose
    /// cooldown has elapsed transitions to `HalfOpen` here and admits the
    /// caller as the single probe.
    pub fn check(&self, site: &str) -> Result<(), EngineError> {
        let mut health = self
            .sites
            .entry(site.to_string())
            .or_insert_with(SiteHealth::new);

        match health.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = health.opened_at.map(|t| t.elapsed());
                if let Some(elapsed) = elapsed
                    && elapsed >= self.cooldown
                {
                    health.state = CircuitState::HalfOpen;
                    health.probe_in_flight = true;
                    info!("circuit HALF-OPEN for site {site} after {elapsed:?} cooldown");
                    return Ok(());
                }
                debug!("circuit OPEN for site {site}, fast-failing");
                Err(EngineError::CircuitOpen {
                    site: site.to_string(),
                })
            }
            CircuitState::HalfOpen => {
                if health.probe_in_flight {
                    debug!("circuit HALF-OPEN for site {site}, probe already in flight");
                    return Err(EngineError::CircuitOpen {
                        site: site.to_string(),
                    });
                }
                health.probe_in_flight = true;
                Ok(())
            }
        }
    }

    /// Record a successful call: failures reset, circuit closes.
    pub fn record_success(&self, site: &str) {
        let mut health = self
            .sites
            .entry(site.to_string())
            .or_insert_with(SiteHealth::new);
        health.total_attempts += 1;
        health.total_successes += 1;
        health.consecutive_failures = 0;
        health.probe_in_flight = false;
        if health.state != CircuitState::Closed {
            info!("circuit CLOSED for site {site}");
        }
        health.state = CircuitState::Closed;
        health.opened_at = None;
    }

    /// Record a failed call. A `HalfOpen` probe failure reopens the
    /// circuit with a fresh cooldown; in Closed, crossing the trip
    /// threshold opens it.
    pub fn record_failure(&self, site: &str, error: &str) {
        let mut health = self
            .sites
            .entry(site.to_string())
            .or_insert_with(SiteHealth::new);
        health.total_attempts += 1;
        health.consecutive_failures += 1;
        health.last_failure = Some(Instant::now());

        match health.state {
            CircuitState::HalfOpen => {
                health.state = CircuitState::Open;
                health.opened_at = Some(Instant::now());
                health.probe_in_flight = false;
                warn!("circuit RE-OPENED for site {site}: probe failed: {error}");
            }
            CircuitState::Closed if health.consecutive_failures >= self.trip_threshold => {
                health.state = CircuitState::Open;
                health.opened_at = Some(Instant::now());
                warn!(
                    "circuit OPEN for site {site} after {} consecutive failures, last: {error}",
                    health.consecutive_failures
                );
            }
            _ => {
                debug!(
                    "circuit failure for site {site} ({}/{}): {error}",
                    health.consecutive_failures, self.trip_threshold
                );
            }
        }
    }

    /// Give back a `HalfOpen` probe slot without deciding the state.
    ///
    /// Used when the probe attempt was aborted by infrastructure (pool
    /// exhausted, reset, shutdown) before it ever reached the site: the
    /// probe produced no verdict, so the slot reopens for the next
    /// caller instead of isolating the site behind a flag that nothing
    /// will ever clear.
    pub fn release_probe(&self, site: &str) {
        if let Some(mut health) = self.sites.get_mut(site)
            && health.state == CircuitState::HalfOpen
            && health.probe_in_flight
        {
            health.probe_in_flight = false;
            debug!("probe for site {site} aborted without a verdict, slot released");
        }
    }

    /// Effective state for reporting; performs the lazy Open→`HalfOpen`
    /// transition so callers never observe a stale Open past its cooldown.
    pub fn state(&self, site: &str) -> CircuitState {
        let Some(mut health) = self.sites.get_mut(site) else {
            return CircuitState::Closed;
        };
        if health.state == CircuitState::Open
            && let Some(opened) = health.opened_at
            && opened.elapsed() >= self.cooldown
        {
            health.state = CircuitState::HalfOpen;
        }
        health.state
    }

    pub fn health(&self, site: &str) -> Option<SiteHealth> {
        self.sites.get(site).map(|h| h.value().clone())
    }

    /// Sites currently isolating calls.
    pub fn open_sites(&self) -> Vec<String> {
        self.sites
            .iter()
            .filter(|e| e.value().state == CircuitState::Open)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Return every tracked site to Closed. Invoked on policy reload;
    /// entries themselves persist for the process lifetime.
    pub fn reset_all(&self) {
        for mut entry in self.sites.iter_mut() {
            let health = entry.value_mut();
            health.state = CircuitState::Closed;
            health.consecutive_failures = 0;
            health.opened_at = None;
            health.probe_in_flight = false;
        }
        info!("circuit breaker reset for {} sites", self.sites.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_on_success() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(cb.check("example.com").is_ok());
        cb.record_success("example.com");
        let health = cb.health("example.com").expect("tracked after success");
        assert_eq!(health.state, CircuitState::Closed);
        assert_eq!(health.total_successes, 1);
    }

    #[test]
    fn opens_after_threshold_and_fast_fails() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..2 {
            cb.record_failure("example.com", "timeout");
            assert!(cb.check("example.com").is_ok());
        }
        cb.record_failure("example.com", "timeout");
        assert_eq!(cb.state("example.com"), CircuitState::Open);
        assert!(matches!(
            cb.check("example.com"),
            Err(EngineError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(20));
        cb.record_failure("example.com", "boom");
        cb.record_failure("example.com", "boom");
        assert_eq!(cb.state("example.com"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));

        // First caller after the cooldown becomes the probe.
        assert!(cb.check("example.com").is_ok());
        assert_eq!(cb.state("example.com"), CircuitState::HalfOpen);
        // Concurrent caller is rejected while the probe is in flight.
        assert!(cb.check("example.com").is_err());

        cb.record_success("example.com");
        assert_eq!(cb.state("example.com"), CircuitState::Closed);
        assert!(cb.check("example.com").is_ok());
    }

    #[test]
    fn probe_failure_reopens_with_fresh_cooldown() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(20));
        cb.record_failure("example.com", "boom");
        cb.record_failure("example.com", "boom");
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.check("example.com").is_ok());

        cb.record_failure("example.com", "probe failed");
        assert_eq!(cb.state("example.com"), CircuitState::Open);
        assert!(cb.check("example.com").is_err());
    }

    #[test]
    fn released_probe_slot_admits_the_next_caller() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(20));
        cb.record_failure("example.com", "boom");
        cb.record_failure("example.com", "boom");
        std::thread::sleep(Duration::from_millis(30));

        // Probe admitted, then aborted with no success or failure.
        assert!(cb.check("example.com").is_ok());
        assert!(cb.check("example.com").is_err());
        cb.release_probe("example.com");

        // Still HalfOpen, and the slot is available again.
        assert_eq!(cb.state("example.com"), CircuitState::HalfOpen);
        assert!(cb.check("example.com").is_ok());
        cb.record_success("example.com");
        assert_eq!(cb.state("example.com"), CircuitState::Closed);
    }

    #[test]
    fn reset_all_closes_everything() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(60));
        cb.record_failure("a.com", "x");
        cb.record_failure("b.com", "y");
        assert_eq!(cb.open_sites().len(), 2);
        cb.reset_all();
        assert!(cb.open_sites().is_empty());
        assert!(cb.check("a.com").is_ok());
        // Entries persist for reporting.
        assert!(cb.health("b.com").is_some());
    }
}
