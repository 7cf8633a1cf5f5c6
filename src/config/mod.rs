//! Engine configuration.
//!
//! Defaults are sized for the 4GB RAM / 2 vCPU deployment target;
//! sub-component configs live next to their components.

pub mod policy;

pub use policy::{PolicyTable, SitePolicy, site_for_url};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard ceiling on concurrently running jobs across all users.
    pub system_job_limit: usize,
    /// Ceiling on concurrently running jobs per user.
    pub per_user_job_limit: usize,
    /// Maximum fetch workers a single job may run, so one job cannot
    /// starve the browser pool for the rest.
    pub per_job_worker_cap: usize,
    /// Timeout for a single lightweight HTTP fetch, in seconds.
    pub http_timeout_secs: u64,
}

impl EngineConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_job_limit: 10,
            per_user_job_limit: 5,
            per_job_worker_cap: 2,
            http_timeout_secs: 30,
        }
    }
}
