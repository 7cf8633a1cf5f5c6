//! Per-site fetch policy table.
//!
//! Maps a site identifier (URL host) to its fetch policy. The table is
//! read-only at crawl time and reloadable as a whole: `reload` swaps the
//! entire mapping atomically so readers never observe a partial update.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::EngineError;

/// Fetch policy for a single site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitePolicy {
    /// Whether the site needs full browser rendering (JS-driven markup).
    /// When false, a lightweight HTTP fetch is tried first.
    #[serde(default = "default_requires_rendering", alias = "requires_javascript")]
    pub requires_rendering: bool,
    /// Settle time after navigation before reading rendered content.
    #[serde(default = "default_wait_time", alias = "wait_time")]
    pub wait_time_secs: u64,
    /// Retry attempts for a fetch against this site.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// How much parallelism the site tolerates; feeds the per-job
    /// worker count (always capped by the engine).
    #[serde(default = "default_weight")]
    pub concurrency_weight: u32,
}

fn default_requires_rendering() -> bool {
    true
}
fn default_wait_time() -> u64 {
    3
}
fn default_retry_count() -> u32 {
    3
}
fn default_weight() -> u32 {
    1
}

impl Default for SitePolicy {
    fn default() -> Self {
        Self {
            requires_rendering: true,
            wait_time_secs: 3,
            retry_count: 3,
            concurrency_weight: 1,
        }
    }
}

/// On-disk policy file format: a site map plus the fallback policy for
/// unknown hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub sites: HashMap<String, SitePolicy>,
    #[serde(default)]
    pub defaults: SitePolicy,
}

/// Reloadable site policy table.
///
/// Lookups clone the small policy struct out so callers never hold the
/// lock across an await point.
pub struct PolicyTable {
    inner: RwLock<Arc<PolicyFile>>,
}

impl PolicyTable {
    pub fn new(file: PolicyFile) -> Self {
        Self {
            inner: RwLock::new(Arc::new(file)),
        }
    }

    /// A table with no site entries; every host gets the default policy.
    pub fn with_defaults(defaults: SitePolicy) -> Self {
        Self::new(PolicyFile {
            sites: HashMap::new(),
            defaults,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: PolicyFile = serde_json::from_str(&raw)?;
        info!(sites = file.sites.len(), "loaded site policy table");
        Ok(Self::new(file))
    }

    /// Policy for a site id. An entry matches when the host equals the
    /// entry key or is a subdomain of it.
    pub fn policy_for_site(&self, site: &str) -> SitePolicy {
        let table = self.inner.read().clone();
        if let Some(policy) = table.sites.get(site) {
            return policy.clone();
        }
        for (key, policy) in &table.sites {
            if site.ends_with(&format!(".{key}")) {
                return policy.clone();
            }
        }
        table.defaults.clone()
    }

    pub fn policy_for_url(&self, url: &str) -> Result<(String, SitePolicy), EngineError> {
        let site = site_for_url(url)?;
        let policy = self.policy_for_site(&site);
        Ok((site, policy))
    }

    /// Swap the whole table. Readers see either the old or the new
    /// mapping, never a mix.
    pub fn reload(&self, file: PolicyFile) {
        let sites = file.sites.len();
        *self.inner.write() = Arc::new(file);
        info!(sites, "site policy table reloaded");
    }

    pub fn site_count(&self) -> usize {
        self.inner.read().sites.len()
    }
}

/// Derive the site identifier (host) from a URL.
pub fn site_for_url(url: &str) -> Result<String, EngineError> {
    let parsed = url::Url::parse(url).map_err(|e| EngineError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    parsed
        .host_str()
        .map(|h| h.trim_start_matches("www.").to_string())
        .ok_or_else(|| EngineError::InvalidUrl {
            url: url.to_string(),
            reason: "url has no host".to_string(),
        })
}
