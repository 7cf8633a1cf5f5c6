//! Hybrid page fetcher: lightweight HTTP first, browser rendering as
//! the fallback or when the site's policy demands it.
//!
//! The HTTP path costs no pool capacity, so static sites never touch a
//! browser worker. A short HTTP body is treated as a bot wall and the
//! fetch is escalated to the rendered path. Both paths run under the
//! per-site retry schedule and circuit breaker.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser_pool::BrowserPool;
use crate::config::policy::{PolicyTable, SitePolicy};
use crate::error::EngineError;
use crate::retry::{self, CircuitBreaker, RetryPolicy};

/// Which strategy produced the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Http,
    Rendered,
}

/// A fetched page, ready for downstream extraction.
#[derive(Debug, Clone)]
pub struct PageContent {
    pub url: String,
    pub site: String,
    pub body: String,
    pub mode: FetchMode,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub http_timeout: Duration,
    /// An HTTP body below this size is treated as bot-blocked and the
    /// fetch escalates to the browser.
    pub min_http_body_bytes: usize,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            min_http_body_bytes: 2048,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

pub struct HybridFetcher {
    http: reqwest::Client,
    pool: Arc<BrowserPool>,
    policies: Arc<PolicyTable>,
    breaker: Arc<CircuitBreaker>,
    min_http_body_bytes: usize,
}

impl HybridFetcher {
    pub fn new(
        config: FetcherConfig,
        pool: Arc<BrowserPool>,
        policies: Arc<PolicyTable>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, EngineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        if let Ok(ua) = HeaderValue::from_str(&config.user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            http,
            pool,
            policies,
            breaker,
            min_http_body_bytes: config.min_http_body_bytes,
        })
    }

    /// Fetch one URL under its site's policy.
    ///
    /// Strategy order: HTTP first unless the policy requires rendering;
    /// an HTTP failure or a bot-block escalates to the browser. An Open
    /// circuit fails fast on either path. Once every strategy and retry
    /// is spent the error is `FetchFailed` carrying the last cause.
    pub async fn fetch(&self, url: &str) -> Result<PageContent, EngineError> {
        let (site, policy) = self.policies.policy_for_url(url)?;
        let schedule = RetryPolicy::for_site(&policy);

        if !policy.requires_rendering {
            match self.fetch_http(url, &site, &schedule).await {
                Ok(page) => return Ok(page),
                // The browser path would be rejected by the same
                // breaker; do not burn a worker finding that out.
                Err(e @ EngineError::CircuitOpen { .. }) => return Err(e),
                Err(e) => {
                    info!(site = %site, error = %e, "http fetch failed, escalating to browser");
                }
            }
        }

        self.fetch_rendered(url, &site, &policy, &schedule).await
    }

    async fn fetch_http(
        &self,
        url: &str,
        site: &str,
        schedule: &RetryPolicy,
    ) -> Result<PageContent, EngineError> {
        retry::execute(site, &self.breaker, schedule, |attempt| async move {
            debug!(site, attempt, "http fetch");
            let response = self.http.get(url).send().await?.error_for_status()?;
            let body = response.text().await?;
            if body.len() < self.min_http_body_bytes {
                return Err(EngineError::Transient(format!(
                    "http body of {} bytes looks bot-blocked",
                    body.len()
                )));
            }
            Ok(PageContent {
                url: url.to_string(),
                site: site.to_string(),
                body,
                mode: FetchMode::Http,
                fetched_at: Utc::now(),
            })
        })
        .await
    }

    async fn fetch_rendered(
        &self,
        url: &str,
        site: &str,
        policy: &SitePolicy,
        schedule: &RetryPolicy,
    ) -> Result<PageContent, EngineError> {
        let settle = Duration::from_secs(policy.wait_time_secs);
        let result = retry::execute(site, &self.breaker, schedule, |attempt| async move {
            debug!(site, attempt, "rendered fetch");
            let mut guard = match self.pool.acquire().await {
                // A forced reset invalidated the wait; the rebuilt pool
                // is expected to serve the second attempt.
                Err(EngineError::PoolReset) => {
                    warn!(site, "pool reset mid-acquire, retrying acquisition");
                    self.pool.acquire().await?
                }
                other => other?,
            };
            let body = guard.render(url, settle).await?;
            Ok(PageContent {
                url: url.to_string(),
                site: site.to_string(),
                body,
                mode: FetchMode::Rendered,
                fetched_at: Utc::now(),
            })
        })
        .await;

        result.map_err(|e| match e {
            EngineError::RetriesExhausted { .. } => EngineError::FetchFailed {
                site: site.to_string(),
                cause: Box::new(e),
            },
            other => other,
        })
    }
}
