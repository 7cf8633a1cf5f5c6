//! Render backend seam.
//!
//! The pool manages opaque rendering sessions through these traits, so
//! the production Chromium backend and the stub backends used in tests
//! are interchangeable. Trait methods return boxed futures to stay
//! object-safe.

use anyhow::Context;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::EngineError;

/// A live rendering session, held exclusively by one caller at a time.
pub trait RenderSession: Send + 'static {
    /// Navigate to `url`, wait `settle` for scripts to run, and return
    /// the rendered document.
    fn render<'a>(
        &'a mut self,
        url: &'a str,
        settle: Duration,
    ) -> BoxFuture<'a, Result<String, EngineError>>;

    /// Tear the session down. Must be safe to call on a broken session.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Factory for rendering sessions. Launching is expensive; the pool
/// amortizes it through reuse.
pub trait RenderBackend: Send + Sync + 'static {
    fn launch(&self) -> BoxFuture<'_, Result<Box<dyn RenderSession>, EngineError>>;
}

/// Chromium-backed production implementation.
#[derive(Debug, Clone)]
pub struct ChromiumBackend {
    headless: bool,
    request_timeout: Duration,
}

impl ChromiumBackend {
    pub fn new(headless: bool) -> Self {
        Self {
            headless,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for ChromiumBackend {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RenderBackend for ChromiumBackend {
    fn launch(&self) -> BoxFuture<'_, Result<Box<dyn RenderSession>, EngineError>> {
        Box::pin(async move {
            let session = ChromiumSession::launch(self.headless, self.request_timeout)
                .await
                .map_err(|e| EngineError::Render(format!("{e:#}")))?;
            Ok(Box::new(session) as Box<dyn RenderSession>)
        })
    }
}

struct ChromiumSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    /// Per-session profile; removed when the TempDir drops.
    _profile_dir: TempDir,
}

impl ChromiumSession {
    async fn launch(headless: bool, request_timeout: Duration) -> anyhow::Result<Self> {
        let profile_dir = tempfile::Builder::new()
            .prefix("crawlcore-profile-")
            .tempdir()
            .context("failed to create browser profile directory")?;

        let mut builder = BrowserConfigBuilder::default()
            .request_timeout(request_timeout)
            .window_size(1920, 1080)
            .user_data_dir(profile_dir.path());

        if headless {
            builder = builder.headless_mode(HeadlessMode::default());
        } else {
            builder = builder.with_head();
        }

        // Memory-trimmed flag set for the 4GB target: no images, no
        // extensions, capped JS heap.
        builder = builder
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--disable-default-apps")
            .arg("--disable-sync")
            .arg("--blink-settings=imagesEnabled=false")
            .arg("--js-flags=--max-old-space-size=256")
            .arg("--hide-scrollbars")
            .arg("--mute-audio")
            .arg("--metrics-recording-only")
            .arg("--no-first-run");

        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch browser")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("browser handler event error: {e}");
                }
            }
        });

        Ok(Self {
            browser,
            handler_task,
            _profile_dir: profile_dir,
        })
    }
}

impl RenderSession for ChromiumSession {
    fn render<'a>(
        &'a mut self,
        url: &'a str,
        settle: Duration,
    ) -> BoxFuture<'a, Result<String, EngineError>> {
        Box::pin(async move {
            let render_err = |e: chromiumoxide::error::CdpError| EngineError::Render(e.to_string());

            let page = self.browser.new_page("about:blank").await.map_err(render_err)?;

            let result = async {
                page.goto(url).await.map_err(render_err)?;
                page.wait_for_navigation().await.map_err(render_err)?;
                tokio::time::sleep(settle).await;
                page.content().await.map_err(render_err)
            }
            .await;

            // The page is closed on both paths so a failed render does
            // not leak tabs into a reused session.
            if let Err(e) = page.close().await {
                debug!("failed to close page after render: {e}");
            }

            result
        })
    }

    fn close(mut self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(e) = self.browser.close().await {
                warn!("browser close failed: {e}");
            }
            if let Err(e) = self.browser.wait().await {
                debug!("browser wait after close failed: {e}");
            }
            self.handler_task.abort();
        })
    }
}
