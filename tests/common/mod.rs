#![allow(dead_code)]

use crawlcore::{EngineError, MemoryProbe, RenderBackend, RenderSession};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Route engine logs through a test subscriber; `RUST_LOG` filters as
/// usual. Safe to call from every test, only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared counters so tests can assert on backend activity.
#[derive(Default)]
pub struct StubCounters {
    pub launched: AtomicUsize,
    pub open: AtomicUsize,
    pub peak_open: AtomicUsize,
    pub renders: AtomicUsize,
    pub closed: AtomicUsize,
}

/// In-memory render backend standing in for Chromium.
pub struct StubBackend {
    pub counters: Arc<StubCounters>,
    render_delay: Duration,
    /// Fail launches this many times before succeeding.
    launch_failures: AtomicUsize,
    /// URLs containing this substring fail with the given message.
    failure: Option<(String, String)>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(StubCounters::default()),
            render_delay: Duration::ZERO,
            launch_failures: AtomicUsize::new(0),
            failure: None,
        }
    }

    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    /// Renders of URLs containing `url_part` fail with `message`.
    pub fn with_render_failure(mut self, url_part: &str, message: &str) -> Self {
        self.failure = Some((url_part.to_string(), message.to_string()));
        self
    }

    pub fn with_launch_failures(self, count: usize) -> Self {
        self.launch_failures.store(count, Ordering::SeqCst);
        self
    }
}

impl RenderBackend for StubBackend {
    fn launch(&self) -> BoxFuture<'_, Result<Box<dyn RenderSession>, EngineError>> {
        Box::pin(async move {
            let remaining = self.launch_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.launch_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::Render("stub launch refused".to_string()));
            }
            let id = self.counters.launched.fetch_add(1, Ordering::SeqCst) + 1;
            let open = self.counters.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.peak_open.fetch_max(open, Ordering::SeqCst);
            Ok(Box::new(StubSession {
                id,
                counters: Arc::clone(&self.counters),
                render_delay: self.render_delay,
                failure: self.failure.clone(),
            }) as Box<dyn RenderSession>)
        })
    }
}

struct StubSession {
    id: usize,
    counters: Arc<StubCounters>,
    render_delay: Duration,
    failure: Option<(String, String)>,
}

impl RenderSession for StubSession {
    fn render<'a>(
        &'a mut self,
        url: &'a str,
        _settle: Duration,
    ) -> BoxFuture<'a, Result<String, EngineError>> {
        Box::pin(async move {
            self.counters.renders.fetch_add(1, Ordering::SeqCst);
            if !self.render_delay.is_zero() {
                tokio::time::sleep(self.render_delay).await;
            }
            if let Some((part, message)) = &self.failure
                && url.contains(part.as_str())
            {
                return Err(EngineError::Render(message.clone()));
            }
            Ok(format!(
                "<html data-session=\"{}\"><body>{url}</body></html>",
                self.id
            ))
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.counters.open.fetch_sub(1, Ordering::SeqCst);
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// Probe that always reads zero; monitor tests drive classification
/// with synthetic samples instead.
pub struct ZeroProbe;

impl MemoryProbe for ZeroProbe {
    fn resident_bytes(&self) -> u64 {
        0
    }
}
