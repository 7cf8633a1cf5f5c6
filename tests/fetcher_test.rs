mod common;

use common::{StubBackend, init_tracing};
use crawlcore::{
    BrowserPool, BrowserPoolConfig, CircuitBreaker, EngineError, FetchMode, FetcherConfig,
    HybridFetcher, PolicyTable, SitePolicy,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn fast_policy(requires_rendering: bool) -> SitePolicy {
    SitePolicy {
        requires_rendering,
        wait_time_secs: 0,
        retry_count: 1,
        concurrency_weight: 1,
    }
}

fn fetcher(backend: StubBackend, defaults: SitePolicy) -> HybridFetcher {
    init_tracing();
    let pool = BrowserPool::new(
        BrowserPoolConfig {
            acquire_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        Arc::new(backend),
    );
    let policies = Arc::new(PolicyTable::with_defaults(defaults));
    let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)));
    HybridFetcher::new(FetcherConfig::default(), pool, policies, breaker).expect("client builds")
}

#[tokio::test]
async fn http_path_serves_static_sites() {
    let mut server = mockito::Server::new_async().await;
    let body = format!("<html><body>{}</body></html>", "x".repeat(4096));
    let mock = server
        .mock("GET", "/page")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(&body)
        .create_async()
        .await;

    let fetcher = fetcher(StubBackend::new(), fast_policy(false));
    let page = fetcher
        .fetch(&format!("{}/page", server.url()))
        .await
        .expect("http fetch succeeds");

    mock.assert_async().await;
    assert_eq!(page.mode, FetchMode::Http);
    assert_eq!(page.site, "127.0.0.1");
    assert!(page.body.contains("xxxx"));
}

#[tokio::test]
async fn short_body_is_treated_as_bot_block_and_rendered() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/page")
        .with_status(200)
        .with_body("<html>denied</html>")
        .create_async()
        .await;

    let backend = StubBackend::new();
    let counters = Arc::clone(&backend.counters);
    let fetcher = fetcher(backend, fast_policy(false));
    let page = fetcher
        .fetch(&format!("{}/page", server.url()))
        .await
        .expect("rendered fallback succeeds");

    mock.assert_async().await;
    assert_eq!(page.mode, FetchMode::Rendered);
    assert_eq!(counters.renders.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn http_failure_falls_back_to_browser() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/page")
        .with_status(500)
        .create_async()
        .await;

    let fetcher = fetcher(StubBackend::new(), fast_policy(false));
    let page = fetcher
        .fetch(&format!("{}/page", server.url()))
        .await
        .expect("rendered fallback succeeds");

    mock.assert_async().await;
    assert_eq!(page.mode, FetchMode::Rendered);
}

#[tokio::test]
async fn rendering_policy_skips_http_entirely() {
    let mut server = mockito::Server::new_async().await;
    let mock = server.mock("GET", "/page").expect(0).create_async().await;

    let fetcher = fetcher(StubBackend::new(), fast_policy(true));
    let page = fetcher
        .fetch(&format!("{}/page", server.url()))
        .await
        .expect("rendered fetch succeeds");

    mock.assert_async().await;
    assert_eq!(page.mode, FetchMode::Rendered);
}

#[tokio::test]
async fn exhausted_strategies_surface_fetch_failed() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/page")
        .with_status(500)
        .create_async()
        .await;

    let backend = StubBackend::new().with_render_failure("/page", "render crashed");
    let fetcher = fetcher(backend, fast_policy(false));
    let err = fetcher
        .fetch(&format!("{}/page", server.url()))
        .await
        .expect_err("both strategies fail");

    match err {
        EngineError::FetchFailed { site, cause } => {
            assert_eq!(site, "127.0.0.1");
            assert!(matches!(*cause, EngineError::RetriesExhausted { .. }));
        }
        other => panic!("expected FetchFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn open_circuit_fails_fast_without_fetching() {
    let mut server = mockito::Server::new_async().await;
    let mock = server.mock("GET", "/page").expect(0).create_async().await;

    let backend = StubBackend::new();
    let counters = Arc::clone(&backend.counters);
    let pool = BrowserPool::new(BrowserPoolConfig::default(), Arc::new(backend));
    let policies = Arc::new(PolicyTable::with_defaults(fast_policy(false)));
    let breaker = Arc::new(CircuitBreaker::new(2, Duration::from_secs(60)));
    breaker.record_failure("127.0.0.1", "timeout");
    breaker.record_failure("127.0.0.1", "timeout");

    let fetcher = HybridFetcher::new(FetcherConfig::default(), pool, policies, breaker)
        .expect("client builds");
    let err = fetcher
        .fetch(&format!("{}/page", server.url()))
        .await
        .expect_err("circuit is open");

    mock.assert_async().await;
    assert!(matches!(err, EngineError::CircuitOpen { .. }));
    assert_eq!(counters.renders.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_url_is_rejected_before_any_fetch() {
    let fetcher = fetcher(StubBackend::new(), fast_policy(false));
    let err = fetcher.fetch("not a url").await.expect_err("unparseable");
    assert!(matches!(err, EngineError::InvalidUrl { .. }));
}
