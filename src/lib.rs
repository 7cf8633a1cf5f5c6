pub mod browser_pool;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod memory;
pub mod retry;
pub mod scheduler;

pub use browser_pool::{
    BrowserPool, BrowserPoolConfig, ChromiumBackend, PoolStats, RenderBackend, RenderSession,
    WorkerGuard,
};
pub use config::{EngineConfig, PolicyTable, SitePolicy, site_for_url};
pub use error::{AdmissionReason, EngineError};
pub use fetcher::{FetchMode, FetcherConfig, HybridFetcher, PageContent};
pub use memory::{
    MemoryCallbacks, MemoryConfig, MemoryLevel, MemoryMonitor, MemoryProbe, MemorySample,
    MemoryStats, ProcessProbe,
};
pub use retry::{CircuitBreaker, CircuitState, RetryPolicy, SiteHealth};
pub use scheduler::{
    CrawlScheduler, ItemOutcome, JobProgress, JobReport, JobStats, JobStatus, SystemStatus,
};
