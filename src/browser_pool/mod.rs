//! Bounded pool of reusable browser-rendering workers.
//!
//! Workers are expensive to launch, so the pool hands them out for
//! reuse and recycles them on age, request count, or session death.
//! The hard capacity cap bounds concurrently-live workers (Idle + Busy)
//! regardless of how many jobs are active.
//!
//! Reset semantics are mark-on-release: `reset_all` bumps the pool
//! epoch and destroys idle workers immediately, while busy workers are
//! destroyed at their next release. A pending acquirer is woken and
//! builds a fresh worker. `force_reset_all` additionally fails pending
//! acquirers with `PoolReset`, which they retry once.

pub mod backend;

pub use backend::{ChromiumBackend, RenderBackend, RenderSession};

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::retry::{self, RetryPolicy};

/// Pool tuning; defaults sized for the 4GB / 2 vCPU target.
#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    /// Hard cap on live workers (Idle + Busy).
    pub capacity: usize,
    /// Recycle a worker after this many requests (memory-leak hygiene).
    pub max_requests_per_worker: u32,
    /// Recycle a worker once it is this old.
    pub max_age: Duration,
    /// Destroy idle workers not used for this long on `reclaim_idle`.
    pub idle_timeout: Duration,
    /// How long `acquire` waits before giving up with `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// Retry schedule for transient worker-startup failures.
    pub startup_retry: RetryPolicy,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            max_requests_per_worker: 30,
            max_age: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(30),
            startup_retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(500),
                backoff: 2.0,
                max_delay: Duration::from_secs(5),
                jitter: true,
            },
        }
    }
}

/// Pool counters for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub total_created: u64,
    pub total_requests: u64,
    pub recycled: u64,
}

/// A pooled worker together with its reuse metadata.
struct PooledWorker {
    id: u64,
    session: Box<dyn RenderSession>,
    created_at: Instant,
    last_used: Instant,
    /// Requests served since creation.
    served: u32,
    /// Pool epoch at creation; a stale epoch means a reset has
    /// condemned this worker.
    epoch: u64,
    dead: bool,
}

pub struct BrowserPool {
    config: BrowserPoolConfig,
    backend: Arc<dyn RenderBackend>,
    idle: Mutex<VecDeque<PooledWorker>>,
    /// Mirrors `idle.len()` for lock-free status reads.
    idle_count: AtomicUsize,
    /// Live workers: idle + busy + slots reserved for launches in
    /// progress. Never exceeds `config.capacity`.
    live: AtomicUsize,
    in_use: AtomicUsize,
    epoch: AtomicU64,
    /// Bumped only by `force_reset_all`; waiters compare against it.
    force_reset_seq: AtomicU64,
    next_id: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
    total_created: AtomicU64,
    total_requests: AtomicU64,
    recycled: AtomicU64,
}

impl BrowserPool {
    pub fn new(config: BrowserPoolConfig, backend: Arc<dyn RenderBackend>) -> Arc<Self> {
        info!(
            capacity = config.capacity,
            max_requests = config.max_requests_per_worker,
            "browser pool initialized"
        );
        Arc::new(Self {
            config,
            backend,
            idle: Mutex::new(VecDeque::new()),
            idle_count: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            force_reset_seq: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            total_created: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        })
    }

    /// Acquire exclusive access to a worker.
    ///
    /// Pops a reusable idle worker, else launches a fresh one while the
    /// capacity cap allows, else waits until a worker is released or the
    /// acquire timeout fires.
    pub async fn acquire(self: &Arc<Self>) -> Result<WorkerGuard, EngineError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let entry_seq = self.force_reset_seq.load(Ordering::Acquire);

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(EngineError::PoolClosed);
            }
            if self.force_reset_seq.load(Ordering::Acquire) != entry_seq {
                return Err(EngineError::PoolReset);
            }

            // 1. Reuse an idle worker, recycling stale ones on the way.
            let mut condemned = Vec::new();
            let mut picked = None;
            {
                let mut idle = self.idle.lock().await;
                while let Some(worker) = idle.pop_front() {
                    self.idle_count.fetch_sub(1, Ordering::Relaxed);
                    if self.should_recycle(&worker) {
                        condemned.push(worker);
                    } else {
                        picked = Some(worker);
                        break;
                    }
                }
            }
            for worker in condemned {
                self.destroy(worker).await;
            }
            if let Some(mut worker) = picked {
                worker.served += 1;
                worker.last_used = Instant::now();
                self.in_use.fetch_add(1, Ordering::SeqCst);
                self.total_requests.fetch_add(1, Ordering::Relaxed);
                debug!(worker = worker.id, served = worker.served, "acquired pooled worker");
                return Ok(WorkerGuard {
                    worker: Some(worker),
                    pool: Arc::clone(self),
                });
            }

            // 2. Launch a fresh worker if a capacity slot is free.
            if self.try_reserve_slot() {
                match self.launch_worker().await {
                    Ok(mut worker) => {
                        worker.served += 1;
                        self.in_use.fetch_add(1, Ordering::SeqCst);
                        self.total_requests.fetch_add(1, Ordering::Relaxed);
                        debug!(worker = worker.id, "launched worker for acquire");
                        return Ok(WorkerGuard {
                            worker: Some(worker),
                            pool: Arc::clone(self),
                        });
                    }
                    Err(e) => {
                        self.release_slot();
                        return Err(e);
                    }
                }
            }

            // 3. Wait for a release, a reset, or the timeout.
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::PoolExhausted {
                    timeout: self.config.acquire_timeout,
                });
            }
            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep(deadline - now) => {
                    return Err(EngineError::PoolExhausted {
                        timeout: self.config.acquire_timeout,
                    });
                }
            }
        }
    }

    /// Destroy every worker. Idle workers die now; busy workers are
    /// condemned and die at their next release. Safe to call repeatedly.
    pub async fn reset_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let drained: Vec<PooledWorker> = {
            let mut idle = self.idle.lock().await;
            self.idle_count.store(0, Ordering::Relaxed);
            idle.drain(..).collect()
        };
        let count = drained.len();
        for worker in drained {
            self.destroy(worker).await;
        }
        info!(
            destroyed = count,
            busy_condemned = self.in_use.load(Ordering::SeqCst),
            "browser pool reset"
        );
        self.notify.notify_waiters();
    }

    /// Emergency variant: same as `reset_all`, and additionally fails
    /// every pending acquirer with `PoolReset`.
    pub async fn force_reset_all(&self) {
        self.force_reset_seq.fetch_add(1, Ordering::SeqCst);
        self.reset_all().await;
    }

    /// Destroy idle workers unused for longer than `idle_timeout`.
    /// Returns how many were destroyed.
    pub async fn reclaim_idle(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<PooledWorker> = {
            let mut idle = self.idle.lock().await;
            let mut keep = VecDeque::new();
            let mut stale = Vec::new();
            while let Some(worker) = idle.pop_front() {
                if now.duration_since(worker.last_used) > self.config.idle_timeout {
                    stale.push(worker);
                } else {
                    keep.push_back(worker);
                }
            }
            self.idle_count.store(keep.len(), Ordering::Relaxed);
            *idle = keep;
            stale
        };
        let count = stale.len();
        for worker in stale {
            self.destroy(worker).await;
        }
        if count > 0 {
            info!(reclaimed = count, "idle browser workers reclaimed");
        }
        count
    }

    /// Stop the pool: destroy idle workers and reject further acquires.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<PooledWorker> = {
            let mut idle = self.idle.lock().await;
            self.idle_count.store(0, Ordering::Relaxed);
            idle.drain(..).collect()
        };
        for worker in drained {
            self.destroy(worker).await;
        }
        self.notify.notify_waiters();
        info!("browser pool shut down");
    }

    /// Snapshot of pool counters; never blocks on worker operations.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.live.load(Ordering::SeqCst),
            idle: self.idle_count.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::SeqCst),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }

    fn should_recycle(&self, worker: &PooledWorker) -> bool {
        if worker.dead {
            warn!(worker = worker.id, "recycling dead worker session");
            return true;
        }
        if worker.epoch != self.epoch.load(Ordering::SeqCst) {
            debug!(worker = worker.id, "recycling worker condemned by reset");
            return true;
        }
        if worker.served >= self.config.max_requests_per_worker {
            debug!(
                worker = worker.id,
                served = worker.served,
                "recycling worker past request limit"
            );
            return true;
        }
        if worker.created_at.elapsed() >= self.config.max_age {
            debug!(worker = worker.id, "recycling worker past max age");
            return true;
        }
        false
    }

    /// Reserve a live slot if capacity allows; the invariant that
    /// Idle + Busy never exceeds capacity lives here.
    fn try_reserve_slot(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.config.capacity).then_some(live + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Launch a worker, retrying transient startup failures.
    async fn launch_worker(&self) -> Result<PooledWorker, EngineError> {
        let session =
            retry::retry_only(&self.config.startup_retry, |_| self.backend.launch()).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.total_created.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        info!(worker = id, "browser worker launched");
        Ok(PooledWorker {
            id,
            session,
            created_at: now,
            last_used: now,
            served: 0,
            epoch: self.epoch.load(Ordering::SeqCst),
            dead: false,
        })
    }

    async fn destroy(&self, worker: PooledWorker) {
        debug!(worker = worker.id, served = worker.served, "destroying worker");
        self.recycled.fetch_add(1, Ordering::Relaxed);
        worker.session.close().await;
        self.release_slot();
    }

    /// Return a worker from a dropped guard. Runs on a spawned task so
    /// `Drop` stays synchronous; every exit path of the holder funnels
    /// through here.
    fn release(self: &Arc<Self>, mut worker: PooledWorker) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if pool.closed.load(Ordering::Acquire) || pool.should_recycle(&worker) {
                pool.destroy(worker).await;
            } else {
                worker.last_used = Instant::now();
                let id = worker.id;
                {
                    let mut idle = pool.idle.lock().await;
                    idle.push_back(worker);
                    pool.idle_count.store(idle.len(), Ordering::Relaxed);
                }
                debug!(worker = id, "worker returned to pool");
                pool.notify.notify_one();
            }
        });
    }
}

/// RAII handle to an acquired worker; the worker goes back to the pool
/// (or is destroyed) when the guard drops, on every exit path.
pub struct WorkerGuard {
    worker: Option<PooledWorker>,
    pool: Arc<BrowserPool>,
}

impl std::fmt::Debug for WorkerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGuard")
            .field("worker_id", &self.id())
            .finish_non_exhaustive()
    }
}

impl WorkerGuard {
    pub fn id(&self) -> u64 {
        self.worker.as_ref().map(|w| w.id).unwrap_or_default()
    }

    /// Render through the held worker. A failure whose message matches
    /// the dead-session patterns condemns the worker so it is destroyed
    /// on release instead of being handed out again.
    pub async fn render(&mut self, url: &str, settle: Duration) -> Result<String, EngineError> {
        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| EngineError::Render("worker already released".to_string()))?;
        match worker.session.render(url, settle).await {
            Ok(html) => Ok(html),
            Err(e) => {
                if crate::error::is_session_dead(&e.to_string()) {
                    worker.dead = true;
                }
                Err(e)
            }
        }
    }

    /// Condemn the worker regardless of the error message.
    pub fn mark_dead(&mut self) {
        if let Some(worker) = self.worker.as_mut() {
            worker.dead = true;
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }
}
