//! Multi-site crawl scheduler: admission control, per-job fan-out, and
//! memory-pressure wiring.
//!
//! Jobs are admitted atomically against the system and per-user limits
//! and then run as spawned tasks that pull URLs through a shared cursor.
//! Per-item failures never abort a job; cancellation takes effect at
//! item boundaries. Memory pressure degrades the engine (reclaim, then
//! pool reset plus an admission pause) without cancelling running work.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use crate::browser_pool::{BrowserPool, PoolStats};
use crate::config::EngineConfig;
use crate::config::policy::{PolicyTable, site_for_url};
use crate::error::{AdmissionReason, EngineError};
use crate::fetcher::{HybridFetcher, PageContent};
use crate::memory::{MemoryCallbacks, MemoryLevel, MemoryMonitor, MemoryStats};
use crate::retry::CircuitBreaker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Queued,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Final outcome of one URL within a job.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub url: String,
    pub outcome: Result<PageContent, String>,
}

/// Lock-free progress snapshot.
#[derive(Debug, Clone)]
pub struct JobProgress {
    pub id: u64,
    pub status: JobStatus,
    pub current: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct JobStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: chrono::Duration,
}

/// Finalized job record, handed out for external persistence.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: u64,
    pub owner: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub items: Vec<ItemOutcome>,
    pub stats: JobStats,
}

/// Engine-wide status for operators.
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub memory_level: MemoryLevel,
    pub memory: MemoryStats,
    pub pool: PoolStats,
    pub running_jobs: usize,
    pub admission_paused: bool,
}

struct JobHandle {
    id: u64,
    owner: String,
    urls: Arc<Vec<String>>,
    status: RwLock<JobStatus>,
    /// Next URL index to hand to a worker.
    cursor: AtomicUsize,
    /// Items with a final outcome; monotone, never exceeds `total`.
    current: AtomicUsize,
    total: usize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    results: Mutex<Vec<ItemOutcome>>,
    cancelled: AtomicBool,
    created_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl JobHandle {
    fn progress(&self) -> JobProgress {
        JobProgress {
            id: self.id,
            status: *self.status.read(),
            current: self.current.load(Ordering::SeqCst),
            total: self.total,
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Admission counters; checked and bumped under one lock so a denied
/// submission leaves no partial state behind.
#[derive(Default)]
struct AdmissionState {
    running_total: usize,
    per_user: HashMap<String, usize>,
    paused: bool,
}

pub struct CrawlScheduler {
    config: EngineConfig,
    fetcher: Arc<HybridFetcher>,
    pool: Arc<BrowserPool>,
    policies: Arc<PolicyTable>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<MemoryMonitor>,
    jobs: DashMap<u64, Arc<JobHandle>>,
    next_job_id: AtomicU64,
    admission: Arc<Mutex<AdmissionState>>,
}

impl CrawlScheduler {
    pub fn new(
        config: EngineConfig,
        fetcher: Arc<HybridFetcher>,
        pool: Arc<BrowserPool>,
        policies: Arc<PolicyTable>,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<MemoryMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            fetcher,
            pool,
            policies,
            breaker,
            monitor,
            jobs: DashMap::new(),
            next_job_id: AtomicU64::new(1),
            admission: Arc::new(Mutex::new(AdmissionState::default())),
        })
    }

    /// Wire the memory monitor's pressure callbacks and start sampling.
    ///
    /// Warning reclaims idle browser workers; Critical resets the pool
    /// and pauses admission; the recovery edge resumes admission.
    /// Running jobs are never cancelled by memory pressure.
    pub fn start_memory_monitoring(self: &Arc<Self>) {
        let warn_pool = Arc::clone(&self.pool);
        let crit_pool = Arc::clone(&self.pool);
        let crit_admission = Arc::clone(&self.admission);
        let normal_admission = Arc::clone(&self.admission);

        self.monitor.start(MemoryCallbacks {
            on_warning: Some(Box::new(move |_| {
                let pool = Arc::clone(&warn_pool);
                tokio::spawn(async move {
                    let reclaimed = pool.reclaim_idle().await;
                    info!(reclaimed, "memory warning: idle workers reclaimed");
                });
            })),
            on_critical: Some(Box::new(move |_| {
                crit_admission.lock().paused = true;
                warn!("memory critical: admission paused, resetting browser pool");
                let pool = Arc::clone(&crit_pool);
                tokio::spawn(async move {
                    pool.reset_all().await;
                });
            })),
            on_normal: Some(Box::new(move |_| {
                normal_admission.lock().paused = false;
                info!("memory recovered: admission resumed");
            })),
        });
    }

    /// Submit a crawl job. Returns the job id or an `AdmissionDenied`
    /// carrying why it was rejected; a denied submission creates no
    /// state at all.
    pub fn submit(
        self: &Arc<Self>,
        owner: impl Into<String>,
        urls: Vec<String>,
    ) -> Result<u64, EngineError> {
        let owner = owner.into();
        if urls.is_empty() {
            return Err(EngineError::InvalidUrl {
                url: String::new(),
                reason: "job contains no urls".to_string(),
            });
        }
        // Every URL must parse before any state is created. The job's
        // worker budget is the summed weight of its distinct sites,
        // capped so one job cannot starve the pool.
        let mut sites = std::collections::HashSet::new();
        for url in &urls {
            sites.insert(site_for_url(url)?);
        }
        let weight: u32 = sites
            .iter()
            .map(|s| self.policies.policy_for_site(s).concurrency_weight)
            .sum();

        {
            let mut admission = self.admission.lock();
            if admission.paused {
                return Err(EngineError::AdmissionDenied(AdmissionReason::MemoryPressure));
            }
            if admission.running_total >= self.config.system_job_limit {
                return Err(EngineError::AdmissionDenied(AdmissionReason::SystemLimit(
                    self.config.system_job_limit,
                )));
            }
            let user_running = admission.per_user.get(&owner).copied().unwrap_or(0);
            if user_running >= self.config.per_user_job_limit {
                return Err(EngineError::AdmissionDenied(AdmissionReason::UserLimit(
                    self.config.per_user_job_limit,
                )));
            }
            admission.running_total += 1;
            *admission.per_user.entry(owner.clone()).or_insert(0) += 1;
        }

        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let total = urls.len();
        let handle = Arc::new(JobHandle {
            id,
            owner: owner.clone(),
            urls: Arc::new(urls),
            status: RwLock::new(JobStatus::Queued),
            cursor: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            total,
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            results: Mutex::new(Vec::with_capacity(total)),
            cancelled: AtomicBool::new(false),
            created_at: Utc::now(),
            finished_at: Mutex::new(None),
        });
        self.jobs.insert(id, Arc::clone(&handle));

        let workers = self
            .config
            .per_job_worker_cap
            .min(weight as usize)
            .max(1)
            .min(total);
        info!(job = id, owner = %owner, total, workers, "job admitted");

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_job(handle, workers).await;
        });
        Ok(id)
    }

    async fn run_job(self: Arc<Self>, handle: Arc<JobHandle>, workers: usize) {
        *handle.status.write() = JobStatus::Running;

        let mut tasks = Vec::with_capacity(workers);
        for _ in 0..workers {
            let fetcher = Arc::clone(&self.fetcher);
            let handle = Arc::clone(&handle);
            tasks.push(tokio::spawn(async move {
                loop {
                    if handle.cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    let idx = handle.cursor.fetch_add(1, Ordering::SeqCst);
                    if idx >= handle.total {
                        break;
                    }
                    let url = handle.urls[idx].clone();
                    let outcome = match fetcher.fetch(&url).await {
                        Ok(page) => {
                            handle.succeeded.fetch_add(1, Ordering::SeqCst);
                            Ok(page)
                        }
                        Err(e) => {
                            warn!(job = handle.id, url = %url, error = %e, "item failed");
                            handle.failed.fetch_add(1, Ordering::SeqCst);
                            Err(e.to_string())
                        }
                    };
                    handle.results.lock().push(ItemOutcome { url, outcome });
                    // The outcome above is final before the count moves.
                    handle.current.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        let failed = handle.failed.load(Ordering::SeqCst);
        let done = handle.current.load(Ordering::SeqCst);
        let status = if handle.cancelled.load(Ordering::SeqCst) {
            JobStatus::Cancelled
        } else if failed == handle.total {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        *handle.status.write() = status;
        *handle.finished_at.lock() = Some(Utc::now());

        {
            let mut admission = self.admission.lock();
            admission.running_total = admission.running_total.saturating_sub(1);
            if let Some(count) = admission.per_user.get_mut(&handle.owner) {
                *count -= 1;
                if *count == 0 {
                    admission.per_user.remove(&handle.owner);
                }
            }
        }
        info!(
            job = handle.id,
            ?status,
            done,
            failed,
            total = handle.total,
            "job finished"
        );
    }

    /// Request cancellation. Workers stop pulling at the next item
    /// boundary; in-flight items run to completion and their results
    /// are preserved.
    pub fn cancel(&self, job_id: u64) -> Result<(), EngineError> {
        let handle = self
            .jobs
            .get(&job_id)
            .ok_or(EngineError::JobNotFound(job_id))?;
        handle.cancelled.store(true, Ordering::SeqCst);
        let mut status = handle.status.write();
        if !status.is_terminal() {
            *status = JobStatus::Cancelling;
            info!(job = job_id, "cancellation requested");
        }
        Ok(())
    }

    pub fn progress(&self, job_id: u64) -> Result<JobProgress, EngineError> {
        self.jobs
            .get(&job_id)
            .map(|h| h.progress())
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// Finalized (or point-in-time) record of the job, for persistence
    /// by the caller.
    ///
    /// Taking the report of a terminal job removes it from tracking:
    /// the durable record now lives with the caller, and keeping every
    /// fetched body in the job map for the process lifetime would bleed
    /// memory. Reports of running jobs are snapshots and leave the job
    /// tracked.
    pub fn report(&self, job_id: u64) -> Result<JobReport, EngineError> {
        let handle = self
            .jobs
            .get(&job_id)
            .ok_or(EngineError::JobNotFound(job_id))?;
        let finished_at = *handle.finished_at.lock();
        let end = finished_at.unwrap_or_else(Utc::now);
        let report = JobReport {
            id: handle.id,
            owner: handle.owner.clone(),
            status: *handle.status.read(),
            created_at: handle.created_at,
            finished_at,
            items: handle.results.lock().clone(),
            stats: JobStats {
                total: handle.total,
                succeeded: handle.succeeded.load(Ordering::SeqCst),
                failed: handle.failed.load(Ordering::SeqCst),
                elapsed: end - handle.created_at,
            },
        };
        drop(handle);
        if report.status.is_terminal() {
            self.jobs.remove(&job_id);
            debug!(job = job_id, "terminal job evicted after report");
        }
        Ok(report)
    }

    pub fn system_status(&self) -> SystemStatus {
        let admission = self.admission.lock();
        SystemStatus {
            memory_level: self.monitor.classification(),
            memory: self.monitor.stats(),
            pool: self.pool.stats(),
            running_jobs: admission.running_total,
            admission_paused: admission.paused,
        }
    }

    /// Operator action: destroy idle browser workers now. Returns how
    /// many were reclaimed.
    pub async fn force_reclaim(&self) -> usize {
        self.pool.reclaim_idle().await
    }

    /// Operator action: destroy every pooled worker. Busy workers die
    /// at release; the pool rebuilds on demand. Idempotent.
    pub async fn reset_browser_pool(&self) {
        self.pool.reset_all().await;
    }

    /// Swap in a new policy table and clear circuit state, since site
    /// health accumulated under the old policies no longer applies.
    pub fn reload_policies(&self, file: crate::config::policy::PolicyFile) {
        self.policies.reload(file);
        self.breaker.reset_all();
    }

    /// Stop sampling and shut the pool down. Running jobs are left to
    /// drain; new submissions are rejected by the closed pool failing
    /// their fetches, so callers should stop submitting first.
    pub async fn shutdown(&self) {
        self.monitor.stop();
        self.pool.shutdown().await;
    }
}
