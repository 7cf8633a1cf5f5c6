//! Process-memory monitor with edge-triggered pressure callbacks.
//!
//! A background task samples resident memory on a fixed interval and
//! classifies it into Normal/Warning/Critical. Callbacks fire once per
//! threshold crossing, not on every sample above a threshold, via a
//! last-fired-level state machine, so a sustained spike cannot cause a
//! callback storm. `observe_sample` is public so tests drive the state
//! machine with synthetic samples instead of real allocations.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Thresholds and cadence; defaults assume a 4GB host.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub sample_interval: Duration,
    pub warning_threshold_bytes: u64,
    pub critical_threshold_bytes: u64,
    /// Rolling window retained for trend reporting.
    pub history_len: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            warning_threshold_bytes: 2500 * 1024 * 1024,
            critical_threshold_bytes: 3200 * 1024 * 1024,
            history_len: 60,
        }
    }
}

/// Memory pressure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

/// One classified measurement.
#[derive(Debug, Clone)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub resident_bytes: u64,
    pub level: MemoryLevel,
}

/// Aggregate monitor statistics for status reporting.
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub current: Option<MemorySample>,
    pub peak_bytes: u64,
    pub peak_at: Option<DateTime<Utc>>,
    pub warning_count: u64,
    pub critical_count: u64,
}

/// Source of resident-memory readings.
pub trait MemoryProbe: Send + Sync + 'static {
    fn resident_bytes(&self) -> u64;
}

/// Probe backed by `sysinfo` for the current process.
pub struct ProcessProbe {
    system: Mutex<sysinfo::System>,
    pid: sysinfo::Pid,
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
            pid: sysinfo::Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessProbe {
    fn resident_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[self.pid]), true);
        system.process(self.pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Callbacks fired on classification edges. All are optional; each runs
/// synchronously on the monitor task, outside any job's critical path.
#[derive(Default)]
pub struct MemoryCallbacks {
    /// Crossing Normal→Warning.
    pub on_warning: Option<Box<dyn Fn(&MemorySample) + Send + Sync>>,
    /// Crossing into Critical.
    pub on_critical: Option<Box<dyn Fn(&MemorySample) + Send + Sync>>,
    /// Recovery edge: returning to Normal from any elevated level.
    pub on_normal: Option<Box<dyn Fn(&MemorySample) + Send + Sync>>,
}

pub struct MemoryMonitor {
    config: MemoryConfig,
    probe: Arc<dyn MemoryProbe>,
    /// Serializes callback dispatch; `stop` takes it to wait out an
    /// in-flight callback before returning.
    fire_lock: Mutex<()>,
    callbacks: Mutex<MemoryCallbacks>,
    last_level: Mutex<MemoryLevel>,
    latest: Mutex<Option<MemorySample>>,
    history: Mutex<VecDeque<MemorySample>>,
    peak_bytes: AtomicU64,
    peak_at: Mutex<Option<DateTime<Utc>>>,
    warning_count: AtomicU64,
    critical_count: AtomicU64,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMonitor {
    pub fn new(config: MemoryConfig, probe: Arc<dyn MemoryProbe>) -> Arc<Self> {
        Arc::new(Self {
            config,
            probe,
            fire_lock: Mutex::new(()),
            callbacks: Mutex::new(MemoryCallbacks::default()),
            last_level: Mutex::new(MemoryLevel::Normal),
            latest: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            peak_bytes: AtomicU64::new(0),
            peak_at: Mutex::new(None),
            warning_count: AtomicU64::new(0),
            critical_count: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Begin periodic sampling. Idempotent; a second call replaces the
    /// callbacks but does not spawn a second task.
    pub fn start(self: &Arc<Self>, callbacks: MemoryCallbacks) {
        *self.callbacks.lock() = callbacks;
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        self.stopped.store(false, Ordering::SeqCst);
        let monitor = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.sample_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if monitor.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let bytes = monitor.probe.resident_bytes();
                monitor.observe_sample(bytes);
            }
        }));
        info!(
            interval = ?self.config.sample_interval,
            warning_mb = self.config.warning_threshold_bytes / (1024 * 1024),
            critical_mb = self.config.critical_threshold_bytes / (1024 * 1024),
            "memory monitor started"
        );
    }

    /// Stop sampling. Waits out any in-flight callback; after this
    /// returns, no further callback fires.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        // An in-flight dispatch holds fire_lock; taking it here means
        // the callback has finished by the time we return.
        drop(self.fire_lock.lock());
        info!("memory monitor stopped");
    }

    /// Feed one measurement through classification, bookkeeping, and
    /// edge detection. Called by the sampling task and by tests.
    pub fn observe_sample(&self, resident_bytes: u64) {
        let level = self.classify(resident_bytes);
        let sample = MemorySample {
            timestamp: Utc::now(),
            resident_bytes,
            level,
        };

        {
            let mut history = self.history.lock();
            history.push_back(sample.clone());
            while history.len() > self.config.history_len {
                history.pop_front();
            }
        }
        *self.latest.lock() = Some(sample.clone());
        if resident_bytes > self.peak_bytes.load(Ordering::Relaxed) {
            self.peak_bytes.store(resident_bytes, Ordering::Relaxed);
            *self.peak_at.lock() = Some(sample.timestamp);
        }

        let previous = {
            let mut last = self.last_level.lock();
            let previous = *last;
            *last = level;
            previous
        };
        if previous != level {
            self.fire_edge(previous, level, &sample);
        }
    }

    /// Latest classification; Normal before the first sample.
    pub fn classification(&self) -> MemoryLevel {
        self.latest
            .lock()
            .as_ref()
            .map(|s| s.level)
            .unwrap_or(MemoryLevel::Normal)
    }

    pub fn latest(&self) -> Option<MemorySample> {
        self.latest.lock().clone()
    }

    pub fn history(&self) -> Vec<MemorySample> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            current: self.latest(),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            peak_at: *self.peak_at.lock(),
            warning_count: self.warning_count.load(Ordering::Relaxed),
            critical_count: self.critical_count.load(Ordering::Relaxed),
        }
    }

    fn classify(&self, resident_bytes: u64) -> MemoryLevel {
        if resident_bytes >= self.config.critical_threshold_bytes {
            MemoryLevel::Critical
        } else if resident_bytes >= self.config.warning_threshold_bytes {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        }
    }

    fn fire_edge(&self, previous: MemoryLevel, level: MemoryLevel, sample: &MemorySample) {
        let _dispatch = self.fire_lock.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let callbacks = self.callbacks.lock();
        let mb = sample.resident_bytes / (1024 * 1024);
        match (previous, level) {
            (MemoryLevel::Normal, MemoryLevel::Warning) => {
                self.warning_count.fetch_add(1, Ordering::Relaxed);
                warn!(resident_mb = mb, "memory pressure: warning threshold crossed");
                if let Some(cb) = &callbacks.on_warning {
                    cb(sample);
                }
            }
            (_, MemoryLevel::Critical) => {
                self.critical_count.fetch_add(1, Ordering::Relaxed);
                error!(resident_mb = mb, "memory pressure: critical threshold crossed");
                if let Some(cb) = &callbacks.on_critical {
                    cb(sample);
                }
            }
            (_, MemoryLevel::Normal) => {
                info!(resident_mb = mb, "memory pressure cleared");
                if let Some(cb) = &callbacks.on_normal {
                    cb(sample);
                }
            }
            // Critical→Warning: still elevated, no edge to report.
            (MemoryLevel::Critical, MemoryLevel::Warning) => {}
            _ => {}
        }
    }
}
