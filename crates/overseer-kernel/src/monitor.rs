//! Resource monitor: periodic CPU and memory sampling.
//!
//! A background loop refreshes [`sysinfo::System`] on the blocking pool
//! at a fixed cadence and publishes a snapshot.  CPU is smoothed with an
//! exponentially weighted moving average so a single spike does not flap
//! the admission predicate.  The sampler is the only writer; readers
//! always see the last complete snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::Config;

/// EWMA smoothing factor for CPU samples.
const CPU_SMOOTHING_ALPHA: f32 = 0.3;

/// The last complete sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceMetrics {
    /// Most recent raw CPU utilisation, percent.
    pub cpu_percent: f32,
    /// EWMA-smoothed CPU utilisation, percent.
    pub cpu_smoothed: f32,
    /// Free (available) memory in bytes.
    pub free_memory: u64,
    /// Sample time, epoch milliseconds.  Zero until the first sample.
    pub sampled_at: i64,
}

struct MonitorInner {
    system: Mutex<System>,
    metrics: RwLock<ResourceMetrics>,
    cpu_threshold: f32,
    memory_reserve: u64,
    hard_cap: usize,
    interval: Duration,
    running: AtomicBool,
}

/// Samples CPU/memory and answers the spawn-admission predicate.
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
}

impl ResourceMonitor {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                system: Mutex::new(System::new()),
                metrics: RwLock::new(ResourceMetrics::default()),
                cpu_threshold: config.cpu_threshold,
                memory_reserve: config.memory_reserve,
                hard_cap: config.max_workers,
                interval: config.monitor_interval,
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the background sampler.  Idempotent: a second call returns
    /// `None` while the first loop is still running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("resource monitor already running");
            return None;
        }

        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            info!(interval = ?inner.interval, "resource monitor started");
            while inner.running.load(Ordering::SeqCst) {
                Self::sample(&inner).await;
                tokio::time::sleep(inner.interval).await;
            }
            info!("resource monitor stopped");
        }))
    }

    /// Stop the background sampler after its current tick.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Take one sample immediately (also used by tests and startup so the
    /// admission predicate has data before the first tick lands).
    pub async fn sample_now(&self) {
        Self::sample(&self.inner).await;
    }

    /// The latest snapshot.
    pub fn metrics(&self) -> ResourceMetrics {
        *self.inner.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission predicate: may another worker be spawned?
    ///
    /// True iff smoothed CPU is under the threshold, free memory exceeds
    /// the reserve, and `live_workers` is under the hard cap.  Before the
    /// first sample lands the resource terms pass (zeros are optimistic)
    /// so a cold daemon can dispatch immediately.
    pub fn can_spawn_worker(&self, live_workers: usize) -> bool {
        if live_workers >= self.inner.hard_cap {
            trace!(live_workers, hard_cap = self.inner.hard_cap, "admission denied: at hard cap");
            return false;
        }
        let metrics = self.metrics();
        if metrics.sampled_at == 0 {
            return true;
        }
        if metrics.cpu_smoothed >= self.inner.cpu_threshold {
            debug!(cpu = metrics.cpu_smoothed, threshold = self.inner.cpu_threshold, "admission denied: cpu");
            return false;
        }
        if metrics.free_memory <= self.inner.memory_reserve {
            debug!(free = metrics.free_memory, reserve = self.inner.memory_reserve, "admission denied: memory");
            return false;
        }
        true
    }

    /// The configured hard cap on live workers.
    pub fn hard_cap(&self) -> usize {
        self.inner.hard_cap
    }

    /// Test hook: overwrite the published snapshot directly.
    #[cfg(test)]
    pub(crate) fn inject_metrics(&self, metrics: ResourceMetrics) {
        *self.inner.metrics.write().unwrap_or_else(|e| e.into_inner()) = metrics;
    }

    async fn sample(inner: &Arc<MonitorInner>) {
        let sampler = Arc::clone(inner);
        let raw = tokio::task::spawn_blocking(move || {
            let mut system = sampler.system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_cpu_usage();
            system.refresh_memory();
            (system.global_cpu_info().cpu_usage(), system.available_memory())
        })
        .await;

        let (cpu, free_memory) = match raw {
            Ok(values) => values,
            Err(err) => {
                warn!(error = %err, "resource sample failed");
                return;
            }
        };

        let mut metrics = inner.metrics.write().unwrap_or_else(|e| e.into_inner());
        let smoothed = if metrics.sampled_at == 0 {
            cpu
        } else {
            CPU_SMOOTHING_ALPHA * cpu + (1.0 - CPU_SMOOTHING_ALPHA) * metrics.cpu_smoothed
        };
        *metrics = ResourceMetrics {
            cpu_percent: cpu,
            cpu_smoothed: smoothed,
            free_memory,
            sampled_at: Utc::now().timestamp_millis(),
        };
        trace!(cpu, smoothed, free_memory, "resource sample");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
