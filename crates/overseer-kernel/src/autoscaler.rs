//! Autoscaler: adjusts the worker-pool concurrency cap.
//!
//! A control loop reads the resource monitor's smoothed metrics on a
//! fixed interval and nudges the published cap by at most one step per
//! tick.  Scale-down only lowers the cap — running workers are never
//! preempted; the pool simply stops admitting new spawns above the cap.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::monitor::ResourceMonitor;
use crate::queue::PriorityQueue;

/// Shared count of live workers, written by the worker pool and read by
/// the autoscaler and the admission predicate.
#[derive(Debug, Clone, Default)]
pub struct WorkerGauge {
    live: Arc<AtomicUsize>,
}

impl WorkerGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        // Saturating: a double-decrement bug should not wrap to usize::MAX.
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Control loop owning the published worker cap.
pub struct Autoscaler {
    cap: AtomicUsize,
    hard_cap: usize,
    high_water: f32,
    low_water: f32,
    memory_reserve: u64,
    interval: Duration,
    running: AtomicBool,
}

impl Autoscaler {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            cap: AtomicUsize::new(config.max_workers),
            hard_cap: config.max_workers,
            high_water: config.cpu_threshold,
            low_water: config.cpu_low_water,
            memory_reserve: config.memory_reserve,
            interval: config.autoscale_interval,
            running: AtomicBool::new(false),
        })
    }

    /// The currently published concurrency cap.
    pub fn current_cap(&self) -> usize {
        self.cap.load(Ordering::SeqCst)
    }

    /// Spawn the control loop.  Idempotent while running.
    pub fn start(
        self: &Arc<Self>,
        monitor: ResourceMonitor,
        queue: Arc<PriorityQueue>,
        workers: WorkerGauge,
    ) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("autoscaler already running");
            return None;
        }

        let scaler = Arc::clone(self);
        Some(tokio::spawn(async move {
            info!(interval = ?scaler.interval, hard_cap = scaler.hard_cap, "autoscaler started");
            while scaler.running.load(Ordering::SeqCst) {
                tokio::time::sleep(scaler.interval).await;
                if !scaler.running.load(Ordering::SeqCst) {
                    break;
                }
                scaler.tick(&monitor, &queue, &workers);
            }
            info!("autoscaler stopped");
        }))
    }

    /// Stop the control loop after its current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One control decision.  Exposed for tests.
    pub fn tick(&self, monitor: &ResourceMonitor, queue: &PriorityQueue, workers: &WorkerGauge) {
        let metrics = monitor.metrics();
        if metrics.sampled_at == 0 {
            return;
        }

        let live = workers.get();
        let current = self.current_cap();

        let target = if metrics.cpu_smoothed > self.high_water
            || metrics.free_memory < self.memory_reserve
        {
            live.saturating_sub(1).max(1)
        } else if metrics.cpu_smoothed < self.low_water
            && metrics.free_memory > self.memory_reserve.saturating_mul(2)
            && !queue.is_empty()
        {
            (live + 1).min(self.hard_cap)
        } else {
            current
        };

        if target != current {
            debug!(
                cpu = metrics.cpu_smoothed,
                free_memory = metrics.free_memory,
                live,
                from = current,
                to = target,
                "worker cap adjusted"
            );
            self.cap.store(target, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
