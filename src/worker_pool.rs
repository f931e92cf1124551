//! # Worker Pool Module
//!
//! Bounded pool of worker coroutines for off-thread routes.
//!
//! ## Features
//!
//! - **Shared queue**: all workers pull from one `may` channel, so load
//!   balances itself
//! - **Bounded**: at most `queue_bound` jobs are queued or running; the
//!   bound is enforced with a permit channel pre-filled with that many
//!   tokens
//! - **Backpressure**: `block` waits up to `backpressure_timeout_ms` for a
//!   permit, `shed` rejects immediately. Either way a rejected job is handed
//!   back to the caller, who turns it into a 503
//! - **Metrics**: queue depth, dispatch, completion and shed counts
//!
//! ## Configuration
//!
//! - `MCS_HANDLER_WORKERS`: number of worker coroutines (default: 4)
//! - `MCS_HANDLER_QUEUE_BOUND`: queued plus running jobs (default: 1024)
//! - `MCS_BACKPRESSURE_MODE`: `block` or `shed` (default: `block`)
//! - `MCS_BACKPRESSURE_TIMEOUT_MS`: block mode wait (default: 50)
//! - `MCS_STACK_SIZE`: worker stack size (default: 64 KB)

use crate::runtime::{parse_size, spawn_coroutine, DEFAULT_STACK_SIZE};
use may::sync::mpsc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for worker pool backpressure behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Wait for queue space up to a timeout, then reject
    #[default]
    Block,
    /// Reject immediately when the queue is full
    Shed,
}

impl FromStr for BackpressureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "shed" => Ok(Self::Shed),
            other => Err(format!("unknown backpressure mode '{other}'")),
        }
    }
}

/// Configuration for a worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker coroutines
    pub num_workers: usize,
    /// Maximum number of jobs queued or running
    pub queue_bound: usize,
    pub backpressure_mode: BackpressureMode,
    /// Timeout for block mode in milliseconds
    pub backpressure_timeout_ms: u64,
    /// Stack size for worker coroutines
    pub stack_size: usize,
}

impl WorkerPoolConfig {
    /// Load configuration from environment variables, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `MCS_*` environment variables when set and valid.
    pub fn apply_env(&mut self) {
        self.apply_vars(&|key| std::env::var(key).ok());
    }

    /// Same as [`apply_env`](Self::apply_env) with an arbitrary lookup.
    pub fn apply_vars(&mut self, vars: &dyn Fn(&str) -> Option<String>) {
        let parse = |key: &str| vars(key).map(|s| s.trim().to_string());
        if let Some(v) = parse("MCS_HANDLER_WORKERS").and_then(|s| s.parse().ok()) {
            self.num_workers = v;
        }
        if let Some(v) = parse("MCS_HANDLER_QUEUE_BOUND").and_then(|s| s.parse().ok()) {
            self.queue_bound = v;
        }
        if let Some(v) = parse("MCS_BACKPRESSURE_MODE").and_then(|s| s.parse().ok()) {
            self.backpressure_mode = v;
        }
        if let Some(v) = parse("MCS_BACKPRESSURE_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.backpressure_timeout_ms = v;
        }
        if let Some(v) = parse("MCS_STACK_SIZE").and_then(|s| parse_size(&s)) {
            self.stack_size = v;
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_bound: 1024,
            backpressure_mode: BackpressureMode::Block,
            backpressure_timeout_ms: 50,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Metrics for a worker pool
#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    /// Jobs rejected because the queue was full
    pub shed_count: AtomicU64,
    /// Jobs queued or running (approximate)
    pub queue_depth: AtomicUsize,
    pub dispatched_count: AtomicU64,
    pub completed_count: AtomicU64,
}

impl WorkerPoolMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_shed(&self) {
        self.shed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatched_count.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Roll back a dispatch whose job never reached a worker; counts as shed.
    pub fn record_undispatched(&self) {
        self.dispatched_count.fetch_sub(1, Ordering::Relaxed);
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
        self.record_shed();
    }

    pub fn record_completion(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_shed_count(&self) -> u64 {
        self.shed_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_dispatched_count(&self) -> u64 {
        self.dispatched_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    /// Point-in-time copy, suitable for serializing.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            queue_depth: self.get_queue_depth(),
            dispatched: self.get_dispatched_count(),
            completed: self.get_completed_count(),
            shed: self.get_shed_count(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub queue_depth: usize,
    pub dispatched: u64,
    pub completed: u64,
    pub shed: u64,
}

/// A bounded pool of coroutines executing jobs of type `J`.
pub struct WorkerPool<J> {
    config: WorkerPoolConfig,
    sender: mpsc::Sender<J>,
    permits: Arc<mpsc::Receiver<()>>,
    permit_tx: mpsc::Sender<()>,
    metrics: Arc<WorkerPoolMetrics>,
    name: String,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Create the pool and spawn its workers. Each worker runs `handler_fn`
    /// on one job at a time; a panicking job is logged and the worker keeps
    /// serving.
    pub fn new<F>(name: &str, config: WorkerPoolConfig, handler_fn: F) -> std::io::Result<Self>
    where
        F: Fn(J) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel::<J>();
        let rx = Arc::new(rx);
        let (permit_tx, permit_rx) = mpsc::channel::<()>();
        let bound = config.queue_bound.max(1);
        for _ in 0..bound {
            // receiver is alive, cannot fail
            let _ = permit_tx.send(());
        }
        let metrics = Arc::new(WorkerPoolMetrics::new());
        let handler_fn = Arc::new(handler_fn);

        info!(
            pool = %name,
            num_workers = config.num_workers,
            queue_bound = bound,
            backpressure_mode = ?config.backpressure_mode,
            stack_size = config.stack_size,
            "Creating worker pool"
        );

        for worker_id in 0..config.num_workers.max(1) {
            let rx = Arc::clone(&rx);
            let permit_tx = permit_tx.clone();
            let handler_fn = Arc::clone(&handler_fn);
            let metrics = Arc::clone(&metrics);
            let pool_name = name.to_string();

            spawn_coroutine(&format!("{name}-worker-{worker_id}"), config.stack_size, move || {
                debug!(pool = %pool_name, worker_id, "Worker coroutine started");
                while let Ok(job) = rx.recv() {
                    if let Err(panic) =
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler_fn(job)))
                    {
                        error!(
                            pool = %pool_name,
                            worker_id,
                            panic_message = ?panic,
                            "Worker job panicked"
                        );
                    }
                    metrics.record_completion();
                    let _ = permit_tx.send(());
                }
                debug!(pool = %pool_name, worker_id, "Worker coroutine exiting");
            })
            .inspect_err(|e| {
                error!(pool = %name, worker_id, error = %e, "Failed to spawn worker coroutine");
            })?;
        }

        Ok(Self {
            config,
            sender: tx,
            permits: Arc::new(permit_rx),
            permit_tx,
            metrics,
            name: name.to_string(),
        })
    }

    /// Queue a job. On rejection (queue full, or workers gone) the job is
    /// returned untouched so the caller can still answer the client.
    pub fn submit(&self, job: J) -> Result<(), J> {
        let admitted = match self.config.backpressure_mode {
            BackpressureMode::Shed => self.permits.try_recv().is_ok(),
            BackpressureMode::Block => self
                .permits
                .recv_timeout(Duration::from_millis(self.config.backpressure_timeout_ms))
                .is_ok(),
        };
        if !admitted {
            self.metrics.record_shed();
            warn!(
                pool = %self.name,
                mode = ?self.config.backpressure_mode,
                queue_depth = self.metrics.get_queue_depth(),
                "Worker pool saturated, rejecting job"
            );
            return Err(job);
        }

        self.metrics.record_dispatch();
        self.sender
            .send(job)
            .map_err(|e| self.reject_unsent(e.0))
    }

    /// Undo an admitted submit whose job could not be queued: the permit
    /// goes back and the depth is restored.
    fn reject_unsent(&self, job: J) -> J {
        error!(pool = %self.name, "Worker pool channel disconnected");
        let _ = self.permit_tx.send(());
        self.metrics.record_undispatched();
        job
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<WorkerPoolMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_mode_from_str() {
        assert_eq!("block".parse(), Ok(BackpressureMode::Block));
        assert_eq!("BLOCK".parse(), Ok(BackpressureMode::Block));
        assert_eq!("Shed".parse(), Ok(BackpressureMode::Shed));
        assert!("invalid".parse::<BackpressureMode>().is_err());
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.queue_bound, 1024);
        assert_eq!(config.backpressure_mode, BackpressureMode::Block);
        assert_eq!(config.backpressure_timeout_ms, 50);
        assert_eq!(config.stack_size, 0x10000);
    }

    #[test]
    fn test_worker_pool_metrics() {
        let metrics = WorkerPoolMetrics::new();
        assert_eq!(metrics.snapshot().queue_depth, 0);

        metrics.record_dispatch();
        assert_eq!(metrics.get_dispatched_count(), 1);
        assert_eq!(metrics.get_queue_depth(), 1);

        metrics.record_completion();
        assert_eq!(metrics.get_completed_count(), 1);
        assert_eq!(metrics.get_queue_depth(), 0);

        metrics.record_shed();
        assert_eq!(metrics.get_shed_count(), 1);
    }

    #[test]
    fn test_unsent_job_returns_its_permit() {
        let pool = WorkerPool::new(
            "unsent",
            WorkerPoolConfig {
                num_workers: 1,
                queue_bound: 1,
                backpressure_mode: BackpressureMode::Shed,
                ..WorkerPoolConfig::default()
            },
            |_: u32| {},
        )
        .unwrap();

        // admitted as submit would, then the send fails
        assert!(pool.permits.try_recv().is_ok());
        pool.metrics.record_dispatch();
        assert_eq!(pool.reject_unsent(7), 7);

        let snapshot = pool.metrics().snapshot();
        assert_eq!(snapshot.queue_depth, 0);
        assert_eq!(snapshot.dispatched, 0);
        assert_eq!(snapshot.shed, 1);
        assert!(pool.submit(8).is_ok());
    }
}
