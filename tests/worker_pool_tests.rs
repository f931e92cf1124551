#![allow(clippy::unwrap_used, clippy::expect_used)]

use mcs_gateway::worker_pool::{BackpressureMode, WorkerPool, WorkerPoolConfig};
use may::sync::mpsc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// These tests are affected by global env vars. Use a mutex to serialize access.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

fn clean_worker_pool_env_vars() {
    std::env::remove_var("MCS_HANDLER_WORKERS");
    std::env::remove_var("MCS_HANDLER_QUEUE_BOUND");
    std::env::remove_var("MCS_BACKPRESSURE_MODE");
    std::env::remove_var("MCS_BACKPRESSURE_TIMEOUT_MS");
    std::env::remove_var("MCS_STACK_SIZE");
}

fn config(workers: usize, bound: usize, mode: BackpressureMode, timeout_ms: u64) -> WorkerPoolConfig {
    WorkerPoolConfig {
        num_workers: workers,
        queue_bound: bound,
        backpressure_mode: mode,
        backpressure_timeout_ms: timeout_ms,
        stack_size: 0x10000,
    }
}

#[test]
fn test_worker_pool_runs_every_job() {
    let done = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&done);
    let (tx, rx) = mpsc::channel();
    let pool = WorkerPool::new(
        "count",
        config(4, 64, BackpressureMode::Block, 500),
        move |job: u32| {
            counter.fetch_add(job as usize, Ordering::SeqCst);
            let _ = tx.send(());
        },
    )
    .unwrap();

    for _ in 0..50 {
        pool.submit(1).unwrap();
    }
    for _ in 0..50 {
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    assert_eq!(done.load(Ordering::SeqCst), 50);
    let snapshot = pool.metrics().snapshot();
    assert_eq!(snapshot.dispatched, 50);
    assert_eq!(snapshot.shed, 0);
}

#[test]
fn test_worker_pool_shed_mode_returns_the_job() {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let pool = WorkerPool::new(
        "shed",
        config(1, 2, BackpressureMode::Shed, 0),
        move |_job: u32| {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
        },
    )
    .unwrap();

    pool.submit(1).unwrap();
    pool.submit(2).unwrap();
    // one running, one queued: the bound is reached
    assert_eq!(pool.submit(3), Err(3));
    assert_eq!(pool.metrics().get_shed_count(), 1);

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();
}

#[test]
fn test_worker_pool_block_mode_waits_for_a_slot() {
    let pool = WorkerPool::new(
        "block",
        config(1, 1, BackpressureMode::Block, 500),
        |_job: u32| may::coroutine::sleep(Duration::from_millis(20)),
    )
    .unwrap();

    // each submit waits for the previous job to finish
    let mut accepted = 0;
    for job in 0..5 {
        if pool.submit(job).is_ok() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 5);
    assert_eq!(pool.metrics().get_shed_count(), 0);
}

#[test]
fn test_worker_pool_block_mode_times_out() {
    let pool = WorkerPool::new(
        "block-timeout",
        config(1, 1, BackpressureMode::Block, 20),
        |_job: u32| may::coroutine::sleep(Duration::from_millis(300)),
    )
    .unwrap();

    pool.submit(1).unwrap();
    assert_eq!(pool.submit(2), Err(2));
    assert_eq!(pool.metrics().get_shed_count(), 1);
}

#[test]
fn test_worker_survives_a_panicking_job() {
    let (tx, rx) = mpsc::channel();
    let pool = WorkerPool::new(
        "panics",
        config(1, 4, BackpressureMode::Block, 500),
        move |job: u32| {
            if job == 0 {
                panic!("bad job");
            }
            let _ = tx.send(job);
        },
    )
    .unwrap();

    pool.submit(0).unwrap();
    pool.submit(7).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
}

#[test]
fn test_worker_pool_config_from_env() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clean_worker_pool_env_vars();

    std::env::set_var("MCS_HANDLER_WORKERS", "8");
    std::env::set_var("MCS_HANDLER_QUEUE_BOUND", "2048");
    std::env::set_var("MCS_BACKPRESSURE_MODE", "shed");
    std::env::set_var("MCS_BACKPRESSURE_TIMEOUT_MS", "100");
    std::env::set_var("MCS_STACK_SIZE", "0x20000");

    let config = WorkerPoolConfig::from_env();

    assert_eq!(config.num_workers, 8);
    assert_eq!(config.queue_bound, 2048);
    assert_eq!(config.backpressure_mode, BackpressureMode::Shed);
    assert_eq!(config.backpressure_timeout_ms, 100);
    assert_eq!(config.stack_size, 0x20000);

    clean_worker_pool_env_vars();
}

#[test]
fn test_worker_pool_config_defaults_without_env() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clean_worker_pool_env_vars();
    assert_eq!(WorkerPoolConfig::from_env(), WorkerPoolConfig::default());
}
