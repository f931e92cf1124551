//! # Runtime Module
//!
//! Coroutine plumbing shared by the server, the dispatcher watchdogs and the
//! worker pool.
//!
//! ## Environment Variables
//!
//! ### `MCS_STACK_SIZE`
//!
//! Stack size for every coroutine this crate spawns. Accepts decimal
//! (`65536`) or hexadecimal (`0x10000`). Default: `0x10000` (64 KB).
//!
//! Stack size trades memory for call depth: total virtual memory is roughly
//! `stack_size × live coroutines`. Handlers that serialize deep JSON trees
//! or run archive queries inline want the default or more.

use may::coroutine::JoinHandle;
use std::env;
use std::io;

/// Default coroutine stack size (64 KB).
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Stack size for coroutines in bytes
    pub stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let stack_size = env::var("MCS_STACK_SIZE")
            .ok()
            .and_then(|v| parse_size(&v))
            .unwrap_or(DEFAULT_STACK_SIZE);
        RuntimeConfig { stack_size }
    }
}

/// Parse a byte size written in decimal or `0x` hexadecimal.
#[must_use]
pub fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Spawn a named coroutine with an explicit stack size.
///
/// Returns the spawn error instead of panicking; callers decide whether a
/// failed spawn is fatal.
pub fn spawn_coroutine<F>(name: &str, stack_size: usize, f: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    spawn_joinable(name, stack_size, f).map(drop)
}

/// Like [`spawn_coroutine`], keeping the handle to join or cancel it later.
pub fn spawn_joinable<F, T>(name: &str, stack_size: usize, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    // SAFETY: `Builder::spawn` is unsafe because the coroutine must not touch
    // thread-local storage that outlives a migration between worker threads.
    // The closures spawned by this crate only use owned, `Send` state and
    // channel handles.
    unsafe {
        may::coroutine::Builder::new()
            .name(name.to_string())
            .stack_size(stack_size)
            .spawn(f)
    }
}
