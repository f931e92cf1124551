//! # Configuration
//!
//! [`ServerConfig`] gathers every tunable of the gateway. It is read from a
//! YAML file and then overridden from `MCS_*` environment variables:
//!
//! ```yaml
//! http:
//!   bind: 0.0.0.0:8090
//!   context_path: /yamcs
//!   default_max_body: 65536
//! dispatch:
//!   inline_warn_ms: 2000
//! streaming:
//!   chunk_threshold: 8096
//! workers:
//!   num_workers: 8
//!   backpressure_mode: shed
//! collection:
//!   default_timeout_ms: 10000
//! ```
//!
//! Every field has a default, so any subset (or no file at all) is valid.
//!
//! | variable                      | field                               |
//! |-------------------------------|-------------------------------------|
//! | `MCS_BIND`                    | `http.bind`                         |
//! | `MCS_CONTEXT_PATH`            | `http.context_path`                 |
//! | `MCS_MAX_BODY_SIZE`           | `http.default_max_body`             |
//! | `MCS_KEEP_ALIVE`              | `http.keep_alive`                   |
//! | `MCS_CHUNK_THRESHOLD`         | `streaming.chunk_threshold`         |
//! | `MCS_COLLECTION_TIMEOUT_MS`   | `collection.default_timeout_ms`     |
//! | `MCS_HANDLER_WORKERS` ...     | `workers.*` (see [`WorkerPoolConfig`]) |

use crate::collect::CollectionConfig;
use crate::dispatcher::DispatchConfig;
use crate::server::HttpConfig;
use crate::streaming::StreamingConfig;
use crate::worker_pool::WorkerPoolConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub dispatch: DispatchConfig,
    pub streaming: StreamingConfig,
    pub workers: WorkerPoolConfig,
    pub collection: CollectionConfig,
}

impl ServerConfig {
    /// Read a YAML configuration file. A missing file yields the defaults;
    /// an unreadable or invalid one is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `MCS_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(&|key| std::env::var(key).ok());
    }

    /// Apply `MCS_*` overrides from an arbitrary lookup. Unparseable values
    /// are ignored.
    pub fn apply_vars(&mut self, vars: &dyn Fn(&str) -> Option<String>) {
        if let Some(bind) = vars("MCS_BIND") {
            self.http.bind = bind;
        }
        if let Some(context_path) = vars("MCS_CONTEXT_PATH") {
            self.http.context_path = context_path;
        }
        set_parsed(vars, "MCS_MAX_BODY_SIZE", &mut self.http.default_max_body);
        if let Some(keep_alive) = vars("MCS_KEEP_ALIVE").and_then(|v| parse_bool(&v)) {
            self.http.keep_alive = keep_alive;
        }
        set_parsed(vars, "MCS_CHUNK_THRESHOLD", &mut self.streaming.chunk_threshold);
        set_parsed(
            vars,
            "MCS_COLLECTION_TIMEOUT_MS",
            &mut self.collection.default_timeout_ms,
        );
        self.workers.apply_vars(vars);
    }
}

fn set_parsed<T: FromStr>(vars: &dyn Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(v) = vars(key).and_then(|s| s.trim().parse().ok()) {
        *slot = v;
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
