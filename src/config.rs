//! Narrow TOML-backed configuration loader.
//!
//! This stands in for the external preferences store the driver ultimately
//! reads `network_use` from. It intentionally does not implement general
//! preference parsing — only the handful of engine tunables this crate
//! actually consumes.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::network::NetworkUse;
use crate::pool::MAX_POOL;
use crate::queue::MAX_WORKERS;

/// Fixed-size chunk used when streaming a response body to its sink.
pub const CHUNK_SIZE: usize = 4096;

/// Process-level tunables for the download engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently running worker threads.
    pub max_workers: usize,
    /// Upper bound on idle pooled connections per endpoint.
    pub max_pool_per_endpoint: usize,
    /// Chunk size used when streaming response bodies.
    pub chunk_size: usize,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
    /// Per-read timeout on the blocking HTTP client; also bounds how quickly
    /// an aborted download notices the abort flag between chunks.
    pub read_timeout: Duration,
    /// The network policy read by the [`Driver`](crate::driver::Driver).
    pub network_use: NetworkUse,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_workers: MAX_WORKERS,
            max_pool_per_endpoint: MAX_POOL,
            chunk_size: CHUNK_SIZE,
            user_agent: concat!("fetch-core/", env!("CARGO_PKG_VERSION")).to_string(),
            read_timeout: Duration::from_millis(250),
            network_use: NetworkUse::Full,
        }
    }
}

/// On-disk representation of the subset of preferences this crate reads.
#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    network_use: Option<NetworkUse>,
    #[serde(default)]
    max_workers: Option<usize>,
    #[serde(default)]
    max_pool_per_endpoint: Option<usize>,
    #[serde(default)]
    user_agent: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl EngineConfig {
    /// Loads overrides from a TOML file at `path`, falling back to defaults
    /// for any field that is absent. Missing fields are not an error; a
    /// missing *file* is, since the caller presumably expected one to exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_ref.display().to_string(),
            source,
        })?;

        let mut config = EngineConfig::default();
        if let Some(network_use) = raw.network_use {
            config.network_use = network_use;
        }
        if let Some(max_workers) = raw.max_workers {
            config.max_workers = max_workers;
        }
        if let Some(max_pool_per_endpoint) = raw.max_pool_per_endpoint {
            config.max_pool_per_endpoint = max_pool_per_endpoint;
        }
        if let Some(user_agent) = raw.user_agent {
            config.user_agent = user_agent;
        }
        Ok(config)
    }
}
