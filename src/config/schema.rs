//! Configuration schema, loaded from `~/.clawrepl/config.toml`.
//!
//! Every field has a serde default so a partial (or absent) file works;
//! `Config::default()` is the documented baseline.

use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ── Top-level config ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// Load from an explicit path, or the default location when `None`.
    /// A missing default file yields `Config::default()`; a missing
    /// explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path()?, false),
        };

        if !path.exists() {
            if explicit {
                anyhow::bail!("config file not found: {}", path.display());
            }
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// `~/.clawrepl/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let dirs = UserDirs::new().context("cannot determine home directory")?;
        Ok(dirs.home_dir().join(".clawrepl").join("config.toml"))
    }
}

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway host (default: 127.0.0.1). This server is loopback-only by
    /// design; non-local binds are refused at startup.
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Gateway port (default: 8710)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Require a bearer token on every request (default: true)
    #[serde(default = "default_true")]
    pub require_token: bool,
    /// Accepted bearer tokens. Empty with `require_token = true` mints an
    /// ephemeral token at startup.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// RPC requests served concurrently; streams are exempt.
    #[serde(default = "default_max_concurrent_rpc")]
    pub max_concurrent_rpc: usize,

    /// Per-request timeout for RPC calls, seconds. Long-lived streams are
    /// exempt.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Shut the server down after this many seconds with no RPC traffic
    /// and no attached stream. 0 disables.
    #[serde(default)]
    pub idle_shutdown_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            require_token: true,
            tokens: Vec::new(),
            max_concurrent_rpc: default_max_concurrent_rpc(),
            request_timeout_secs: default_request_timeout_secs(),
            idle_shutdown_secs: 0,
        }
    }
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    8710
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_rpc() -> usize {
    32
}

fn default_request_timeout_secs() -> u64 {
    30
}

// ── Sync core ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Bounded queue length per subscriber.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    /// Events retained per agent for reconnect replay.
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,

    /// Seconds of stream silence before a heartbeat ping.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Consecutive dropped events before a slow subscriber is evicted.
    #[serde(default = "default_eviction_threshold")]
    pub eviction_threshold: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            ring_buffer_size: default_ring_buffer_size(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            eviction_threshold: default_eviction_threshold(),
        }
    }
}

impl SyncConfig {
    pub fn hub_config(&self) -> crate::events::HubConfig {
        crate::events::HubConfig {
            queue_capacity: self.subscriber_queue_capacity,
            ring_size: self.ring_buffer_size,
            eviction_threshold: self.eviction_threshold,
        }
    }
}

fn default_subscriber_queue_capacity() -> usize {
    100
}

fn default_ring_buffer_size() -> usize {
    100
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_eviction_threshold() -> u32 {
    10
}
