//! Crate-wide configuration (spec §6.3).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LsnpError;

fn default_port() -> u16 {
    50999
}
fn default_profile_interval() -> u64 {
    30
}
fn default_ping_interval() -> u64 {
    10
}
fn default_stale_threshold() -> u64 {
    60
}
fn default_evict_threshold() -> u64 {
    300
}
fn default_retry_schedule() -> Vec<u64> {
    vec![2, 4, 8]
}
fn default_file_chunk_size() -> usize {
    1024
}
fn default_file_window() -> usize {
    8
}
fn default_dedupe_cap() -> usize {
    4096
}
fn default_dedupe_ttl() -> u64 {
    60
}
fn default_token_ttl() -> i64 {
    3600
}

/// All tunables named in spec §6.3, with the spec's defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LsnpConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds between PROFILE broadcasts.
    #[serde(default = "default_profile_interval")]
    pub profile_interval_secs: u64,
    /// Seconds between PING broadcasts.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// A peer is active iff seen within this many seconds.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
    /// An inactive peer is evicted after this many seconds of silence.
    #[serde(default = "default_evict_threshold")]
    pub evict_threshold_secs: u64,
    /// Retry backoff schedule (seconds) for reliable sends, capped at 3 retries.
    #[serde(default = "default_retry_schedule")]
    pub retry_schedule_secs: Vec<u64>,
    /// Default body size for a file chunk.
    #[serde(default = "default_file_chunk_size")]
    pub file_chunk_size: usize,
    /// Max unacked chunks in flight per file transfer.
    #[serde(default = "default_file_window")]
    pub file_window: usize,
    /// Dedupe cache capacity (entries).
    #[serde(default = "default_dedupe_cap")]
    pub dedupe_cap: usize,
    /// Dedupe cache TTL (seconds).
    #[serde(default = "default_dedupe_ttl")]
    pub dedupe_ttl_secs: u64,
    /// Default token lifetime (seconds) when minting.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,
    /// When set, dropped/rejected frames are surfaced as `verbose_log` UI events.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for LsnpConfig {
    fn default() -> Self {
        LsnpConfig {
            port: default_port(),
            profile_interval_secs: default_profile_interval(),
            ping_interval_secs: default_ping_interval(),
            stale_threshold_secs: default_stale_threshold(),
            evict_threshold_secs: default_evict_threshold(),
            retry_schedule_secs: default_retry_schedule(),
            file_chunk_size: default_file_chunk_size(),
            file_window: default_file_window(),
            dedupe_cap: default_dedupe_cap(),
            dedupe_ttl_secs: default_dedupe_ttl(),
            token_ttl_secs: default_token_ttl(),
            verbose: false,
        }
    }
}

impl LsnpConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, LsnpError> {
        toml::from_str(s).map_err(|e| LsnpError::MalformedFrame(format!("invalid config: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LsnpError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}
