//! Player Configuration
//!
//! Controls the resource envelope and pacing of playback:
//!
//! - **read_ahead_ms**: how far ahead of the playback cursor the producer
//!   buffers, as a *time window*. Payload sizes vary by orders of magnitude
//!   between topics, so an item-count bound would be meaningless; a time
//!   bound keeps the buffer proportional to playback, not to payloads.
//! - **message_cache_bytes**: hard ceiling for decoded messages held by the
//!   caching source (default 256 MiB). Eviction runs before admission, so
//!   the ceiling is never exceeded.
//! - **cache_block_span_ms**: time covered by one decoded-message cache
//!   block.
//! - **tick_interval_ms**: playback tick cadence (default 17 ms ≈ 60 Hz).
//! - **init_failure_policy**: what a multi-source merge does when one
//!   source fails to initialize.
//!
//! ## Usage
//!
//! ```ignore
//! use rewind_player::PlayerConfig;
//!
//! // Small-memory deployment
//! let config = PlayerConfig {
//!     message_cache_bytes: 64 * 1024 * 1024,
//!     read_ahead_ms: 5_000,
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use rewind_log::BlockCacheConfig;

/// Policy for a multi-source merge when one source fails to initialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitFailurePolicy {
    /// One failure aborts the whole merge (default)
    Abort,
    /// Drop the failed source, record a problem, continue with the rest
    DropAndContinue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Read-ahead window in milliseconds (default: 10 seconds)
    #[serde(default = "default_read_ahead_ms")]
    pub read_ahead_ms: u64,

    /// Decoded-message cache ceiling in bytes (default: 256 MiB)
    #[serde(default = "default_message_cache_bytes")]
    pub message_cache_bytes: u64,

    /// Time span of one decoded-message cache block in milliseconds
    /// (default: 10 seconds)
    #[serde(default = "default_cache_block_span_ms")]
    pub cache_block_span_ms: u64,

    /// Playback tick interval in milliseconds (default: 17)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Initial playback speed factor (default: 1.0)
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Multi-source initialization failure policy (default: abort)
    #[serde(default = "default_init_failure_policy")]
    pub init_failure_policy: InitFailurePolicy,

    /// Raw-byte block cache configuration, shared by all sources
    #[serde(skip)]
    pub block_cache: BlockCacheConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            read_ahead_ms: default_read_ahead_ms(),
            message_cache_bytes: default_message_cache_bytes(),
            cache_block_span_ms: default_cache_block_span_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            speed: default_speed(),
            init_failure_policy: default_init_failure_policy(),
            block_cache: BlockCacheConfig::default(),
        }
    }
}

impl PlayerConfig {
    pub fn read_ahead(&self) -> Duration {
        Duration::from_millis(self.read_ahead_ms)
    }

    pub fn cache_block_span(&self) -> Duration {
        Duration::from_millis(self.cache_block_span_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn default_read_ahead_ms() -> u64 {
    10_000
}

fn default_message_cache_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_cache_block_span_ms() -> u64 {
    10_000
}

fn default_tick_interval_ms() -> u64 {
    17
}

fn default_speed() -> f64 {
    1.0
}

fn default_init_failure_policy() -> InitFailurePolicy {
    InitFailurePolicy::Abort
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PlayerConfig::default();
        assert_eq!(config.read_ahead(), Duration::from_secs(10));
        assert_eq!(config.message_cache_bytes, 256 * 1024 * 1024);
        assert_eq!(config.tick_interval(), Duration::from_millis(17));
        assert_eq!(config.speed, 1.0);
        assert_eq!(config.init_failure_policy, InitFailurePolicy::Abort);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: PlayerConfig =
            serde_json::from_str(r#"{"read_ahead_ms": 2000, "init_failure_policy": "drop_and_continue"}"#)
                .unwrap();
        assert_eq!(config.read_ahead_ms, 2000);
        assert_eq!(config.init_failure_policy, InitFailurePolicy::DropAndContinue);
        // untouched fields keep defaults
        assert_eq!(config.tick_interval_ms, 17);
    }
}
