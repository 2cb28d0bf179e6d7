//! Centralized configuration for Trickle.
//!
//! All tunable parameters for stream memory, timers and speed sampling are
//! defined here to avoid hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::TrickleError;

/// Central configuration for all Trickle components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct TrickleConfig {
    pub streaming: StreamingConfig,
    pub engine: EngineConfig,
    pub speed: SpeedConfig,
}

/// Stream memory and lifecycle configuration.
///
/// The memory limit drives both the piece cache capacity and the size of
/// the byte window served per response.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Memory budget per active stream in bytes
    pub memory_limit: u64,
    /// Time without delivered bytes before a stream is dropped
    pub idle_timeout: Duration,
    /// Time a torrent may sit without streams before it is destroyed
    pub remove_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024, // 64 MiB
            idle_timeout: Duration::from_secs(60),
            remove_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Torrent engine interaction configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for adding a torrent and receiving its metadata
    pub add_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            add_timeout: Duration::from_secs(30),
        }
    }
}

/// Speed history sampling configuration.
#[derive(Debug, Clone)]
pub struct SpeedConfig {
    /// Interval between rate samples
    pub sample_interval: Duration,
    /// Number of samples retained per torrent
    pub history_depth: usize,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            history_depth: 300, // 5 minutes at 1 Hz
        }
    }
}

impl TrickleConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(bytes) = env_parse::<u64>("TRICKLE_STREAM_MEMORY_LIMIT") {
            config.streaming.memory_limit = bytes;
        }

        if let Some(seconds) = env_parse::<u64>("TRICKLE_IDLE_TIMEOUT_SECS") {
            config.streaming.idle_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("TRICKLE_REMOVE_TIMEOUT_SECS") {
            config.streaming.remove_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("TRICKLE_ADD_TIMEOUT_SECS") {
            config.engine.add_timeout = Duration::from_secs(seconds);
        }

        if let Some(millis) = env_parse::<u64>("TRICKLE_SPEED_INTERVAL_MS") {
            config.speed.sample_interval = Duration::from_millis(millis);
        }

        if let Some(depth) = env_parse::<usize>("TRICKLE_SPEED_HISTORY") {
            config.speed.history_depth = depth;
        }

        config
    }

    /// Creates a configuration with short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            streaming: StreamingConfig {
                memory_limit: 16 * 1024 * 1024,
                idle_timeout: Duration::from_secs(5),
                remove_timeout: Duration::from_secs(10),
            },
            engine: EngineConfig {
                add_timeout: Duration::from_secs(2),
            },
            speed: SpeedConfig {
                sample_interval: Duration::from_secs(1),
                history_depth: 10,
            },
        }
    }

    /// Validates values that would make the cache or sampler degenerate.
    ///
    /// # Errors
    ///
    /// - `TrickleError::Configuration` - If memory limit, sample interval or history depth is zero
    pub fn validate(&self) -> Result<(), TrickleError> {
        if self.streaming.memory_limit == 0 {
            return Err(TrickleError::Configuration {
                reason: "stream memory limit must be greater than zero".to_string(),
            });
        }

        if self.speed.sample_interval.is_zero() {
            return Err(TrickleError::Configuration {
                reason: "speed sample interval must be greater than zero".to_string(),
            });
        }

        if self.speed.history_depth == 0 {
            return Err(TrickleError::Configuration {
                reason: "speed history depth must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
