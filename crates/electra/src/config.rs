use std::time::Duration;

use media_types::MediaTime;
use serde::Deserialize;

use crate::demux::{RegressionPolicy, RetryPolicy};

// --- Top-Level Configuration ---

/// Tunables for the whole pipeline, passed to each component at construction.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ElectraConfig {
    pub buffer: BufferConfig,
    pub demux: DemuxConfig,
    pub decode: DecodeConfig,
}

// --- Buffer Configuration ---

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum playable duration one track buffer may hold, in milliseconds
    pub max_duration_ms: u64,
    /// Units inspected when refreshing the front/smallest/largest caches after a pop
    pub timestamp_lookahead: usize,
    /// Treat every track buffer as active (simulcast inspection)
    pub parallel_tracks: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_duration_ms: 30_000,
            timestamp_lookahead: 8,
            parallel_tracks: false,
        }
    }
}

impl BufferConfig {
    pub fn max_duration(&self) -> MediaTime {
        MediaTime::from_millis(self.max_duration_ms as i64)
    }

    /// Capacity limit handed to buffer pushes.
    pub fn limit(&self) -> BufferLimit {
        BufferLimit {
            max_duration: self.max_duration(),
        }
    }
}

/// Capacity limit applied to one push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimit {
    pub max_duration: MediaTime,
}

impl BufferLimit {
    pub fn new(max_duration: MediaTime) -> Self {
        Self { max_duration }
    }
}

// --- Demux Configuration ---

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// Longest single wait on network data before re-checking abort and cancellation
    pub read_timeout_ms: u64,
    /// Poll interval of the worker's request channel
    pub request_poll_ms: u64,
    /// Minimum interval between download progress reports to the ABR policy
    pub progress_interval_ms: u64,
    /// Longest single wait for buffer space while emitting units
    pub emit_wait_ms: u64,
    /// Which units of a segment are checked against previously accepted timestamps
    pub regression_policy: RegressionPolicy,
    /// A fixed-width timestamp is treated as wrapped when it falls behind the
    /// previous one by more than `period / rollover_detect_divisor`
    pub rollover_detect_divisor: u32,
    /// Number of init segments kept in the cache
    pub init_cache_capacity: u64,
    /// Retries for init segment fetches (not counting the first attempt)
    pub init_max_retries: u32,
    /// Base backoff between init segment fetch attempts, in milliseconds
    pub init_retry_base_delay_ms: u64,
    /// Cap on the backoff between init segment fetch attempts, in milliseconds
    pub init_retry_max_delay_ms: u64,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 100,
            request_poll_ms: 100,
            progress_interval_ms: 200,
            emit_wait_ms: 100,
            regression_policy: RegressionPolicy::default(),
            rollover_detect_divisor: 4,
            init_cache_capacity: 16,
            init_max_retries: 2,
            init_retry_base_delay_ms: 250,
            init_retry_max_delay_ms: 2_000,
        }
    }
}

impl DemuxConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn request_poll(&self) -> Duration {
        Duration::from_millis(self.request_poll_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn emit_wait(&self) -> Duration {
        Duration::from_millis(self.emit_wait_ms)
    }

    pub fn init_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.init_max_retries,
            base_delay: Duration::from_millis(self.init_retry_base_delay_ms),
            max_delay: Duration::from_millis(self.init_retry_max_delay_ms),
            jitter: true,
        }
    }
}

// --- Decode Configuration ---

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Longest wait for the next input unit before re-checking controls
    pub input_wait_ms: u64,
    /// Pause before retrying when the decoder or renderer has no room
    pub backpressure_wait_ms: u64,
    /// A decode timestamp falling back further than this starts a drain
    pub backward_jump_threshold_ms: u64,
    /// Units retained for decoder-loss replay between sync points
    pub max_replay_units: usize,
    /// Poll interval while the host has the engine suspended
    pub suspend_poll_ms: u64,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            input_wait_ms: 10,
            backpressure_wait_ms: 5,
            backward_jump_threshold_ms: 500,
            max_replay_units: 300,
            suspend_poll_ms: 20,
        }
    }
}

impl DecodeConfig {
    pub fn input_wait(&self) -> Duration {
        Duration::from_millis(self.input_wait_ms)
    }

    pub fn backpressure_wait(&self) -> Duration {
        Duration::from_millis(self.backpressure_wait_ms)
    }

    pub fn backward_jump_threshold(&self) -> MediaTime {
        MediaTime::from_millis(self.backward_jump_threshold_ms as i64)
    }

    pub fn suspend_poll(&self) -> Duration {
        Duration::from_millis(self.suspend_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ElectraConfig::default();
        assert_eq!(config.buffer.max_duration(), MediaTime::from_millis(30_000));
        assert_eq!(config.demux.regression_policy, RegressionPolicy::FirstUnitOnly);
        assert_eq!(config.demux.init_retry_policy().max_retries, 2);
        assert_eq!(config.decode.backward_jump_threshold(), MediaTime::from_millis(500));
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: ElectraConfig = serde_json::from_str(
            r#"{ "buffer": { "max_duration_ms": 5000 }, "demux": { "regression_policy": "any_unit" } }"#,
        )
        .unwrap();
        assert_eq!(config.buffer.max_duration_ms, 5000);
        assert_eq!(config.buffer.timestamp_lookahead, 8);
        assert_eq!(config.demux.regression_policy, RegressionPolicy::AnyUnit);
        assert_eq!(config.decode.max_replay_units, 300);
    }
}
