use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::PlayerError;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PlayerConfig {
    #[serde(default = "default_debug")]
    pub debug: bool,
    #[serde(default = "default_probe_bytes")]
    pub probe_bytes: u64,
    #[serde(default = "default_max_probe_bytes")]
    pub max_probe_bytes: u64,
    #[serde(default = "default_max_scan_requests")]
    pub max_scan_requests: usize,
    #[serde(default = "default_fetch_window")]
    pub fetch_window: usize,
    #[serde(default = "default_min_buffer_ahead")]
    pub min_buffer_ahead: f64,
    #[serde(default = "default_max_buffer_ahead")]
    pub max_buffer_ahead: f64,
    #[serde(default = "default_max_buffer_behind")]
    pub max_buffer_behind: f64,
    /// Seconds of timestamp slack before a gap is treated as a discontinuity
    #[serde(default = "default_discontinuity_tolerance")]
    pub discontinuity_tolerance: f64,
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
    #[serde(default = "default_probe_retry_delay_ms")]
    pub probe_retry_delay_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_debug() -> bool {
    false
}

fn default_probe_bytes() -> u64 {
    64 * 1024
}

fn default_max_probe_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_max_scan_requests() -> usize {
    4096
}

fn default_fetch_window() -> usize {
    4
}

fn default_min_buffer_ahead() -> f64 {
    5.0
}

fn default_max_buffer_ahead() -> f64 {
    60.0
}

fn default_max_buffer_behind() -> f64 {
    30.0
}

fn default_discontinuity_tolerance() -> f64 {
    0.1
}

fn default_probe_retries() -> u32 {
    3
}

fn default_probe_retry_delay_ms() -> u64 {
    500
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    20
}

fn default_tick_interval_ms() -> u64 {
    250
}

fn default_channel_capacity() -> usize {
    16
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            debug: default_debug(),
            probe_bytes: default_probe_bytes(),
            max_probe_bytes: default_max_probe_bytes(),
            max_scan_requests: default_max_scan_requests(),
            fetch_window: default_fetch_window(),
            min_buffer_ahead: default_min_buffer_ahead(),
            max_buffer_ahead: default_max_buffer_ahead(),
            max_buffer_behind: default_max_buffer_behind(),
            discontinuity_tolerance: default_discontinuity_tolerance(),
            probe_retries: default_probe_retries(),
            probe_retry_delay_ms: default_probe_retry_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl PlayerConfig {
    pub fn from_toml(content: &str) -> Result<Self, PlayerError> {
        let config: PlayerConfig =
            toml::from_str(content).map_err(|e| PlayerError::InvalidConfig { err: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, PlayerError> {
        let content = std::fs::read_to_string(path).map_err(|e| PlayerError::InvalidConfig {
            err: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), PlayerError> {
        let invalid = |err: &str| {
            Err(PlayerError::InvalidConfig {
                err: err.to_string(),
            })
        };
        if self.probe_bytes == 0 || self.max_probe_bytes < self.probe_bytes {
            return invalid("probe_bytes must be non-zero and not exceed max_probe_bytes");
        }
        if self.fetch_window == 0 {
            return invalid("fetch_window must be at least 1");
        }
        if self.channel_capacity == 0 {
            return invalid("channel_capacity must be at least 1");
        }
        if self.min_buffer_ahead < 0.0 || self.max_buffer_ahead < self.min_buffer_ahead {
            return invalid("max_buffer_ahead must not be below min_buffer_ahead");
        }
        if self.discontinuity_tolerance < 0.0 {
            return invalid("discontinuity_tolerance must not be negative");
        }
        Ok(())
    }

    /// Level used for per-segment diagnostics
    pub fn verbose_level(&self) -> log::Level {
        if self.debug {
            log::Level::Info
        } else {
            log::Level::Trace
        }
    }

    /// Backoff before the given probe retry, starting at 1
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.probe_retry_delay_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}
