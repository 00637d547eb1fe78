// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration.
//!
//! Every key is enumerated here with its default; unknown keys are
//! rejected at load so a typo fails fast instead of silently using a
//! default.

use crate::time_fmt::parse_duration;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown timezone {0:?}")]
    Timezone(String),
    #[error("invalid {key}: {message}")]
    Value { key: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Timezone for cron evaluation.
    pub timezone: String,
    /// Max records per log write.
    pub log_flush_batch: usize,
    /// Max delay before a log flush.
    pub log_flush_interval_ms: u64,
    /// In-memory backpressure bound per workload.
    pub log_queue_max: usize,
    /// Metric sampling cadence.
    pub metric_sample_interval_ms: u64,
    /// Grace period for `stop` when unspecified.
    pub default_stop_grace_ms: u64,
    /// Coordinator → supervisor reply timeout.
    pub command_timeout_ms: u64,
    /// Log/metric retention ceiling, as a duration string.
    pub retention_max_age: String,
    /// Per-workload record cap.
    pub retention_max_records: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            log_flush_batch: 100,
            log_flush_interval_ms: 200,
            log_queue_max: 10_000,
            metric_sample_interval_ms: 5_000,
            default_stop_grace_ms: 10_000,
            command_timeout_ms: 5_000,
            retention_max_age: "30d".to_string(),
            retention_max_records: 1_000_000,
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::Read { path: path.display().to_string(), source: e })
            }
        };
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tz()?;
        self.retention_max_age()?;
        if self.log_flush_batch == 0 {
            return Err(ConfigError::Value {
                key: "log_flush_batch",
                message: "must be at least 1".to_string(),
            });
        }
        if self.log_queue_max == 0 {
            return Err(ConfigError::Value {
                key: "log_queue_max",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone.parse().map_err(|_| ConfigError::Timezone(self.timezone.clone()))
    }

    pub fn retention_max_age(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.retention_max_age).map_err(|e| ConfigError::Value {
            key: "retention_max_age",
            message: e.to_string(),
        })
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    pub fn metric_sample_interval(&self) -> Duration {
        Duration::from_millis(self.metric_sample_interval_ms)
    }

    pub fn default_stop_grace(&self) -> Duration {
        Duration::from_millis(self.default_stop_grace_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
