// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only log and metric records.

use crate::workload::WorkloadId;
use serde::{Deserialize, Serialize};

/// Which stream a log record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Daemon-generated records (spawn failures, lifecycle notes).
    System,
}

crate::simple_display! {
    LogStream {
        Stdout => "stdout",
        Stderr => "stderr",
        System => "system",
    }
}

/// One captured output line.
///
/// `seq` is assigned by the store on append: strictly increasing and
/// contiguous per workload, modulo explicit truncation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub workload: WorkloadId,
    pub seq: u64,
    pub at_ms: u64,
    pub stream: LogStream,
    /// Line payload, UTF-8 with replacement.
    pub payload: String,
    /// Set when the line exceeded the maximum length and was split.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl LogRecord {
    pub fn system(workload: WorkloadId, at_ms: u64, payload: impl Into<String>) -> Self {
        Self { workload, seq: 0, at_ms, stream: LogStream::System, payload: payload.into(), truncated: false }
    }
}

/// One resource sample, taken while the process is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub workload: WorkloadId,
    pub at_ms: u64,
    /// CPU fraction: 0.0–N where N is the core count.
    pub cpu: f64,
    pub rss_bytes: u64,
    pub threads: u64,
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
