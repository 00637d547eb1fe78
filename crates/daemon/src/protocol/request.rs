// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Requests from front-ends to the daemon.
//!
//! Durations arrive as the human-readable wire format (`10s`, `1h30m`);
//! handlers parse them before touching the coordinator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use warden_core::record::LogStream;
use warden_core::workload::WorkloadUpdate;
use warden_core::RestartPolicy;

/// Schedule kind on the wire; the expression field is interpreted
/// accordingly (cron string / duration / RFC 3339 instant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    /// Health check ping
    Ping,

    /// Version handshake
    Hello { version: String },

    /// Request daemon shutdown
    Shutdown {
        /// Kill running workloads instead of waiting for graceful stops
        #[serde(default)]
        kill: bool,
    },

    CreateWorkload {
        name: String,
        argv: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy: Option<String>,
        /// Schedules created atomically with the workload.
        #[serde(default)]
        schedules: Vec<(ScheduleKind, String)>,
    },

    UpdateWorkload {
        id: String,
        #[serde(default)]
        fields: WorkloadUpdate,
    },

    DeleteWorkload {
        id: String,
        /// Required when the workload is currently running.
        #[serde(default)]
        force: bool,
    },

    Start { id: String },

    Stop {
        id: String,
        /// Grace period before the kill signal (wire duration format).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grace: Option<String>,
        /// Skip the grace period entirely.
        #[serde(default)]
        force: bool,
    },

    Restart {
        id: String,
        /// Delay between the stop and the start halves.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<String>,
    },

    ListWorkloads {
        /// Substring filter on name or group.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },

    Describe { id: String },

    PutPolicy { policy: RestartPolicy },

    PutSchedule {
        /// Owning workload id.
        id: String,
        kind: ScheduleKind,
        expression: String,
        #[serde(default = "default_true")]
        enabled: bool,
    },

    EnableSchedule { schedule_id: String },

    DisableSchedule { schedule_id: String },

    QueryLogs {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream: Option<LogStream>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grep: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tail: Option<usize>,
    },

    QueryMetrics {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until_ms: Option<u64>,
    },

    /// Stream events until the client disconnects.
    SubscribeEvents {
        /// Restrict to one workload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workload: Option<String>,
    },

    Health,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
#[path = "request_tests.rs"]
mod tests;
