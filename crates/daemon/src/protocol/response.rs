// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Responses from the daemon to front-ends.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use warden_core::workload::{Phase, RuntimeState};
use warden_core::{ControlError, Event, LogRecord, MetricSample, Schedule, Workload};

/// One row of `list_workloads`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSummary {
    pub id: String,
    pub name: String,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    pub consecutive_failures: u32,
}

/// Full answer to `describe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadDetail {
    pub workload: Workload,
    pub runtime: RuntimeState,
    pub schedules: Vec<Schedule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Supervisor count per phase.
    pub phase_counts: BTreeMap<String, usize>,
    pub persistence_lag: bool,
    /// Worst observed fire lag of the scheduler.
    pub scheduler_drift_ms: u64,
    pub uptime_ms: u64,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Ok,
    Error { error: ControlError },
    Pong { version: String },
    /// `create_workload` result.
    Created { id: String },
    /// `put_schedule` result.
    ScheduleCreated { schedule_id: String },
    Workloads { items: Vec<WorkloadSummary> },
    Workload { detail: Box<WorkloadDetail> },
    Logs { records: Vec<LogRecord> },
    Metrics { samples: Vec<MetricSample> },
    Health { report: HealthReport },
    /// One streamed event frame (subscribe_events).
    Event { event: Event },
}

impl Response {
    pub fn error(error: ControlError) -> Self {
        Response::Error { error }
    }
}

impl From<Result<Response, ControlError>> for Response {
    fn from(result: Result<Response, ControlError>) -> Self {
        match result {
            Ok(response) => response,
            Err(error) => Response::Error { error },
        }
    }
}

#[cfg(test)]
#[path = "response_tests.rs"]
mod tests;
