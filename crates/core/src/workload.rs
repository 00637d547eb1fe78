// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workload declarations and their live runtime facet.

use crate::error::ControlError;
use crate::exit::ExitStatus;
use crate::schedule::ScheduleId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

crate::define_id! {
    /// Stable, immutable identifier of a declared workload.
    pub struct WorkloadId("wl-");
}

/// The declared intent to run a command.
///
/// Persistent across daemon restarts; the id never changes, the name is
/// globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    pub name: String,
    /// Command plus ordered argument list.
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Environment overlay: per-key override on top of the daemon's
    /// environment; all non-overridden variables are inherited.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Name of the restart policy; `None` means the built-in "none".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default)]
    pub schedules: Vec<ScheduleId>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Workload {
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.name.trim().is_empty() {
            return Err(ControlError::invalid_field("workload name must not be empty"));
        }
        match self.argv.first() {
            None => return Err(ControlError::invalid_argv("argv must not be empty")),
            Some(cmd) if cmd.is_empty() => {
                return Err(ControlError::invalid_argv("argv[0] must not be empty"))
            }
            Some(_) => {}
        }
        Ok(())
    }
}

/// Partial fields for `update_workload`. `None` means "leave unchanged".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argv: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

impl WorkloadUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the set fields onto `workload`, stamping `updated_at_ms`.
    pub fn apply(self, workload: &mut Workload, now_ms: u64) {
        if let Some(name) = self.name {
            workload.name = name;
        }
        if let Some(argv) = self.argv {
            workload.argv = argv;
        }
        if let Some(cwd) = self.cwd {
            workload.cwd = Some(cwd);
        }
        if let Some(env) = self.env {
            workload.env = env;
        }
        if let Some(group) = self.group {
            workload.group = Some(group);
        }
        if let Some(policy) = self.policy {
            workload.policy = Some(policy);
        }
        workload.updated_at_ms = now_ms;
    }
}

/// Supervisor state-machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Evaluating,
    Stopping,
    BackingOff,
    Stopped,
    Failed,
    Terminated,
}

impl Phase {
    /// Phases in which a schedule fire is dropped and a `start` is not a
    /// fresh spawn.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Phase::Starting
                | Phase::Running
                | Phase::Evaluating
                | Phase::Stopping
                | Phase::BackingOff
        )
    }

    /// Phases from which `start` begins a fresh run.
    pub fn is_startable(&self) -> bool {
        matches!(self, Phase::Idle | Phase::Stopped | Phase::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Terminated)
    }
}

crate::simple_display! {
    Phase {
        Idle => "idle",
        Starting => "starting",
        Running => "running",
        Evaluating => "evaluating",
        Stopping => "stopping",
        BackingOff => "backing_off",
        Stopped => "stopped",
        Failed => "failed",
        Terminated => "terminated",
    }
}

/// Live facet of a workload. Never persisted as a whole; reset to
/// initial on daemon restart and rebuilt by recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitStatus>,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at_ms: Option<u64>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            pid: None,
            started_at_ms: None,
            last_exit: None,
            consecutive_failures: 0,
            next_retry_at_ms: None,
        }
    }
}

#[cfg(test)]
#[path = "workload_tests.rs"]
mod tests;
