// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Events emitted by the daemon.
//!
//! One enum serves two purposes: the durable audit trail (declared-state
//! mutations and run milestones appended to the WAL) and the live stream
//! fanned out to subscribers. Serializes as `{"type": "ns:verb", ...}`.

use crate::exit::ExitStatus;
use crate::policy::RestartPolicy;
use crate::schedule::{Schedule, ScheduleId};
use crate::workload::{Phase, Workload, WorkloadId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // -- declared state --
    #[serde(rename = "workload:created")]
    WorkloadCreated { workload: Workload },

    #[serde(rename = "workload:updated")]
    WorkloadUpdated { workload: Workload },

    #[serde(rename = "workload:deleted")]
    WorkloadDeleted { id: WorkloadId },

    #[serde(rename = "policy:put")]
    PolicyPut { policy: RestartPolicy },

    #[serde(rename = "schedule:put")]
    SchedulePut { schedule: Schedule },

    #[serde(rename = "schedule:enabled")]
    ScheduleEnabled { id: ScheduleId, enabled: bool },

    #[serde(rename = "schedule:deleted")]
    ScheduleDeleted { id: ScheduleId },

    // -- run lifecycle --
    #[serde(rename = "run:phase")]
    PhaseChanged { workload: WorkloadId, from: Phase, to: Phase, at_ms: u64 },

    #[serde(rename = "run:started")]
    RunStarted { workload: WorkloadId, pid: i32, at_ms: u64 },

    #[serde(rename = "run:exited")]
    RunExited { workload: WorkloadId, exit: ExitStatus, at_ms: u64 },

    /// A pid recorded as running in a prior daemon generation is gone.
    #[serde(rename = "run:lost")]
    LostOnRecovery { workload: WorkloadId, pid: i32 },

    // -- scheduling --
    #[serde(rename = "schedule:fired")]
    ScheduleFired { id: ScheduleId, workload: WorkloadId, at_ms: u64 },

    /// A fire arrived while the workload was active; fires never queue.
    #[serde(rename = "schedule:skipped")]
    SkippedConcurrent { id: ScheduleId, workload: WorkloadId, phase: Phase },

    // -- backpressure & health --
    #[serde(rename = "log:dropped")]
    LogDropped { workload: WorkloadId, count: u64 },

    #[serde(rename = "store:lag")]
    PersistenceLag { pending: usize, consecutive_failures: u32 },

    /// Runtime events dropped from the persistence outbox.
    #[serde(rename = "store:dropped")]
    PersistenceDropped { count: u64 },

    #[serde(rename = "subscriber:lagged")]
    SubscriberLagged { subscriber: u64 },
}

impl Event {
    /// The workload this event concerns, when it concerns exactly one.
    pub fn workload(&self) -> Option<WorkloadId> {
        match self {
            Event::WorkloadCreated { workload } | Event::WorkloadUpdated { workload } => {
                Some(workload.id)
            }
            Event::WorkloadDeleted { id } => Some(*id),
            Event::SchedulePut { schedule } => Some(schedule.workload),
            Event::PhaseChanged { workload, .. }
            | Event::RunStarted { workload, .. }
            | Event::RunExited { workload, .. }
            | Event::LostOnRecovery { workload, .. }
            | Event::ScheduleFired { workload, .. }
            | Event::SkippedConcurrent { workload, .. }
            | Event::LogDropped { workload, .. } => Some(*workload),
            Event::PolicyPut { .. }
            | Event::ScheduleEnabled { .. }
            | Event::ScheduleDeleted { .. }
            | Event::PersistenceLag { .. }
            | Event::PersistenceDropped { .. }
            | Event::SubscriberLagged { .. } => None,
        }
    }

    /// Whether this event belongs in the durable audit trail.
    ///
    /// Backpressure signals are live-stream only; persisting them would
    /// feed the very pressure they report.
    pub fn is_durable(&self) -> bool {
        !matches!(
            self,
            Event::LogDropped { .. }
                | Event::PersistenceLag { .. }
                | Event::PersistenceDropped { .. }
                | Event::SubscriberLagged { .. }
        )
    }

    /// Compact one-line form for log output.
    pub fn log_summary(&self) -> String {
        match self {
            Event::WorkloadCreated { workload } => {
                format!("workload:created {} ({})", workload.id, workload.name)
            }
            Event::WorkloadUpdated { workload } => format!("workload:updated {}", workload.id),
            Event::WorkloadDeleted { id } => format!("workload:deleted {id}"),
            Event::PolicyPut { policy } => format!("policy:put {}", policy.name),
            Event::SchedulePut { schedule } => {
                format!("schedule:put {} ({})", schedule.id, schedule.spec.kind_str())
            }
            Event::ScheduleEnabled { id, enabled } => {
                format!("schedule:enabled {id} -> {enabled}")
            }
            Event::ScheduleDeleted { id } => format!("schedule:deleted {id}"),
            Event::PhaseChanged { workload, from, to, .. } => {
                format!("run:phase {workload} {from} -> {to}")
            }
            Event::RunStarted { workload, pid, .. } => format!("run:started {workload} pid={pid}"),
            Event::RunExited { workload, exit, .. } => format!("run:exited {workload} {exit}"),
            Event::LostOnRecovery { workload, pid } => format!("run:lost {workload} pid={pid}"),
            Event::ScheduleFired { id, workload, .. } => {
                format!("schedule:fired {id} -> {workload}")
            }
            Event::SkippedConcurrent { id, workload, phase } => {
                format!("schedule:skipped {id} -> {workload} ({phase})")
            }
            Event::LogDropped { workload, count } => format!("log:dropped {workload} n={count}"),
            Event::PersistenceLag { pending, consecutive_failures } => {
                format!("store:lag pending={pending} failures={consecutive_failures}")
            }
            Event::PersistenceDropped { count } => format!("store:dropped n={count}"),
            Event::SubscriberLagged { subscriber } => format!("subscriber:lagged #{subscriber}"),
        }
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
