// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materialized state from WAL replay.
//!
//! Events are facts about what happened; this is the fold over them.
//!
//! # Idempotency requirement
//!
//! Every handler in [`apply_event`](MaterializedState::apply_event) MUST
//! be idempotent: applying the same event twice must produce the same
//! state as applying it once, because events are applied both when first
//! recorded and again during replay after a crash. Use assignment over
//! mutation and guard anything that counts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use warden_core::{Event, RestartPolicy, Schedule, Workload};

/// Declared state plus the minimal run markers recovery needs.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MaterializedState {
    /// Workload id → declared workload.
    pub workloads: HashMap<String, Workload>,
    /// Policy name → policy.
    pub policies: HashMap<String, RestartPolicy>,
    /// Schedule id → schedule.
    pub schedules: HashMap<String, Schedule>,
    /// Workload id → pid recorded as running. A pid still present here
    /// at startup belonged to a prior daemon generation and is treated
    /// as lost during recovery, never re-adopted.
    #[serde(default)]
    pub running: HashMap<String, i32>,
}

impl MaterializedState {
    pub fn get_workload(&self, id: &str) -> Option<&Workload> {
        self.workloads.get(id)
    }

    pub fn workload_by_name(&self, name: &str) -> Option<&Workload> {
        self.workloads.values().find(|w| w.name == name)
    }

    /// Schedules attached to one workload.
    pub fn schedules_for(&self, workload_id: &str) -> Vec<&Schedule> {
        let mut schedules: Vec<&Schedule> =
            self.schedules.values().filter(|s| s.workload == workload_id).collect();
        schedules.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        schedules
    }

    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::WorkloadCreated { workload } | Event::WorkloadUpdated { workload } => {
                self.workloads.insert(workload.id.as_str().to_string(), workload.clone());
            }
            Event::WorkloadDeleted { id } => {
                self.workloads.remove(id.as_str());
                self.running.remove(id.as_str());
                self.schedules.retain(|_, s| s.workload != *id);
            }
            Event::PolicyPut { policy } => {
                self.policies.insert(policy.name.clone(), policy.clone());
            }
            Event::SchedulePut { schedule } => {
                self.schedules.insert(schedule.id.as_str().to_string(), schedule.clone());
            }
            Event::ScheduleEnabled { id, enabled } => {
                if let Some(schedule) = self.schedules.get_mut(id.as_str()) {
                    schedule.enabled = *enabled;
                    if !enabled {
                        schedule.next_fire_ms = None;
                    }
                }
            }
            Event::ScheduleDeleted { id } => {
                self.schedules.remove(id.as_str());
            }
            Event::ScheduleFired { id, at_ms, .. } => {
                if let Some(schedule) = self.schedules.get_mut(id.as_str()) {
                    schedule.last_fire_ms = Some(*at_ms);
                    if matches!(schedule.spec, warden_core::ScheduleSpec::Once { .. }) {
                        schedule.enabled = false;
                        schedule.next_fire_ms = None;
                    }
                }
            }
            Event::RunStarted { workload, pid, .. } => {
                self.running.insert(workload.as_str().to_string(), *pid);
            }
            Event::RunExited { workload, .. } | Event::LostOnRecovery { workload, .. } => {
                self.running.remove(workload.as_str());
            }
            // Phase transitions and backpressure signals carry no
            // declared state.
            Event::PhaseChanged { .. }
            | Event::SkippedConcurrent { .. }
            | Event::LogDropped { .. }
            | Event::PersistenceLag { .. }
            | Event::PersistenceDropped { .. }
            | Event::SubscriberLagged { .. } => {}
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
