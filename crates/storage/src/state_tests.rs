// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use warden_core::test_support::{fast_retry_policy, workload};
use warden_core::{ExitStatus, Schedule, ScheduleSpec};

#[test]
fn created_then_deleted_workload() {
    let mut state = MaterializedState::default();
    let w = workload("svc", &["/bin/true"]);
    let id = w.id;

    state.apply_event(&Event::WorkloadCreated { workload: w.clone() });
    assert_eq!(state.get_workload(id.as_str()), Some(&w));
    assert_eq!(state.workload_by_name("svc"), Some(&w));

    state.apply_event(&Event::WorkloadDeleted { id });
    assert!(state.get_workload(id.as_str()).is_none());
}

#[test]
fn apply_is_idempotent() {
    let mut state = MaterializedState::default();
    let w = workload("svc", &["/bin/true"]);
    let event = Event::WorkloadCreated { workload: w.clone() };

    state.apply_event(&event);
    state.apply_event(&event);
    assert_eq!(state.workloads.len(), 1);

    let started = Event::RunStarted { workload: w.id, pid: 42, at_ms: 1 };
    state.apply_event(&started);
    state.apply_event(&started);
    assert_eq!(state.running.get(w.id.as_str()), Some(&42));
}

#[test]
fn run_markers_follow_lifecycle() {
    let mut state = MaterializedState::default();
    let w = workload("svc", &["/bin/true"]);

    state.apply_event(&Event::WorkloadCreated { workload: w.clone() });
    state.apply_event(&Event::RunStarted { workload: w.id, pid: 42, at_ms: 1 });
    assert!(state.running.contains_key(w.id.as_str()));

    state.apply_event(&Event::RunExited { workload: w.id, exit: ExitStatus::Code(0), at_ms: 2 });
    assert!(!state.running.contains_key(w.id.as_str()));
}

#[test]
fn lost_on_recovery_clears_marker() {
    let mut state = MaterializedState::default();
    let w = workload("svc", &["/bin/true"]);
    state.apply_event(&Event::RunStarted { workload: w.id, pid: 42, at_ms: 1 });
    state.apply_event(&Event::LostOnRecovery { workload: w.id, pid: 42 });
    assert!(state.running.is_empty());
}

#[test]
fn deleting_workload_drops_its_schedules() {
    let mut state = MaterializedState::default();
    let w = workload("svc", &["/bin/true"]);
    let schedule = Schedule::new(w.id, ScheduleSpec::Interval { every_ms: 1000 }, true);

    state.apply_event(&Event::WorkloadCreated { workload: w.clone() });
    state.apply_event(&Event::SchedulePut { schedule: schedule.clone() });
    assert_eq!(state.schedules_for(w.id.as_str()).len(), 1);

    state.apply_event(&Event::WorkloadDeleted { id: w.id });
    assert!(state.schedules.is_empty());
}

#[test]
fn schedule_enable_disable() {
    let mut state = MaterializedState::default();
    let w = workload("svc", &["/bin/true"]);
    let mut schedule = Schedule::new(w.id, ScheduleSpec::Interval { every_ms: 1000 }, true);
    schedule.next_fire_ms = Some(5000);

    state.apply_event(&Event::SchedulePut { schedule: schedule.clone() });
    state.apply_event(&Event::ScheduleEnabled { id: schedule.id, enabled: false });

    let stored = &state.schedules[schedule.id.as_str()];
    assert!(!stored.enabled);
    assert_eq!(stored.next_fire_ms, None);
}

#[test]
fn one_shot_fire_disables_in_replay() {
    let mut state = MaterializedState::default();
    let w = workload("svc", &["/bin/true"]);
    let schedule = Schedule::new(w.id, ScheduleSpec::Once { at_ms: 9000 }, true);

    state.apply_event(&Event::SchedulePut { schedule: schedule.clone() });
    state.apply_event(&Event::ScheduleFired { id: schedule.id, workload: w.id, at_ms: 9000 });

    let stored = &state.schedules[schedule.id.as_str()];
    assert!(!stored.enabled);
    assert_eq!(stored.last_fire_ms, Some(9000));
}

#[test]
fn policies_are_keyed_by_name() {
    let mut state = MaterializedState::default();
    let policy = fast_retry_policy(3);
    state.apply_event(&Event::PolicyPut { policy: policy.clone() });
    assert_eq!(state.policies.get("fast-retry"), Some(&policy));
}
