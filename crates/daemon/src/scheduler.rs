// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The scheduler: schedule declarations → fire messages.
//!
//! Owns a priority queue of `(next_fire, schedule)` driven by a single
//! timer-wheel token for the earliest deadline. Fires are dispatched to
//! the coordinator, which routes them to the owning supervisor; whether
//! a fire is honored or skipped is the supervisor's call. Fires never
//! queue.

use crate::timer::{TimerToken, TimerWheel};
use chrono_tz::Tz;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use warden_core::schedule::{Schedule, ScheduleId};
use warden_core::workload::WorkloadId;
use warden_core::{Clock, ControlError, Event};
use warden_storage::StoreGateway;

/// A fire on its way to the owning supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FireMsg {
    pub schedule: ScheduleId,
    pub workload: WorkloadId,
}

pub enum SchedulerCommand {
    /// Insert or replace a schedule (already persisted by the caller).
    Put { schedule: Schedule },
    Delete { id: ScheduleId },
    SetEnabled { id: ScheduleId, enabled: bool },
    /// Drop every schedule owned by a deleted workload.
    DropWorkload { workload: WorkloadId },
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
    drift_ms: Arc<AtomicU64>,
}

impl SchedulerHandle {
    async fn send(&self, command: SchedulerCommand) -> Result<(), ControlError> {
        self.tx.send(command).await.map_err(|_| ControlError::internal("scheduler terminated"))
    }

    pub async fn put(&self, schedule: Schedule) -> Result<(), ControlError> {
        self.send(SchedulerCommand::Put { schedule }).await
    }

    pub async fn delete(&self, id: ScheduleId) -> Result<(), ControlError> {
        self.send(SchedulerCommand::Delete { id }).await
    }

    pub async fn set_enabled(&self, id: ScheduleId, enabled: bool) -> Result<(), ControlError> {
        self.send(SchedulerCommand::SetEnabled { id, enabled }).await
    }

    pub async fn drop_workload(&self, workload: WorkloadId) -> Result<(), ControlError> {
        self.send(SchedulerCommand::DropWorkload { workload }).await
    }

    /// Worst observed fire lag since startup.
    pub fn drift_ms(&self) -> u64 {
        self.drift_ms.load(Ordering::Relaxed)
    }
}

pub struct SchedulerSeed<C: Clock> {
    pub gateway: Arc<StoreGateway>,
    pub wheel: Arc<TimerWheel>,
    pub fires: mpsc::Sender<FireMsg>,
    pub events: mpsc::Sender<Event>,
    pub clock: C,
    pub tz: Tz,
}

pub fn spawn<C: Clock>(seed: SchedulerSeed<C>) -> SchedulerHandle {
    let (tx, rx) = mpsc::channel(64);
    let (timer_tx, timer_rx) = mpsc::channel(16);
    let drift_ms = Arc::new(AtomicU64::new(0));

    let scheduler = Scheduler {
        gateway: seed.gateway,
        wheel: seed.wheel,
        fires: seed.fires,
        events: seed.events,
        clock: seed.clock,
        tz: seed.tz,
        rx,
        timer_tx,
        timer_rx,
        schedules: HashMap::new(),
        queue: BinaryHeap::new(),
        queue_seq: 0,
        armed: None,
        drift_ms: Arc::clone(&drift_ms),
    };
    tokio::spawn(scheduler.run());

    SchedulerHandle { tx, drift_ms }
}

/// Queue entry; invalidated lazily against the schedule map.
#[derive(PartialEq, Eq)]
struct QueueEntry {
    next_ms: u64,
    seq: u64,
    id: ScheduleId,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.next_ms.cmp(&other.next_ms).then(self.seq.cmp(&other.seq))
    }
}

struct Scheduler<C: Clock> {
    gateway: Arc<StoreGateway>,
    wheel: Arc<TimerWheel>,
    fires: mpsc::Sender<FireMsg>,
    events: mpsc::Sender<Event>,
    clock: C,
    tz: Tz,

    rx: mpsc::Receiver<SchedulerCommand>,
    timer_tx: mpsc::Sender<TimerToken>,
    timer_rx: mpsc::Receiver<TimerToken>,

    schedules: HashMap<ScheduleId, Schedule>,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    queue_seq: u64,
    /// Currently armed wheel token and the deadline it covers.
    armed: Option<(TimerToken, u64)>,
    drift_ms: Arc<AtomicU64>,
}

impl<C: Clock> Scheduler<C> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                    self.rearm();
                }
                token = self.timer_rx.recv() => {
                    let Some(token) = token else { break };
                    if self.armed.map(|(armed, _)| armed) == Some(token) {
                        self.armed = None;
                        self.fire_due().await;
                        self.rearm();
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Put { mut schedule } => {
                if schedule.enabled {
                    // (Re-)enabling always computes from now; a missed
                    // one-shot instant fires immediately, once.
                    schedule.next_fire_ms =
                        schedule.next_fire_after(self.clock.epoch_ms(), &self.tz);
                } else {
                    schedule.next_fire_ms = None;
                }
                if let Some(next_ms) = schedule.next_fire_ms {
                    self.push_entry(next_ms, schedule.id);
                }
                tracing::debug!(
                    schedule = %schedule.id,
                    kind = schedule.spec.kind_str(),
                    next_ms = ?schedule.next_fire_ms,
                    "schedule registered"
                );
                self.schedules.insert(schedule.id, schedule);
            }
            SchedulerCommand::Delete { id } => {
                self.schedules.remove(&id);
            }
            SchedulerCommand::SetEnabled { id, enabled } => {
                let now_ms = self.clock.epoch_ms();
                let mut next = None;
                if let Some(schedule) = self.schedules.get_mut(&id) {
                    schedule.enabled = enabled;
                    schedule.next_fire_ms =
                        if enabled { schedule.next_fire_after(now_ms, &self.tz) } else { None };
                    next = schedule.next_fire_ms;
                }
                if let Some(next_ms) = next {
                    self.push_entry(next_ms, id);
                }
            }
            SchedulerCommand::DropWorkload { workload } => {
                self.schedules.retain(|_, s| s.workload != workload);
            }
        }
    }

    fn push_entry(&mut self, next_ms: u64, id: ScheduleId) {
        self.queue_seq += 1;
        self.queue.push(Reverse(QueueEntry { next_ms, seq: self.queue_seq, id }));
    }

    async fn fire_due(&mut self) {
        let now_ms = self.clock.epoch_ms();
        loop {
            let due = match self.queue.peek() {
                Some(Reverse(entry)) if entry.next_ms <= now_ms => {
                    let Some(Reverse(entry)) = self.queue.pop() else { break };
                    entry
                }
                _ => break,
            };
            // Stale entries: schedule gone, disabled, or rescheduled.
            let Some(schedule) = self.schedules.get_mut(&due.id) else { continue };
            if !schedule.enabled || schedule.next_fire_ms != Some(due.next_ms) {
                continue;
            }

            let drift = now_ms.saturating_sub(due.next_ms);
            self.drift_ms.fetch_max(drift, Ordering::Relaxed);

            schedule.mark_fired(now_ms, &self.tz);
            let workload = schedule.workload;
            let next = schedule.next_fire_ms;

            tracing::info!(schedule = %due.id, %workload, drift_ms = drift, "schedule fired");
            let event = Event::ScheduleFired { id: due.id, workload, at_ms: now_ms };
            self.gateway.record_runtime(&event);
            let _ = self.events.send(event).await;
            let _ = self.fires.send(FireMsg { schedule: due.id, workload }).await;

            if let Some(next_ms) = next {
                self.push_entry(next_ms, due.id);
            }
        }
    }

    /// Keep exactly one wheel token armed, for the earliest live entry.
    fn rearm(&mut self) {
        // Skim stale heads so the armed deadline is real.
        while let Some(Reverse(entry)) = self.queue.peek() {
            match self.schedules.get(&entry.id) {
                Some(s) if s.enabled && s.next_fire_ms == Some(entry.next_ms) => break,
                _ => {
                    self.queue.pop();
                }
            }
        }
        let target = self.queue.peek().map(|Reverse(e)| e.next_ms);
        match (target, self.armed) {
            (None, None) => {}
            (None, Some((token, _))) => {
                self.wheel.cancel(token);
                self.armed = None;
            }
            (Some(next_ms), Some((_, armed_ms))) if armed_ms == next_ms => {}
            (Some(next_ms), previous) => {
                if let Some((token, _)) = previous {
                    self.wheel.cancel(token);
                }
                let now_ms = self.clock.epoch_ms();
                let delay = Duration::from_millis(next_ms.saturating_sub(now_ms));
                let token = self.wheel.schedule_after(delay, self.timer_tx.clone());
                self.armed = Some((token, next_ms));
            }
        }
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
