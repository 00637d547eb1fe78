// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The coordinator: single writer to the workload registry.
//!
//! Serializes external mutations behind a write lock, routes per-workload
//! commands to the owning supervisor with a bounded reply timeout, fans
//! events out to subscribers, and arbitrates recovery after a daemon
//! restart. Reads (list, describe, health) are concurrent: supervisors
//! publish their runtime state through watches, so no read ever
//! round-trips into a supervisor loop.

mod fanout;

pub use fanout::EventFan;

use crate::scheduler::{FireMsg, SchedulerHandle};
use crate::supervisor::{self, SupervisorConfig, SupervisorHandle, SupervisorSeed};
use crate::timer::TimerWheel;
use crate::protocol::{HealthReport, WorkloadDetail, WorkloadSummary};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use warden_core::schedule::{Schedule, ScheduleId, ScheduleSpec};
use warden_core::workload::{Workload, WorkloadId, WorkloadUpdate};
use warden_core::{Clock, ControlError, DaemonConfig, Event, RestartPolicy};
use warden_storage::{LogQuery, MaterializedState, StoreGateway};

struct Entry {
    workload: Workload,
    handle: SupervisorHandle,
}

pub struct Coordinator<C: Clock> {
    registry: RwLock<HashMap<WorkloadId, Entry>>,
    gateway: Arc<StoreGateway>,
    wheel: Arc<TimerWheel>,
    scheduler: SchedulerHandle,
    fan: EventFan,
    /// Sender handed to supervisors and the scheduler; the coordinator's
    /// event loop drains the matching receiver into the fan.
    events_tx: mpsc::Sender<Event>,
    clock: C,
    config: DaemonConfig,
    started: Instant,
}

impl<C: Clock> Coordinator<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<StoreGateway>,
        wheel: Arc<TimerWheel>,
        scheduler: SchedulerHandle,
        events_tx: mpsc::Sender<Event>,
        clock: C,
        config: DaemonConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            gateway,
            wheel,
            scheduler,
            fan: EventFan::new(),
            events_tx,
            clock,
            config,
            started: Instant::now(),
        })
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            default_stop_grace: self.config.default_stop_grace(),
            sample_interval: self.config.metric_sample_interval(),
            max_line_len: crate::runner::DEFAULT_MAX_LINE_LEN,
        }
    }

    fn command_timeout(&self) -> Duration {
        self.config.command_timeout()
    }

    /// Resolve an id, falling back to exact name, then unique id prefix.
    fn resolve(&self, key: &str) -> Result<WorkloadId, ControlError> {
        let registry = self.registry.read();
        if let Some((id, _)) = registry.get_key_value(key) {
            return Ok(*id);
        }
        if let Some(entry) = registry.values().find(|e| e.workload.name == key) {
            return Ok(entry.workload.id);
        }
        let mut matches = registry.keys().filter(|id| id.as_str().starts_with(key));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(*id),
            _ => Err(ControlError::not_found(format!("workload {key:?}"))),
        }
    }

    fn handle_for(&self, id: WorkloadId) -> Result<SupervisorHandle, ControlError> {
        self.registry
            .read()
            .get(&id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| ControlError::not_found(format!("workload {id}")))
    }

    fn resolve_policy(&self, name: Option<&str>) -> Result<RestartPolicy, ControlError> {
        match name {
            None => Ok(RestartPolicy::none()),
            Some("none") => Ok(RestartPolicy::none()),
            Some(name) => {
                self.gateway.load_policy(name).ok_or_else(|| ControlError::unknown_policy(name))
            }
        }
    }

    fn spawn_supervisor(&self, workload: Workload, policy: RestartPolicy) -> SupervisorHandle {
        supervisor::spawn(SupervisorSeed {
            workload,
            policy,
            gateway: Arc::clone(&self.gateway),
            wheel: Arc::clone(&self.wheel),
            events: self.events_tx.clone(),
            clock: self.clock.clone(),
            config: self.supervisor_config(),
        })
    }

    /// Fan a declared-state event out after it was durably recorded.
    async fn announce(&self, event: Event) {
        let _ = self.events_tx.send(event).await;
    }

    // --- control operations ---

    #[allow(clippy::too_many_arguments)]
    pub async fn create_workload(
        &self,
        name: String,
        argv: Vec<String>,
        cwd: Option<std::path::PathBuf>,
        env: std::collections::BTreeMap<String, String>,
        group: Option<String>,
        policy: Option<String>,
        schedules: Vec<ScheduleSpec>,
    ) -> Result<WorkloadId, ControlError> {
        let now_ms = self.clock.epoch_ms();
        let workload = Workload {
            id: WorkloadId::generate(),
            name,
            argv,
            cwd,
            env,
            group,
            policy,
            schedules: Vec::new(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };
        workload.validate()?;
        let resolved_policy = self.resolve_policy(workload.policy.as_deref())?;

        let mut schedule_records = Vec::new();
        for spec in schedules {
            let schedule = Schedule::new(workload.id, spec, true);
            schedule.validate(now_ms)?;
            schedule_records.push(schedule);
        }

        // Single-writer section: conflict check and insert are atomic.
        let (id, events) = {
            let mut registry = self.registry.write();
            if registry.values().any(|e| e.workload.name == workload.name) {
                return Err(ControlError::name_conflict(&workload.name));
            }

            let mut workload = workload;
            workload.schedules = schedule_records.iter().map(|s| s.id).collect();

            let mut events = vec![Event::WorkloadCreated { workload: workload.clone() }];
            events.extend(
                schedule_records.iter().map(|s| Event::SchedulePut { schedule: s.clone() }),
            );
            self.gateway.record(&events)?;

            let handle = self.spawn_supervisor(workload.clone(), resolved_policy);
            let id = workload.id;
            registry.insert(id, Entry { workload, handle });
            (id, events)
        };

        for event in events {
            self.announce(event).await;
        }
        for schedule in schedule_records {
            self.scheduler.put(schedule).await?;
        }
        tracing::info!(workload = %id, "workload created");
        Ok(id)
    }

    pub async fn update_workload(
        &self,
        key: &str,
        fields: WorkloadUpdate,
    ) -> Result<(), ControlError> {
        if fields.is_empty() {
            return Err(ControlError::invalid_field("no fields to update"));
        }
        let id = self.resolve(key)?;
        let resolved_policy = match fields.policy.as_deref() {
            Some(name) => Some(self.resolve_policy(Some(name))?),
            None => None,
        };

        let (event, handle, updated) = {
            let mut registry = self.registry.write();
            if let Some(ref new_name) = fields.name {
                let conflict = registry
                    .values()
                    .any(|e| e.workload.id != id && e.workload.name == *new_name);
                if conflict {
                    return Err(ControlError::name_conflict(new_name));
                }
            }
            let entry = registry
                .get_mut(&id)
                .ok_or_else(|| ControlError::not_found(format!("workload {id}")))?;

            let mut updated = entry.workload.clone();
            fields.apply(&mut updated, self.clock.epoch_ms());
            updated.validate()?;

            let event = Event::WorkloadUpdated { workload: updated.clone() };
            self.gateway.record(std::slice::from_ref(&event))?;
            entry.workload = updated.clone();
            let handle = entry.handle.clone();
            (event, handle, updated)
        };

        self.announce(event).await;
        handle.update_workload(updated).await?;
        if let Some(policy) = resolved_policy {
            handle.update_policy(policy).await?;
        }
        Ok(())
    }

    pub async fn delete_workload(&self, key: &str, force: bool) -> Result<(), ControlError> {
        let id = self.resolve(key)?;
        let handle = self.handle_for(id)?;

        // The supervisor makes the authoritative Busy call; the timeout
        // covers a forced stop of a live process group.
        let timeout = self.command_timeout() + self.config.default_stop_grace();
        handle.delete(force, timeout).await?;

        self.scheduler.drop_workload(id).await?;
        self.gateway.delete_workload(id.as_str())?;
        self.registry.write().remove(&id);
        self.announce(Event::WorkloadDeleted { id }).await;
        tracing::info!(workload = %id, "workload deleted");
        Ok(())
    }

    pub async fn start(&self, key: &str) -> Result<(), ControlError> {
        let id = self.resolve(key)?;
        self.handle_for(id)?.start(self.command_timeout()).await
    }

    pub async fn stop(
        &self,
        key: &str,
        grace: Option<Duration>,
        force: bool,
    ) -> Result<(), ControlError> {
        let id = self.resolve(key)?;
        // Commands that legitimately take longer extend the timeout by
        // the grace period.
        let grace_for_timeout = grace.unwrap_or_else(|| self.config.default_stop_grace());
        let timeout = self.command_timeout() + grace_for_timeout;
        self.handle_for(id)?.stop(grace, force, timeout).await
    }

    pub async fn restart(&self, key: &str, delay: Option<Duration>) -> Result<(), ControlError> {
        let id = self.resolve(key)?;
        self.handle_for(id)?.restart(delay, self.command_timeout()).await
    }

    pub fn list_workloads(&self, filter: Option<&str>) -> Vec<WorkloadSummary> {
        let registry = self.registry.read();
        let mut items: Vec<WorkloadSummary> = registry
            .values()
            .filter(|entry| match filter {
                Some(needle) => {
                    entry.workload.name.contains(needle)
                        || entry.workload.group.as_deref().is_some_and(|g| g.contains(needle))
                }
                None => true,
            })
            .map(|entry| {
                let status = entry.handle.status();
                WorkloadSummary {
                    id: entry.workload.id.as_str().to_string(),
                    name: entry.workload.name.clone(),
                    phase: status.phase,
                    pid: status.pid,
                    started_at_ms: status.started_at_ms,
                    consecutive_failures: status.consecutive_failures,
                }
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }

    pub fn describe(&self, key: &str) -> Result<WorkloadDetail, ControlError> {
        let id = self.resolve(key)?;
        let registry = self.registry.read();
        let entry = registry
            .get(&id)
            .ok_or_else(|| ControlError::not_found(format!("workload {id}")))?;
        Ok(WorkloadDetail {
            workload: entry.workload.clone(),
            runtime: entry.handle.status(),
            schedules: self.gateway.schedules_for(id.as_str()),
        })
    }

    pub async fn put_policy(&self, policy: RestartPolicy) -> Result<(), ControlError> {
        policy.validate()?;
        self.gateway.put_policy(&policy)?;
        self.announce(Event::PolicyPut { policy: policy.clone() }).await;

        // Propagate to supervisors already referencing this policy.
        let handles: Vec<SupervisorHandle> = self
            .registry
            .read()
            .values()
            .filter(|e| e.workload.policy.as_deref() == Some(policy.name.as_str()))
            .map(|e| e.handle.clone())
            .collect();
        for handle in handles {
            handle.update_policy(policy.clone()).await?;
        }
        Ok(())
    }

    pub async fn put_schedule(
        &self,
        workload_key: &str,
        spec: ScheduleSpec,
        enabled: bool,
    ) -> Result<ScheduleId, ControlError> {
        let id = self.resolve(workload_key)?;
        let now_ms = self.clock.epoch_ms();
        let schedule = Schedule::new(id, spec, enabled);
        schedule.validate(now_ms)?;

        let (events, handle, updated) = {
            let mut registry = self.registry.write();
            let entry = registry
                .get_mut(&id)
                .ok_or_else(|| ControlError::not_found(format!("workload {id}")))?;
            let mut updated = entry.workload.clone();
            updated.schedules.push(schedule.id);
            updated.updated_at_ms = now_ms;

            let events = vec![
                Event::SchedulePut { schedule: schedule.clone() },
                Event::WorkloadUpdated { workload: updated.clone() },
            ];
            self.gateway.record(&events)?;
            entry.workload = updated.clone();
            let handle = entry.handle.clone();
            (events, handle, updated)
        };

        for event in events {
            self.announce(event).await;
        }
        handle.update_workload(updated).await?;
        self.scheduler.put(schedule.clone()).await?;
        tracing::info!(schedule = %schedule.id, workload = %id, "schedule added");
        Ok(schedule.id)
    }

    pub async fn set_schedule_enabled(
        &self,
        schedule_id: &str,
        enabled: bool,
    ) -> Result<(), ControlError> {
        let schedule = self
            .gateway
            .load_schedule(schedule_id)
            .ok_or_else(|| ControlError::not_found(format!("schedule {schedule_id:?}")))?;
        let event = Event::ScheduleEnabled { id: schedule.id, enabled };
        self.gateway.record(std::slice::from_ref(&event))?;
        self.announce(event).await;
        self.scheduler.set_enabled(schedule.id, enabled).await
    }

    pub fn query_logs(
        &self,
        key: &str,
        query: &LogQuery,
    ) -> Result<Vec<warden_core::LogRecord>, ControlError> {
        let id = self.resolve(key)?;
        self.gateway.query_logs(id.as_str(), query)
    }

    pub fn query_metrics(
        &self,
        key: &str,
        since_ms: Option<u64>,
        until_ms: Option<u64>,
    ) -> Result<Vec<warden_core::MetricSample>, ControlError> {
        let id = self.resolve(key)?;
        self.gateway.query_metrics(id.as_str(), since_ms, until_ms)
    }

    pub fn subscribe(
        &self,
        workload_key: Option<&str>,
    ) -> Result<(u64, mpsc::Receiver<Event>), ControlError> {
        let filter = match workload_key {
            Some(key) => Some(self.resolve(key)?),
            None => None,
        };
        Ok(self.fan.subscribe(filter))
    }

    pub fn unsubscribe(&self, id: u64) {
        self.fan.unsubscribe(id);
    }

    pub fn health(&self) -> HealthReport {
        let mut phase_counts: BTreeMap<String, usize> = BTreeMap::new();
        for entry in self.registry.read().values() {
            *phase_counts.entry(entry.handle.status().phase.to_string()).or_default() += 1;
        }
        let store = self.gateway.health();
        HealthReport {
            phase_counts,
            persistence_lag: store.persistence_lag,
            scheduler_drift_ms: self.scheduler.drift_ms(),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            version: crate::env::PROTOCOL_VERSION.to_string(),
        }
    }

    // --- recovery & shutdown ---

    /// Rebuild the registry from recovered state. Every supervisor
    /// starts in `Idle`; pids recorded as running belong to a prior
    /// daemon generation and are declared lost, never re-adopted. The
    /// policy then decides whether a fresh start follows.
    pub async fn recover(&self, state: MaterializedState) {
        let workload_count = state.workloads.len();
        for workload in state.workloads.values() {
            let policy = self
                .resolve_policy(workload.policy.as_deref())
                .unwrap_or_else(|_| RestartPolicy::none());
            let handle = self.spawn_supervisor(workload.clone(), policy.clone());
            self.registry
                .write()
                .insert(workload.id, Entry { workload: workload.clone(), handle: handle.clone() });

            if let Some(pid) = state.running.get(workload.id.as_str()) {
                let event = Event::LostOnRecovery { workload: workload.id, pid: *pid };
                self.gateway.record_runtime(&event);
                self.announce(event).await;
                tracing::warn!(workload = %workload.id, pid, "process lost across daemon restart");

                if policy.restart_on_lost {
                    if let Err(e) = handle.start(self.command_timeout()).await {
                        tracing::warn!(workload = %workload.id, error = %e, "restart after loss failed");
                    }
                }
            }
        }

        let schedules = state.schedules.values().cloned().collect::<Vec<_>>();
        let schedule_count = schedules.len();
        for schedule in schedules {
            if let Err(e) = self.scheduler.put(schedule).await {
                tracing::warn!(error = %e, "schedule re-registration failed");
            }
        }
        tracing::info!(workloads = workload_count, schedules = schedule_count, "recovery complete");
    }

    /// Stop every active workload on daemon shutdown.
    pub async fn shutdown_workloads(&self, kill: bool) {
        let handles: Vec<(WorkloadId, SupervisorHandle)> = self
            .registry
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.handle.clone()))
            .collect();
        for (id, handle) in handles {
            if !handle.status().phase.is_active() {
                continue;
            }
            let timeout = self.command_timeout() + self.config.default_stop_grace();
            if let Err(e) = handle.stop(None, kill, timeout).await {
                tracing::warn!(workload = %id, error = %e, "shutdown stop failed");
            }
        }
    }

    /// Drain supervisor/scheduler events into the fan and route
    /// schedule fires; also drives periodic checkpoints and retention.
    pub async fn run_events(
        self: Arc<Self>,
        mut events_rx: mpsc::Receiver<Event>,
        mut fires_rx: mpsc::Receiver<FireMsg>,
        shutdown: CancellationToken,
    ) {
        let mut maintenance = tokio::time::interval(crate::env::checkpoint_interval());
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        maintenance.tick().await; // immediate first tick is a no-op

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.fan.publish(&event);
                }
                fire = fires_rx.recv() => {
                    let Some(fire) = fire else { break };
                    match self.handle_for(fire.workload) {
                        // Routed in its own task so a busy supervisor
                        // inbox can never stall event fan-out.
                        Ok(handle) => {
                            tokio::spawn(async move {
                                if let Err(e) = handle.fire(fire.schedule).await {
                                    tracing::warn!(schedule = %fire.schedule, error = %e, "fire routing failed");
                                }
                            });
                        }
                        Err(_) => {
                            tracing::debug!(schedule = %fire.schedule, "fire for unknown workload dropped");
                        }
                    }
                }
                _ = maintenance.tick() => {
                    if let Err(e) = self.gateway.checkpoint() {
                        tracing::warn!(error = %e, "checkpoint failed");
                    }
                    self.gateway.run_retention(self.clock.epoch_ms());
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
