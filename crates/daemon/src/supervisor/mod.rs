// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-workload supervisor: one state machine, one message loop.
//!
//! The supervisor exclusively owns its workload's `RuntimeState` and the
//! current runner. Commands, runner events, and timer tokens arrive on
//! channels and are processed strictly one at a time, so every observed
//! state sequence is a valid path of the machine:
//!
//! ```text
//!   Idle  --start-->            Starting
//!   Starting --started-->       Running
//!   Starting --exited-->        Evaluating
//!   Running --exited-->         Evaluating
//!   Running --stop-->           Stopping
//!   Stopping --exited-->        Stopped
//!   Evaluating --retry-->       BackingOff
//!   Evaluating --done-->        Stopped | Failed
//!   BackingOff --timer-->       Starting
//!   BackingOff --stop-->        Stopped
//!   Stopped | Failed --start--> Starting
//!   any --delete-->             Terminated
//! ```

use crate::runner::{Runner, RunnerConfig, RunnerEvent, DEFAULT_MAX_LINE_LEN};
use crate::timer::{TimerToken, TimerWheel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use warden_core::policy::{decide, RestartDecision};
use warden_core::schedule::ScheduleId;
use warden_core::workload::{Phase, RuntimeState, Workload};
use warden_core::{Clock, ControlError, Event, ExitStatus, LogRecord, RestartPolicy};
use warden_storage::StoreGateway;

type Reply = oneshot::Sender<Result<(), ControlError>>;

/// Commands routed from the coordinator.
pub enum SupervisorCommand {
    Start { reply: Reply },
    Stop { grace: Option<Duration>, force: bool, reply: Reply },
    Restart { delay: Option<Duration>, reply: Reply },
    Delete { force: bool, reply: Reply },
    /// A schedule fired for this workload.
    Fire { schedule: ScheduleId },
    /// Declared fields changed (takes effect on the next spawn).
    UpdateWorkload { workload: Box<Workload> },
    /// The referenced policy changed.
    UpdatePolicy { policy: Box<RestartPolicy> },
}

enum Msg {
    Command(SupervisorCommand),
    Runner(RunnerEvent),
    Timer(TimerToken),
}

/// Tunables passed down from the daemon configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub default_stop_grace: Duration,
    pub sample_interval: Duration,
    pub max_line_len: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            default_stop_grace: Duration::from_secs(10),
            sample_interval: Duration::from_secs(5),
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Handle held by the coordinator. The supervisor publishes its
/// `RuntimeState` through a watch, so reads never round-trip.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Msg>,
    status: watch::Receiver<RuntimeState>,
}

impl SupervisorHandle {
    pub fn status(&self) -> RuntimeState {
        self.status.borrow().clone()
    }

    async fn send(&self, command: SupervisorCommand) -> Result<(), ControlError> {
        self.tx
            .send(Msg::Command(command))
            .await
            .map_err(|_| ControlError::internal("supervisor terminated"))
    }

    async fn roundtrip(
        &self,
        command: SupervisorCommand,
        rx: oneshot::Receiver<Result<(), ControlError>>,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        self.send(command).await?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ControlError::timeout("command")),
            Ok(Err(_)) => Err(ControlError::internal("supervisor dropped the reply")),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn start(&self, timeout: Duration) -> Result<(), ControlError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(SupervisorCommand::Start { reply: tx }, rx, timeout).await
    }

    pub async fn stop(
        &self,
        grace: Option<Duration>,
        force: bool,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(SupervisorCommand::Stop { grace, force, reply: tx }, rx, timeout).await
    }

    pub async fn restart(
        &self,
        delay: Option<Duration>,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(SupervisorCommand::Restart { delay, reply: tx }, rx, timeout).await
    }

    pub async fn delete(&self, force: bool, timeout: Duration) -> Result<(), ControlError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(SupervisorCommand::Delete { force, reply: tx }, rx, timeout).await
    }

    pub async fn fire(&self, schedule: ScheduleId) -> Result<(), ControlError> {
        self.send(SupervisorCommand::Fire { schedule }).await
    }

    pub async fn update_workload(&self, workload: Workload) -> Result<(), ControlError> {
        self.send(SupervisorCommand::UpdateWorkload { workload: Box::new(workload) }).await
    }

    pub async fn update_policy(&self, policy: RestartPolicy) -> Result<(), ControlError> {
        self.send(SupervisorCommand::UpdatePolicy { policy: Box::new(policy) }).await
    }
}

/// Everything a supervisor needs at spawn time.
pub struct SupervisorSeed<C: Clock> {
    pub workload: Workload,
    pub policy: RestartPolicy,
    pub gateway: Arc<StoreGateway>,
    pub wheel: Arc<TimerWheel>,
    pub events: mpsc::Sender<Event>,
    pub clock: C,
    pub config: SupervisorConfig,
}

/// Spawn the supervisor task in `Idle` and return its handle.
pub fn spawn<C: Clock>(seed: SupervisorSeed<C>) -> SupervisorHandle {
    let (tx, rx) = mpsc::channel(64);
    let (runner_tx, runner_rx) = mpsc::channel(8);
    let (timer_tx, timer_rx) = mpsc::channel(16);
    let (status_tx, status_rx) = watch::channel(RuntimeState::default());

    let supervisor = Supervisor {
        workload: seed.workload,
        policy: seed.policy,
        state: RuntimeState::default(),
        runner: None,
        gateway: seed.gateway,
        wheel: seed.wheel,
        events: seed.events,
        clock: seed.clock,
        config: seed.config,
        rx,
        runner_tx,
        runner_rx,
        timer_tx,
        timer_rx,
        status_tx,
        backoff_token: None,
        pending_start_token: None,
        restart_after_stop: None,
        stop_replies: Vec::new(),
        delete_reply: None,
    };
    tokio::spawn(supervisor.run());

    SupervisorHandle { tx, status: status_rx }
}

struct Supervisor<C: Clock> {
    workload: Workload,
    policy: RestartPolicy,
    state: RuntimeState,
    runner: Option<Runner>,

    gateway: Arc<StoreGateway>,
    wheel: Arc<TimerWheel>,
    events: mpsc::Sender<Event>,
    clock: C,
    config: SupervisorConfig,

    rx: mpsc::Receiver<Msg>,
    runner_tx: mpsc::Sender<RunnerEvent>,
    runner_rx: mpsc::Receiver<RunnerEvent>,
    timer_tx: mpsc::Sender<TimerToken>,
    timer_rx: mpsc::Receiver<TimerToken>,
    status_tx: watch::Sender<RuntimeState>,

    backoff_token: Option<TimerToken>,
    /// Timer for the delayed second half of a restart.
    pending_start_token: Option<TimerToken>,
    /// Set while a restart's stop half is in flight; carries the delay.
    restart_after_stop: Option<Option<Duration>>,
    stop_replies: Vec<Reply>,
    delete_reply: Option<Reply>,
}

impl<C: Clock> Supervisor<C> {
    async fn run(mut self) {
        tracing::debug!(workload = %self.workload.id, name = %self.workload.name, "supervisor up");
        loop {
            let msg = tokio::select! {
                // Bias keeps command/event interleaving deterministic
                // under load; each arm is still strictly serialized.
                biased;
                event = self.runner_rx.recv() => match event {
                    Some(event) => Msg::Runner(event),
                    None => continue,
                },
                token = self.timer_rx.recv() => match token {
                    Some(token) => Msg::Timer(token),
                    None => continue,
                },
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let terminated = match msg {
                Msg::Command(command) => self.handle_command(command).await,
                Msg::Runner(event) => {
                    self.handle_runner_event(event).await;
                    false
                }
                Msg::Timer(token) => {
                    self.handle_timer(token).await;
                    false
                }
            };
            if terminated {
                break;
            }
        }
        tracing::debug!(workload = %self.workload.id, "supervisor down");
    }

    /// Returns true when the supervisor reached `Terminated`.
    async fn handle_command(&mut self, command: SupervisorCommand) -> bool {
        match command {
            SupervisorCommand::Start { reply } => {
                let result = self.handle_start().await;
                let _ = reply.send(result);
            }
            SupervisorCommand::Stop { grace, force, reply } => {
                self.handle_stop(grace, force, reply);
            }
            SupervisorCommand::Restart { delay, reply } => {
                let result = self.handle_restart(delay).await;
                let _ = reply.send(result);
            }
            SupervisorCommand::Delete { force, reply } => {
                return self.handle_delete(force, reply).await;
            }
            SupervisorCommand::Fire { schedule } => {
                self.handle_fire(schedule).await;
            }
            SupervisorCommand::UpdateWorkload { workload } => {
                self.workload = *workload;
            }
            SupervisorCommand::UpdatePolicy { policy } => {
                self.policy = *policy;
            }
        }
        false
    }

    async fn handle_start(&mut self) -> Result<(), ControlError> {
        match self.state.phase {
            Phase::Idle | Phase::Stopped | Phase::Failed => {
                self.cancel_pending_start();
                self.begin_start().await;
                Ok(())
            }
            Phase::Starting | Phase::Running | Phase::BackingOff => {
                Err(ControlError::already_active(self.state.phase))
            }
            Phase::Stopping | Phase::Evaluating => {
                Err(ControlError::transient_state(self.state.phase))
            }
            Phase::Terminated => Err(ControlError::not_found("workload")),
        }
    }

    fn handle_stop(&mut self, grace: Option<Duration>, force: bool, reply: Reply) {
        match self.state.phase {
            Phase::Idle | Phase::Stopped | Phase::Failed => {
                // Stop is idempotent, but a pending delayed restart is
                // cancelled so the workload actually stays down.
                if self.cancel_pending_start() {
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(ControlError::already_stopped(self.state.phase)));
                }
            }
            Phase::BackingOff => {
                self.cancel_backoff();
                self.set_phase_sync(Phase::Stopped);
                let _ = reply.send(Ok(()));
            }
            Phase::Starting | Phase::Running => {
                self.stop_replies.push(reply);
                self.initiate_stop(grace, force);
            }
            Phase::Stopping => {
                // Absorbed into the stop already in flight.
                self.stop_replies.push(reply);
            }
            Phase::Evaluating | Phase::Terminated => {
                let _ = reply.send(Err(ControlError::transient_state(self.state.phase)));
            }
        }
    }

    async fn handle_restart(&mut self, delay: Option<Duration>) -> Result<(), ControlError> {
        match self.state.phase {
            Phase::Starting | Phase::Running => {
                self.restart_after_stop = Some(delay);
                self.initiate_stop(None, false);
                Ok(())
            }
            Phase::Stopping => {
                self.restart_after_stop = Some(delay);
                Ok(())
            }
            Phase::BackingOff => {
                self.cancel_backoff();
                self.set_phase(Phase::Stopped).await;
                self.start_or_delay(delay).await;
                Ok(())
            }
            Phase::Idle | Phase::Stopped | Phase::Failed => {
                self.cancel_pending_start();
                self.start_or_delay(delay).await;
                Ok(())
            }
            Phase::Evaluating => Err(ControlError::transient_state(self.state.phase)),
            Phase::Terminated => Err(ControlError::not_found("workload")),
        }
    }

    async fn handle_delete(&mut self, force: bool, reply: Reply) -> bool {
        match self.state.phase {
            Phase::Starting | Phase::Running | Phase::Stopping => {
                if !force {
                    let _ = reply.send(Err(ControlError::busy(
                        "workload is running",
                    )
                    .with_hint("pass force to stop and delete")));
                    return false;
                }
                self.restart_after_stop = None;
                self.delete_reply = Some(reply);
                if self.state.phase != Phase::Stopping {
                    // Forced delete does not wait out a grace period.
                    self.initiate_stop(None, true);
                }
                false
            }
            Phase::BackingOff => {
                self.cancel_backoff();
                self.finish_delete(reply).await;
                true
            }
            Phase::Idle | Phase::Stopped | Phase::Failed | Phase::Evaluating => {
                self.cancel_pending_start();
                self.finish_delete(reply).await;
                true
            }
            Phase::Terminated => {
                let _ = reply.send(Ok(()));
                true
            }
        }
    }

    async fn handle_fire(&mut self, schedule: ScheduleId) {
        match self.state.phase {
            Phase::Idle | Phase::Stopped => {
                tracing::info!(workload = %self.workload.id, %schedule, "schedule fire: starting");
                self.begin_start().await;
            }
            // Fires never queue; an active workload (or one parked in
            // Failed awaiting manual reset) drops the fire.
            phase => {
                self.emit(Event::SkippedConcurrent {
                    id: schedule,
                    workload: self.workload.id,
                    phase,
                })
                .await;
            }
        }
    }

    async fn handle_runner_event(&mut self, event: RunnerEvent) {
        match event {
            RunnerEvent::Started { pid, at_ms } => {
                self.state.pid = Some(pid);
                self.state.started_at_ms = Some(at_ms);
                self.emit(Event::RunStarted { workload: self.workload.id, pid, at_ms }).await;
                if self.state.phase == Phase::Starting {
                    self.set_phase(Phase::Running).await;
                } else {
                    // A stop raced the spawn; stay in Stopping, the
                    // in-flight stop will bring the exit.
                    self.publish_status();
                }
            }
            RunnerEvent::Exited { exit, at_ms } => {
                self.runner = None;
                self.state.pid = None;
                self.state.last_exit = Some(exit);
                self.emit(Event::RunExited { workload: self.workload.id, exit, at_ms }).await;

                match self.state.phase {
                    Phase::Stopping => {
                        // User-initiated: no retries, counter resets.
                        self.state.consecutive_failures = 0;
                        self.resolve_stop_replies();
                        if let Some(reply) = self.delete_reply.take() {
                            self.finish_delete(reply).await;
                            return;
                        }
                        self.set_phase(Phase::Stopped).await;
                        if let Some(delay) = self.restart_after_stop.take() {
                            self.start_or_delay(delay).await;
                        }
                    }
                    Phase::Starting | Phase::Running => {
                        self.set_phase(Phase::Evaluating).await;
                        self.evaluate_exit(exit).await;
                    }
                    phase => {
                        tracing::error!(
                            workload = %self.workload.id,
                            %phase,
                            "runner exited in unexpected phase"
                        );
                        self.publish_status();
                    }
                }
            }
        }
    }

    async fn handle_timer(&mut self, token: TimerToken) {
        if self.backoff_token == Some(token) {
            self.backoff_token = None;
            self.state.next_retry_at_ms = None;
            if self.state.phase == Phase::BackingOff {
                self.begin_start().await;
            }
        } else if self.pending_start_token == Some(token) {
            self.pending_start_token = None;
            if self.state.phase.is_startable() {
                self.begin_start().await;
            }
        }
        // Anything else is a stale token from a cancelled transition.
    }

    /// Spawn a fresh runner. On spawn failure, route through Evaluating
    /// with the synthetic exit so retries behave identically pre- and
    /// post-spawn.
    async fn begin_start(&mut self) {
        self.set_phase(Phase::Starting).await;
        self.state.next_retry_at_ms = None;

        let config = RunnerConfig {
            workload: self.workload.id,
            argv: self.workload.argv.clone(),
            cwd: self.workload.cwd.clone(),
            env: self.workload.env.clone(),
            max_line_len: self.config.max_line_len,
            sample_interval: self.config.sample_interval,
        };
        match Runner::spawn(
            config,
            self.clock.clone(),
            Arc::clone(&self.gateway),
            self.runner_tx.clone(),
        )
        .await
        {
            Ok(runner) => {
                self.runner = Some(runner);
            }
            Err(e) => {
                tracing::warn!(workload = %self.workload.id, error = %e, "spawn failed");
                self.gateway.append_log(LogRecord::system(
                    self.workload.id,
                    self.clock.epoch_ms(),
                    e.to_string(),
                ));
                let at_ms = self.clock.epoch_ms();
                self.state.last_exit = Some(ExitStatus::SpawnFailed);
                self.emit(Event::RunExited {
                    workload: self.workload.id,
                    exit: ExitStatus::SpawnFailed,
                    at_ms,
                })
                .await;
                self.set_phase(Phase::Evaluating).await;
                self.evaluate_exit(ExitStatus::SpawnFailed).await;
            }
        }
    }

    async fn evaluate_exit(&mut self, exit: ExitStatus) {
        if exit.is_success() {
            self.state.consecutive_failures = 0;
        }
        match decide(&self.policy, exit, self.state.consecutive_failures) {
            RestartDecision::Stop => {
                self.set_phase(Phase::Stopped).await;
            }
            RestartDecision::GiveUp => {
                tracing::warn!(
                    workload = %self.workload.id,
                    failures = self.state.consecutive_failures,
                    "retries exhausted"
                );
                self.set_phase(Phase::Failed).await;
            }
            RestartDecision::Retry { delay } => {
                if !exit.is_success() {
                    self.state.consecutive_failures += 1;
                }
                self.state.next_retry_at_ms =
                    Some(self.clock.epoch_ms() + delay.as_millis() as u64);
                self.backoff_token =
                    Some(self.wheel.schedule_after(delay, self.timer_tx.clone()));
                tracing::info!(
                    workload = %self.workload.id,
                    failures = self.state.consecutive_failures,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                self.set_phase(Phase::BackingOff).await;
            }
        }
    }

    fn initiate_stop(&mut self, grace: Option<Duration>, force: bool) {
        self.cancel_backoff();
        let phase_was = self.state.phase;
        let Some(runner) = self.runner.clone() else {
            tracing::error!(workload = %self.workload.id, %phase_was, "stop without a runner");
            return;
        };
        self.set_phase_sync(Phase::Stopping);
        let grace = if force { Duration::ZERO } else { grace.unwrap_or(self.config.default_stop_grace) };
        tokio::spawn(async move {
            runner.stop(grace).await;
        });
    }

    async fn start_or_delay(&mut self, delay: Option<Duration>) {
        match delay {
            None => self.begin_start().await,
            Some(delay) => {
                self.pending_start_token =
                    Some(self.wheel.schedule_after(delay, self.timer_tx.clone()));
            }
        }
    }

    async fn finish_delete(&mut self, reply: Reply) {
        if let Some(runner) = self.runner.take() {
            // Force path: the stop is already in flight; make sure the
            // group dies even if the grace is long.
            runner.kill();
        }
        self.set_phase(Phase::Terminated).await;
        let _ = reply.send(Ok(()));
    }

    fn cancel_backoff(&mut self) {
        if let Some(token) = self.backoff_token.take() {
            self.wheel.cancel(token);
        }
        self.state.next_retry_at_ms = None;
    }

    fn cancel_pending_start(&mut self) -> bool {
        match self.pending_start_token.take() {
            Some(token) => {
                self.wheel.cancel(token);
                true
            }
            None => false,
        }
    }

    fn resolve_stop_replies(&mut self) {
        for reply in self.stop_replies.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }

    /// Apply a transition and return the phase event to emit, or `None`
    /// for a self-transition.
    fn apply_phase(&mut self, to: Phase) -> Option<Event> {
        let from = self.state.phase;
        if from == to {
            return None;
        }
        self.state.phase = to;
        tracing::info!(workload = %self.workload.id, %from, %to, "phase change");
        let event = Event::PhaseChanged {
            workload: self.workload.id,
            from,
            to,
            at_ms: self.clock.epoch_ms(),
        };
        self.gateway.record_runtime(&event);
        self.publish_status();
        Some(event)
    }

    async fn set_phase(&mut self, to: Phase) {
        if let Some(event) = self.apply_phase(to) {
            let _ = self.events.send(event).await;
        }
    }

    /// Transition from a reply path that cannot await; delivery into
    /// the bounded event channel falls back to try_send.
    fn set_phase_sync(&mut self, to: Phase) {
        if let Some(event) = self.apply_phase(to) {
            if let Err(e) = self.events.try_send(event) {
                tracing::warn!(workload = %self.workload.id, error = %e, "phase event dropped");
            }
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.state.clone());
    }

    async fn emit(&self, event: Event) {
        self.gateway.record_runtime(&event);
        if self.events.send(event).await.is_err() {
            tracing::debug!(workload = %self.workload.id, "event channel closed");
        }
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
