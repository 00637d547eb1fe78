// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The process runner: one OS process per instance.
//!
//! Spawns the workload's argv in a fresh process group, drains stdout
//! and stderr into the log pipeline (one drainer task per stream),
//! samples resource usage while alive, and guarantees exactly one
//! `Started` and one `Exited` event per spawn. `wait` is called exactly
//! once, by the watcher task that owns the child — no zombies even if
//! the supervisor is gone.

pub mod output;

use output::LineReader;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use warden_core::workload::WorkloadId;
use warden_core::{Clock, ExitStatus, LogRecord, LogStream, MetricSample};
use warden_storage::StoreGateway;

pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn {argv0}: {source}")]
    Spawn {
        argv0: String,
        #[source]
        source: std::io::Error,
    },
}

/// Events a runner reports to its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerEvent {
    Started { pid: i32, at_ms: u64 },
    Exited { exit: ExitStatus, at_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub workload: WorkloadId,
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Per-key overlay on the daemon's environment.
    pub env: BTreeMap<String, String>,
    pub max_line_len: usize,
    pub sample_interval: Duration,
}

/// Handle to a live process. Cheap to clone; the child itself is owned
/// by the watcher task.
#[derive(Clone)]
pub struct Runner {
    pid: i32,
    exited: watch::Receiver<bool>,
    sampler_stop: CancellationToken,
}

impl Runner {
    /// Spawn the process and its drainer/watcher/sampler tasks.
    ///
    /// Emits `Started` immediately and exactly one `Exited` when the
    /// process is reaped.
    pub async fn spawn<C: Clock>(
        config: RunnerConfig,
        clock: C,
        gateway: Arc<StoreGateway>,
        events: mpsc::Sender<RunnerEvent>,
    ) -> Result<Runner, SpawnError> {
        let argv0 = config.argv[0].clone();
        let mut cmd = Command::new(&argv0);
        cmd.args(&config.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        // New process group so signals reach descendants.
        cmd.process_group(0);
        if let Some(ref cwd) = config.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&config.env);

        let mut child =
            cmd.spawn().map_err(|source| SpawnError::Spawn { argv0: argv0.clone(), source })?;
        let pid = child.id().map(|p| p as i32).unwrap_or_default();

        tracing::info!(workload = %config.workload, pid, command = %argv0, "process spawned");

        if let Some(stdout) = child.stdout.take() {
            spawn_drainer(
                stdout,
                LogStream::Stdout,
                config.workload,
                config.max_line_len,
                clock.clone(),
                Arc::clone(&gateway),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_drainer(
                stderr,
                LogStream::Stderr,
                config.workload,
                config.max_line_len,
                clock.clone(),
                Arc::clone(&gateway),
            );
        }

        let sampler_stop = CancellationToken::new();
        spawn_sampler(
            config.workload,
            pid,
            config.sample_interval,
            clock.clone(),
            Arc::clone(&gateway),
            sampler_stop.clone(),
        );

        let (exited_tx, exited_rx) = watch::channel(false);
        let started_at = clock.epoch_ms();
        let _ = events.send(RunnerEvent::Started { pid, at_ms: started_at }).await;

        // Watcher task: sole owner of the child, sole caller of wait.
        let workload = config.workload;
        let watcher_stop = sampler_stop.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitStatus::from_std(status),
                Err(e) => {
                    tracing::error!(%workload, pid, error = %e, "wait failed");
                    ExitStatus::Code(-1)
                }
            };
            let at_ms = clock.epoch_ms();
            tracing::info!(%workload, pid, %exit, "process exited");
            watcher_stop.cancel();
            let _ = exited_tx.send(true);
            let _ = events.send(RunnerEvent::Exited { exit, at_ms }).await;
        });

        Ok(Runner { pid, exited: exited_rx, sampler_stop })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Deliver a signal to the whole process group.
    pub fn signal(&self, signal: nix::sys::signal::Signal) -> Result<(), nix::errno::Errno> {
        nix::sys::signal::killpg(nix::unistd::Pid::from_raw(self.pid), signal)
    }

    /// Graceful termination request (SIGTERM to the group).
    pub fn terminate(&self) {
        if let Err(e) = self.signal(nix::sys::signal::Signal::SIGTERM) {
            tracing::debug!(pid = self.pid, error = %e, "SIGTERM delivery failed");
        }
    }

    /// Unconditional kill (SIGKILL to the group).
    pub fn kill(&self) {
        self.sampler_stop.cancel();
        if let Err(e) = self.signal(nix::sys::signal::Signal::SIGKILL) {
            tracing::debug!(pid = self.pid, error = %e, "SIGKILL delivery failed");
        }
    }

    /// SIGTERM the group, wait up to `grace`, then SIGKILL. The final
    /// `Exited` event still arrives through the watcher.
    pub async fn stop(&self, grace: Duration) {
        self.terminate();
        let mut exited = self.exited.clone();
        let deadline = tokio::time::sleep(grace);
        tokio::select! {
            result = exited.wait_for(|done| *done) => {
                if result.is_err() {
                    // Watcher gone means the process already exited.
                }
            }
            _ = deadline => {
                tracing::warn!(pid = self.pid, grace_ms = grace.as_millis() as u64, "grace expired, killing");
                self.kill();
            }
        }
    }

    /// Wait for the exit event without consuming it.
    pub async fn wait_exited(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }
}

fn spawn_drainer<R, C>(
    stream: R,
    kind: LogStream,
    workload: WorkloadId,
    max_line_len: usize,
    clock: C,
    gateway: Arc<StoreGateway>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    C: Clock,
{
    tokio::spawn(async move {
        let mut reader = LineReader::new(stream, max_line_len);
        loop {
            match reader.next_frame().await {
                Ok(Some(frame)) => {
                    gateway.append_log(LogRecord {
                        workload,
                        seq: 0,
                        at_ms: clock.epoch_ms(),
                        stream: kind,
                        payload: frame.payload,
                        truncated: frame.truncated,
                    });
                }
                Ok(None) => break,
                // Pipe errors are logged but not fatal; the process may
                // still produce an exit.
                Err(e) => {
                    tracing::warn!(%workload, stream = %kind, error = %e, "output stream error");
                    break;
                }
            }
        }
    });
}

fn spawn_sampler<C: Clock>(
    workload: WorkloadId,
    pid: i32,
    interval: Duration,
    clock: C,
    gateway: Arc<StoreGateway>,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        let sys_pid = sysinfo::Pid::from_u32(pid as u32);
        let mut system = sysinfo::System::new();
        let mut tick = tokio::time::interval(interval.max(Duration::from_millis(100)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so cpu_usage has
        // a baseline refresh to diff against.
        tick.tick().await;
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[sys_pid]), true);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {
                    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[sys_pid]), true);
                    let Some(process) = system.process(sys_pid) else { break };
                    let threads = process
                        .tasks()
                        .map(|tasks| tasks.len() as u64)
                        .filter(|n| *n > 0)
                        .unwrap_or(1);
                    gateway.append_metric(MetricSample {
                        workload,
                        at_ms: clock.epoch_ms(),
                        cpu: f64::from(process.cpu_usage()) / 100.0,
                        rss_bytes: process.memory(),
                        threads,
                    });
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
