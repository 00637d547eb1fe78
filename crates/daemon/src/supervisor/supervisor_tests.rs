// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use warden_core::test_support::{fast_retry_policy, workload};
use warden_core::workload::WorkloadId;
use warden_core::{DaemonConfig, ErrorKind, SystemClock};
use warden_storage::StorePaths;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    _dir: tempfile::TempDir,
    gateway: Arc<StoreGateway>,
    wheel: Arc<TimerWheel>,
    events_rx: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    shutdown: CancellationToken,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let (events_tx, events_rx) = mpsc::channel(256);
        let config = DaemonConfig { log_flush_interval_ms: 20, ..DaemonConfig::default() };
        let gateway =
            StoreGateway::open(&StorePaths::under(dir.path()), config, events_tx.clone()).unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&gateway).run_pipeline(shutdown.clone()));
        let wheel = TimerWheel::new();
        tokio::spawn(Arc::clone(&wheel).run(shutdown.clone()));
        Self { _dir: dir, gateway, wheel, events_rx, events_tx, shutdown }
    }

    fn supervisor(&self, argv: &[&str], policy: RestartPolicy) -> SupervisorHandle {
        spawn(SupervisorSeed {
            workload: workload("test", argv),
            policy,
            gateway: Arc::clone(&self.gateway),
            wheel: Arc::clone(&self.wheel),
            events: self.events_tx.clone(),
            clock: SystemClock,
            config: SupervisorConfig {
                default_stop_grace: Duration::from_secs(2),
                sample_interval: Duration::from_secs(60),
                max_line_len: DEFAULT_MAX_LINE_LEN,
            },
        })
    }

    /// Collect observed phases until `last` is reached or time runs out.
    async fn phases_until(&mut self, last: Phase) -> Vec<Phase> {
        let mut phases = Vec::new();
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events_rx.recv())
                .await
                .expect("timed out waiting for phase")
                .expect("event channel closed");
            if let Event::PhaseChanged { to, .. } = event {
                phases.push(to);
                if to == last {
                    return phases;
                }
            }
        }
    }

    async fn wait_for_phase(&mut self, phase: Phase) {
        self.phases_until(phase).await;
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn normal_run_walks_starting_running_stopped() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/sh", "-c", "exit 0"], RestartPolicy::none());

    assert_eq!(handle.status().phase, Phase::Idle);
    handle.start(TIMEOUT).await.unwrap();

    let phases = fx.phases_until(Phase::Stopped).await;
    assert_eq!(phases, vec![Phase::Starting, Phase::Running, Phase::Evaluating, Phase::Stopped]);

    let status = handle.status();
    assert_eq!(status.phase, Phase::Stopped);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.last_exit, Some(ExitStatus::Code(0)));
    assert!(status.pid.is_none());
}

#[tokio::test]
async fn failing_run_retries_then_fails() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/sh", "-c", "exit 7"], fast_retry_policy(3));
    handle.start(TIMEOUT).await.unwrap();

    let phases = fx.phases_until(Phase::Failed).await;
    let backoffs = phases.iter().filter(|p| **p == Phase::BackingOff).count();
    let startings = phases.iter().filter(|p| **p == Phase::Starting).count();
    assert_eq!(backoffs, 3, "exactly three backoff transitions: {phases:?}");
    assert_eq!(startings, 4, "four spawn attempts: {phases:?}");

    let status = handle.status();
    assert_eq!(status.phase, Phase::Failed);
    assert_eq!(status.consecutive_failures, 3);
    assert_eq!(status.last_exit, Some(ExitStatus::Code(7)));
}

#[tokio::test]
async fn max_retries_zero_fails_without_backoff() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/sh", "-c", "exit 7"], fast_retry_policy(0));
    handle.start(TIMEOUT).await.unwrap();

    let phases = fx.phases_until(Phase::Failed).await;
    assert!(!phases.contains(&Phase::BackingOff), "no backoff: {phases:?}");
}

#[tokio::test]
async fn spawn_failure_routes_through_policy() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/nonexistent/bin/nope"], fast_retry_policy(1));
    // Accepted: the failure surfaces through events, not the caller.
    handle.start(TIMEOUT).await.unwrap();

    let phases = fx.phases_until(Phase::Failed).await;
    assert_eq!(phases.iter().filter(|p| **p == Phase::BackingOff).count(), 1);
    assert_eq!(handle.status().last_exit, Some(ExitStatus::SpawnFailed));
}

#[tokio::test]
async fn start_while_running_is_already_active() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/sh", "-c", "sleep 10"], RestartPolicy::none());
    handle.start(TIMEOUT).await.unwrap();
    fx.wait_for_phase(Phase::Running).await;

    let err = handle.start(TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyActive);

    handle.stop(None, true, TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn stop_when_stopped_is_already_stopped() {
    let fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/true"], RestartPolicy::none());
    let err = handle.stop(None, false, TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyStopped);
    // Idempotent: state unchanged.
    assert_eq!(handle.status().phase, Phase::Idle);
}

#[tokio::test]
async fn stop_running_workload_resolves_after_exit() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/sh", "-c", "sleep 30"], fast_retry_policy(5));
    handle.start(TIMEOUT).await.unwrap();
    fx.wait_for_phase(Phase::Running).await;

    handle.stop(None, false, TIMEOUT).await.unwrap();
    let status = handle.status();
    assert_eq!(status.phase, Phase::Stopped);
    // User-initiated stop never counts as a failure.
    assert_eq!(status.consecutive_failures, 0);
}

#[tokio::test]
async fn stop_during_backoff_cancels_the_retry() {
    let mut fx = Fixture::new();
    let mut policy = fast_retry_policy(5);
    policy.initial_delay_ms = 5_000; // long enough to catch mid-backoff
    policy.max_delay_ms = 5_000;
    let handle = fx.supervisor(&["/bin/sh", "-c", "exit 1"], policy);
    handle.start(TIMEOUT).await.unwrap();
    fx.wait_for_phase(Phase::BackingOff).await;

    handle.stop(None, false, TIMEOUT).await.unwrap();
    assert_eq!(handle.status().phase, Phase::Stopped);

    // The cancelled retry never fires.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.status().phase, Phase::Stopped);
}

#[tokio::test]
async fn restart_stops_then_starts_atomically() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/sh", "-c", "sleep 30"], RestartPolicy::none());
    handle.start(TIMEOUT).await.unwrap();
    fx.wait_for_phase(Phase::Running).await;
    let first_pid = handle.status().pid.unwrap();

    handle.restart(None, TIMEOUT).await.unwrap();
    let phases = fx.phases_until(Phase::Running).await;
    assert_eq!(phases, vec![Phase::Stopping, Phase::Stopped, Phase::Starting, Phase::Running]);

    let second_pid = handle.status().pid.unwrap();
    assert_ne!(first_pid, second_pid);

    handle.stop(None, true, TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn restart_race_produces_exactly_one_stop_start_sequence() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/sh", "-c", "sleep 30"], RestartPolicy::none());
    handle.start(TIMEOUT).await.unwrap();
    fx.wait_for_phase(Phase::Running).await;

    // Concurrent restart, start, stop from three callers.
    let restart = handle.restart(None, TIMEOUT);
    let concurrent_start = handle.start(TIMEOUT);
    let concurrent_stop = handle.stop(None, false, TIMEOUT);
    let (restart_result, start_result, stop_result) =
        tokio::join!(restart, concurrent_start, concurrent_stop);

    restart_result.unwrap();

    // The interleaved start is rejected or raced a stopped window; it
    // must not double-spawn.
    if let Err(err) = start_result {
        assert!(matches!(err.kind, ErrorKind::AlreadyActive | ErrorKind::TransientState));
    }
    // The interleaved stop either won (workload rests) or was absorbed.
    if let Err(err) = stop_result {
        assert!(matches!(err.kind, ErrorKind::AlreadyStopped));
    }

    // Let everything settle; exactly zero or one process may remain.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = handle.status();
    assert!(
        matches!(status.phase, Phase::Running | Phase::Stopped),
        "settled phase: {:?}",
        status.phase
    );

    handle.delete(true, TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn schedule_fire_starts_idle_workload() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/sh", "-c", "exit 0"], RestartPolicy::none());
    handle.fire(ScheduleId::from("sch-t")).await.unwrap();
    let phases = fx.phases_until(Phase::Stopped).await;
    assert!(phases.contains(&Phase::Running));
}

#[tokio::test]
async fn schedule_fire_while_running_is_skipped() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/sh", "-c", "sleep 10"], RestartPolicy::none());
    handle.start(TIMEOUT).await.unwrap();
    fx.wait_for_phase(Phase::Running).await;
    let pid = handle.status().pid;

    handle.fire(ScheduleId::from("sch-t")).await.unwrap();

    // The skip event arrives; no second spawn happens.
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, fx.events_rx.recv())
            .await
            .expect("timed out waiting for skip")
            .expect("event channel closed");
        if let Event::SkippedConcurrent { phase, .. } = event {
            assert_eq!(phase, Phase::Running);
            break;
        }
    }
    assert_eq!(handle.status().pid, pid);

    handle.stop(None, true, TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn delete_running_without_force_is_busy() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/sh", "-c", "sleep 10"], RestartPolicy::none());
    handle.start(TIMEOUT).await.unwrap();
    fx.wait_for_phase(Phase::Running).await;

    let err = handle.delete(false, TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);
    assert_eq!(handle.status().phase, Phase::Running);

    handle.delete(true, TIMEOUT).await.unwrap();
    assert_eq!(handle.status().phase, Phase::Terminated);
}

#[tokio::test]
async fn delete_idle_terminates_immediately() {
    let fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/true"], RestartPolicy::none());
    handle.delete(false, TIMEOUT).await.unwrap();
    assert_eq!(handle.status().phase, Phase::Terminated);

    // Commands to a terminated supervisor surface as errors, not hangs.
    assert!(handle.start(TIMEOUT).await.is_err());
}

#[tokio::test]
async fn failed_workload_restarts_on_manual_start() {
    let mut fx = Fixture::new();
    let handle = fx.supervisor(&["/bin/sh", "-c", "exit 1"], fast_retry_policy(0));
    handle.start(TIMEOUT).await.unwrap();
    fx.wait_for_phase(Phase::Failed).await;

    // Manual reset from Failed.
    handle.start(TIMEOUT).await.unwrap();
    fx.wait_for_phase(Phase::Starting).await;
}

#[tokio::test]
async fn success_resets_consecutive_failures() {
    let mut fx = Fixture::new();
    let mut policy = fast_retry_policy(5);
    policy.restart_on_success = true;
    // Fails twice, then succeeds (state kept in a temp file).
    let dir = tempdir().unwrap();
    let marker = dir.path().join("attempts");
    let script = format!(
        "n=$(cat {m} 2>/dev/null || echo 0); echo $((n+1)) > {m}; [ $n -ge 2 ]",
        m = marker.display()
    );
    let handle = fx.supervisor(&["/bin/sh", "-c", &script], policy);
    handle.start(TIMEOUT).await.unwrap();

    // Wait until a success-driven backoff happens: failures reset first.
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, fx.events_rx.recv())
            .await
            .expect("timed out")
            .expect("event channel closed");
        if let Event::RunExited { exit: ExitStatus::Code(0), .. } = event {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.status().consecutive_failures, 0);

    handle.stop(None, false, TIMEOUT).await.ok();
}
