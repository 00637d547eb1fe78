// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::scheduler::{self, SchedulerSeed};
use std::collections::BTreeMap;
use tempfile::tempdir;
use warden_core::workload::Phase;
use warden_core::{ErrorKind, SystemClock};
use warden_storage::StorePaths;

struct Fixture {
    _dir: tempfile::TempDir,
    coordinator: Arc<Coordinator<SystemClock>>,
    shutdown: CancellationToken,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let config = DaemonConfig {
            log_flush_interval_ms: 20,
            default_stop_grace_ms: 2_000,
            ..DaemonConfig::default()
        };
        let shutdown = CancellationToken::new();

        let (events_tx, events_rx) = mpsc::channel(256);
        let gateway =
            StoreGateway::open(&StorePaths::under(dir.path()), config.clone(), events_tx.clone())
                .unwrap();
        tokio::spawn(Arc::clone(&gateway).run_pipeline(shutdown.clone()));

        let wheel = TimerWheel::new();
        tokio::spawn(Arc::clone(&wheel).run(shutdown.clone()));

        let (fires_tx, fires_rx) = mpsc::channel(64);
        let scheduler = scheduler::spawn(SchedulerSeed {
            gateway: Arc::clone(&gateway),
            wheel: Arc::clone(&wheel),
            fires: fires_tx,
            events: events_tx.clone(),
            clock: SystemClock,
            tz: chrono_tz::UTC,
        });

        let coordinator =
            Coordinator::new(gateway, wheel, scheduler, events_tx, SystemClock, config);
        tokio::spawn(Arc::clone(&coordinator).run_events(events_rx, fires_rx, shutdown.clone()));

        Self { _dir: dir, coordinator, shutdown }
    }

    async fn create(&self, name: &str, argv: &[&str]) -> WorkloadId {
        self.coordinator
            .create_workload(
                name.to_string(),
                argv.iter().map(|s| s.to_string()).collect(),
                None,
                BTreeMap::new(),
                None,
                None,
                Vec::new(),
            )
            .await
            .unwrap()
    }

    async fn wait_phase(&self, key: &str, phase: Phase) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.coordinator.describe(key).unwrap().runtime.phase == phase {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {phase}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn create_then_describe_returns_inputs_verbatim() {
    let fx = Fixture::new();
    let id = fx
        .coordinator
        .create_workload(
            "svc".to_string(),
            vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
            Some("/tmp".into()),
            BTreeMap::from([("K".to_string(), "v".to_string())]),
            Some("batch".to_string()),
            None,
            Vec::new(),
        )
        .await
        .unwrap();

    let detail = fx.coordinator.describe(id.as_str()).unwrap();
    assert_eq!(detail.workload.name, "svc");
    assert_eq!(detail.workload.argv, vec!["/bin/sh", "-c", "true"]);
    assert_eq!(detail.workload.cwd.as_deref(), Some(std::path::Path::new("/tmp")));
    assert_eq!(detail.workload.env.get("K").map(String::as_str), Some("v"));
    assert_eq!(detail.workload.group.as_deref(), Some("batch"));
    assert_eq!(detail.runtime.phase, Phase::Idle);
}

#[tokio::test]
async fn duplicate_names_conflict() {
    let fx = Fixture::new();
    fx.create("svc", &["/bin/true"]).await;

    let err = fx
        .coordinator
        .create_workload(
            "svc".to_string(),
            vec!["/bin/true".to_string()],
            None,
            BTreeMap::new(),
            None,
            None,
            Vec::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NameConflict);
}

#[tokio::test]
async fn unknown_policy_is_rejected_before_any_state_change() {
    let fx = Fixture::new();
    let err = fx
        .coordinator
        .create_workload(
            "svc".to_string(),
            vec!["/bin/true".to_string()],
            None,
            BTreeMap::new(),
            None,
            Some("missing".to_string()),
            Vec::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownPolicy);
    assert!(fx.coordinator.list_workloads(None).is_empty());
}

#[tokio::test]
async fn resolve_accepts_name_and_id_prefix() {
    let fx = Fixture::new();
    let id = fx.create("svc", &["/bin/true"]).await;

    assert!(fx.coordinator.describe("svc").is_ok());
    // Unique prefix of the id also resolves.
    let prefix = &id.as_str()[..8];
    assert!(fx.coordinator.describe(prefix).is_ok());
    assert_eq!(
        fx.coordinator.describe("nope").unwrap_err().kind,
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn start_stop_lifecycle_through_the_coordinator() {
    let fx = Fixture::new();
    fx.create("sleeper", &["/bin/sh", "-c", "sleep 30"]).await;

    fx.coordinator.start("sleeper").await.unwrap();
    fx.wait_phase("sleeper", Phase::Running).await;

    let items = fx.coordinator.list_workloads(None);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].phase, Phase::Running);
    assert!(items[0].pid.is_some());

    fx.coordinator.stop("sleeper", None, true).await.unwrap();
    fx.wait_phase("sleeper", Phase::Stopped).await;
}

#[tokio::test]
async fn delete_running_requires_force() {
    let fx = Fixture::new();
    fx.create("sleeper", &["/bin/sh", "-c", "sleep 30"]).await;
    fx.coordinator.start("sleeper").await.unwrap();
    fx.wait_phase("sleeper", Phase::Running).await;

    let err = fx.coordinator.delete_workload("sleeper", false).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);

    fx.coordinator.delete_workload("sleeper", true).await.unwrap();
    assert!(fx.coordinator.list_workloads(None).is_empty());
    assert_eq!(fx.coordinator.describe("sleeper").unwrap_err().kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn update_workload_changes_argv_for_next_run() {
    let fx = Fixture::new();
    let id = fx.create("svc", &["/bin/sh", "-c", "exit 1"]).await;

    fx.coordinator
        .update_workload(
            id.as_str(),
            WorkloadUpdate {
                argv: Some(vec!["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let detail = fx.coordinator.describe(id.as_str()).unwrap();
    assert_eq!(detail.workload.argv[2], "exit 0");

    fx.coordinator.start(id.as_str()).await.unwrap();
    fx.wait_phase(id.as_str(), Phase::Stopped).await;
    let detail = fx.coordinator.describe(id.as_str()).unwrap();
    assert_eq!(detail.runtime.last_exit, Some(warden_core::ExitStatus::Code(0)));
}

#[tokio::test]
async fn put_policy_validates_and_propagates() {
    let fx = Fixture::new();
    let bad = RestartPolicy { multiplier: 0.1, ..RestartPolicy::none() };
    assert_eq!(
        fx.coordinator.put_policy(bad).await.unwrap_err().kind,
        ErrorKind::InvalidPolicy
    );

    let policy = warden_core::test_support::fast_retry_policy(2);
    fx.coordinator.put_policy(policy.clone()).await.unwrap();

    // A workload can now reference it.
    fx.coordinator
        .create_workload(
            "svc".to_string(),
            vec!["/bin/true".to_string()],
            None,
            BTreeMap::new(),
            None,
            Some(policy.name.clone()),
            Vec::new(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn schedule_lifecycle_via_coordinator() {
    let fx = Fixture::new();
    let id = fx.create("svc", &["/bin/sh", "-c", "exit 0"]).await;

    let schedule_id = fx
        .coordinator
        .put_schedule(id.as_str(), ScheduleSpec::Interval { every_ms: 100 }, true)
        .await
        .unwrap();

    // The schedule shows up in describe and fires the workload.
    let detail = fx.coordinator.describe(id.as_str()).unwrap();
    assert_eq!(detail.schedules.len(), 1);
    assert!(detail.workload.schedules.contains(&schedule_id));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let phase = fx.coordinator.describe(id.as_str()).unwrap().runtime.phase;
        if phase != Phase::Idle {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "schedule never fired");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fx.coordinator.set_schedule_enabled(schedule_id.as_str(), false).await.unwrap();
    assert_eq!(
        fx.coordinator
            .set_schedule_enabled("sch-missing", false)
            .await
            .unwrap_err()
            .kind,
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn invalid_schedule_expression_is_rejected() {
    let fx = Fixture::new();
    let id = fx.create("svc", &["/bin/true"]).await;
    let err = fx
        .coordinator
        .put_schedule(id.as_str(), ScheduleSpec::Cron { expr: "bogus".to_string() }, true)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidExpression);
}

#[tokio::test]
async fn subscribers_see_phase_events() {
    let fx = Fixture::new();
    let id = fx.create("svc", &["/bin/sh", "-c", "exit 0"]).await;
    let (sub_id, mut rx) = fx.coordinator.subscribe(Some(id.as_str())).unwrap();

    fx.coordinator.start(id.as_str()).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut saw_running = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Event::PhaseChanged { to: Phase::Running, .. })) => {
                saw_running = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_running);
    fx.coordinator.unsubscribe(sub_id);
}

#[tokio::test]
async fn health_aggregates_phase_counts() {
    let fx = Fixture::new();
    fx.create("a", &["/bin/true"]).await;
    fx.create("b", &["/bin/true"]).await;

    let report = fx.coordinator.health();
    assert_eq!(report.phase_counts.get("idle"), Some(&2));
    assert!(!report.persistence_lag);
}

#[tokio::test]
async fn recovery_restores_workloads_and_marks_lost() {
    let dir = tempdir().unwrap();
    let config = DaemonConfig { log_flush_interval_ms: 20, ..DaemonConfig::default() };
    let shutdown = CancellationToken::new();

    // First generation: create a workload with restart_on_lost and
    // record a running pid, then drop everything without cleanup.
    let id;
    {
        let (events_tx, _events_rx) = mpsc::channel(256);
        let gateway =
            StoreGateway::open(&StorePaths::under(dir.path()), config.clone(), events_tx.clone())
                .unwrap();
        let policy = RestartPolicy {
            restart_on_lost: true,
            ..warden_core::test_support::fast_retry_policy(1)
        };
        gateway.put_policy(&policy).unwrap();
        let mut w = warden_core::test_support::workload("svc2", &["/bin/sh", "-c", "exit 0"]);
        w.policy = Some(policy.name.clone());
        id = w.id;
        gateway.upsert_workload(&w, true).unwrap();
        gateway.record_runtime(&Event::RunStarted { workload: w.id, pid: 4242, at_ms: 1 });
    }

    // Second generation: recover.
    let (events_tx, mut events_rx) = mpsc::channel(256);
    let gateway =
        StoreGateway::open(&StorePaths::under(dir.path()), config.clone(), events_tx.clone())
            .unwrap();
    tokio::spawn(Arc::clone(&gateway).run_pipeline(shutdown.clone()));
    let wheel = TimerWheel::new();
    tokio::spawn(Arc::clone(&wheel).run(shutdown.clone()));
    let (fires_tx, _fires_rx) = mpsc::channel(64);
    let scheduler = scheduler::spawn(SchedulerSeed {
        gateway: Arc::clone(&gateway),
        wheel: Arc::clone(&wheel),
        fires: fires_tx,
        events: events_tx.clone(),
        clock: SystemClock,
        tz: chrono_tz::UTC,
    });
    let coordinator = Coordinator::new(
        Arc::clone(&gateway),
        wheel,
        scheduler,
        events_tx,
        SystemClock,
        config,
    );

    let state = gateway.recovered_state();
    assert_eq!(state.running.get(id.as_str()), Some(&4242));
    coordinator.recover(state).await;

    // One lost_on_recovery precedes the fresh start.
    let mut saw_lost = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), events_rx.recv()).await {
            Ok(Some(Event::LostOnRecovery { workload, pid })) => {
                assert_eq!(workload, id);
                assert_eq!(pid, 4242);
                saw_lost = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_lost);

    // The workload is back under supervision and restarts per policy.
    let detail = coordinator.describe(id.as_str()).unwrap();
    assert_eq!(detail.workload.name, "svc2");

    shutdown.cancel();
}
