// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::scheduler::{self, SchedulerSeed};
use crate::timer::TimerWheel;
use std::collections::BTreeMap;
use tempfile::tempdir;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use warden_core::workload::Phase;
use warden_core::{DaemonConfig, ErrorKind, Event, SystemClock};
use warden_storage::{StoreGateway, StorePaths};

struct Fixture {
    _dir: tempfile::TempDir,
    socket: std::path::PathBuf,
    shutdown: CancellationToken,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("wardend.sock");
        let config = DaemonConfig { log_flush_interval_ms: 20, ..DaemonConfig::default() };
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

        let unix = tokio::net::UnixListener::bind(&socket).unwrap();
        let listener = Listener::new(unix, coordinator, shutdown.clone());
        tokio::spawn(listener.run());

        Self { _dir: dir, socket, shutdown }
    }

    async fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.socket).await.unwrap()
    }

    async fn roundtrip(&self, request: &Request) -> Response {
        let mut stream = self.connect().await;
        protocol::write_typed(&mut stream, request).await.unwrap();
        protocol::read_typed(&mut stream).await.unwrap()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn create_request(name: &str, argv: &[&str]) -> Request {
    Request::CreateWorkload {
        name: name.to_string(),
        argv: argv.iter().map(|s| s.to_string()).collect(),
        cwd: None,
        env: BTreeMap::new(),
        group: None,
        policy: None,
        schedules: Vec::new(),
    }
}

#[tokio::test]
async fn ping_pong() {
    let fx = Fixture::new().await;
    match fx.roundtrip(&Request::Ping).await {
        Response::Pong { version } => assert_eq!(version, crate::env::PROTOCOL_VERSION),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn create_list_describe_over_the_socket() {
    let fx = Fixture::new().await;

    let id = match fx.roundtrip(&create_request("svc", &["/bin/sh", "-c", "true"])).await {
        Response::Created { id } => id,
        other => panic!("unexpected response: {other:?}"),
    };

    match fx.roundtrip(&Request::ListWorkloads { filter: None }).await {
        Response::Workloads { items } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].id, id);
            assert_eq!(items[0].phase, Phase::Idle);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    match fx.roundtrip(&Request::Describe { id }).await {
        Response::Workload { detail } => assert_eq!(detail.workload.name, "svc"),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn errors_cross_the_wire_typed() {
    let fx = Fixture::new().await;
    match fx.roundtrip(&Request::Start { id: "nope".to_string() }).await {
        Response::Error { error } => assert_eq!(error.kind, ErrorKind::NotFound),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn bad_duration_is_invalid_field() {
    let fx = Fixture::new().await;
    fx.roundtrip(&create_request("svc", &["/bin/sh", "-c", "sleep 5"])).await;
    match fx
        .roundtrip(&Request::Stop {
            id: "svc".to_string(),
            grace: Some("soon".to_string()),
            force: false,
        })
        .await
    {
        Response::Error { error } => assert_eq!(error.kind, ErrorKind::InvalidField),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn interval_schedule_accepts_wire_duration() {
    let fx = Fixture::new().await;
    fx.roundtrip(&create_request("svc", &["/bin/sh", "-c", "true"])).await;
    match fx
        .roundtrip(&Request::PutSchedule {
            id: "svc".to_string(),
            kind: ScheduleKind::Interval,
            expression: "2s".to_string(),
            enabled: true,
        })
        .await
    {
        Response::ScheduleCreated { schedule_id } => assert!(schedule_id.starts_with("sch-")),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn subscribe_streams_phase_events() {
    let fx = Fixture::new().await;
    fx.roundtrip(&create_request("svc", &["/bin/sh", "-c", "exit 0"])).await;

    let mut sub = fx.connect().await;
    protocol::write_typed(&mut sub, &Request::SubscribeEvents { workload: None }).await.unwrap();
    let ack: Response = protocol::read_typed(&mut sub).await.unwrap();
    assert_eq!(ack, Response::Ok);

    fx.roundtrip(&Request::Start { id: "svc".to_string() }).await;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let frame: Response = tokio::time::timeout_at(deadline, protocol::read_typed(&mut sub))
            .await
            .expect("timed out waiting for events")
            .unwrap();
        if let Response::Event { event: Event::PhaseChanged { to: Phase::Running, .. } } = frame {
            break;
        }
    }
}

#[tokio::test]
async fn multiple_requests_per_connection() {
    let fx = Fixture::new().await;
    let mut stream = fx.connect().await;
    for _ in 0..3 {
        protocol::write_typed(&mut stream, &Request::Ping).await.unwrap();
        let response: Response = protocol::read_typed(&mut stream).await.unwrap();
        assert!(matches!(response, Response::Pong { .. }));
    }
}
