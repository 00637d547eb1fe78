// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon startup: lock, load, recover, bind — in that order.

use super::{cleanup, Daemon, LifecycleError, Paths};
use crate::coordinator::Coordinator;
use crate::listener::Listener;
use crate::scheduler::{self, SchedulerSeed};
use crate::timer::TimerWheel;
use fs2::FileExt;
use std::io::Write;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warden_core::{DaemonConfig, SystemClock};
use warden_storage::StoreGateway;

/// Start the daemon.
pub async fn startup(paths: &Paths) -> Result<Daemon, LifecycleError> {
    match startup_inner(paths).await {
        Ok(daemon) => Ok(daemon),
        Err(e) => {
            // Leave the lock file alone when someone else holds it.
            if !matches!(e, LifecycleError::LockFailed(_)) {
                cleanup(paths);
            }
            Err(e)
        }
    }
}

async fn startup_inner(paths: &Paths) -> Result<Daemon, LifecycleError> {
    // 1. State directory first; everything lives under it.
    std::fs::create_dir_all(&paths.state_dir)?;

    // 2. Acquire the instance lock before touching shared files. Open
    // without truncating so a failed lock leaves the owner's pid intact.
    let lock_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&paths.lock)?;
    lock_file.try_lock_exclusive().map_err(LifecycleError::LockFailed)?;
    let mut lock_file = lock_file;
    lock_file.set_len(0)?;
    writeln!(lock_file, "{}", std::process::id())?;
    let lock_file = lock_file;

    // 3. Configuration (missing file = defaults; bad file = refuse).
    let config = DaemonConfig::load(&paths.config_file)?;
    let tz = config.tz()?;

    let shutdown = CancellationToken::new();

    // 4. Store: snapshot + WAL replay.
    let (events_tx, events_rx) = mpsc::channel(1024);
    let gateway = StoreGateway::open(&paths.store, config.clone(), events_tx.clone())?;
    tokio::spawn(Arc::clone(&gateway).run_pipeline(shutdown.clone()));

    // 5. Timer wheel and scheduler.
    let wheel = TimerWheel::new();
    tokio::spawn(Arc::clone(&wheel).run(shutdown.clone()));

    let (fires_tx, fires_rx) = mpsc::channel(256);
    let scheduler = scheduler::spawn(SchedulerSeed {
        gateway: Arc::clone(&gateway),
        wheel: Arc::clone(&wheel),
        fires: fires_tx,
        events: events_tx.clone(),
        clock: SystemClock,
        tz,
    });

    // 6. Coordinator and its event loop.
    let coordinator = Coordinator::new(
        Arc::clone(&gateway),
        wheel,
        scheduler,
        events_tx,
        SystemClock,
        config,
    );
    tokio::spawn(Arc::clone(&coordinator).run_events(events_rx, fires_rx, shutdown.clone()));

    // 7. Recovery: supervisors in Idle, lost pids flagged, schedules
    // re-armed.
    let state = gateway.recovered_state();
    info!(
        workloads = state.workloads.len(),
        policies = state.policies.len(),
        schedules = state.schedules.len(),
        "recovered state"
    );
    coordinator.recover(state).await;

    // 8. Bind the socket last, once the daemon can actually serve.
    if paths.socket.exists() {
        std::fs::remove_file(&paths.socket)?;
    }
    let unix = UnixListener::bind(&paths.socket)
        .map_err(|e| LifecycleError::BindFailed(paths.socket.clone(), e))?;
    let listener = Listener::new(unix, Arc::clone(&coordinator), shutdown.clone());

    info!(socket = %paths.socket.display(), "daemon started");
    Ok(Daemon {
        coordinator,
        gateway,
        listener,
        shutdown,
        paths: paths.clone(),
        lock_file,
    })
}
