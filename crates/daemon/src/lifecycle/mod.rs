// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle: filesystem layout, startup, shutdown.

mod startup;

pub use startup::startup;

use crate::coordinator::Coordinator;
use crate::listener::Listener;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use warden_core::config::ConfigError;
use warden_core::SystemClock;
use warden_storage::{StoreGateway, StoreOpenError, StorePaths};

/// Filesystem layout under the state directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub state_dir: PathBuf,
    pub socket: PathBuf,
    pub lock: PathBuf,
    pub config_file: PathBuf,
    pub store: StorePaths,
}

impl Paths {
    pub fn under(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            socket: state_dir.join("wardend.sock"),
            lock: state_dir.join("wardend.lock"),
            config_file: state_dir.join("config.toml"),
            store: StorePaths::under(state_dir),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("another daemon holds the lock: {0}")]
    LockFailed(std::io::Error),
    #[error("failed to bind {0}: {1}")]
    BindFailed(PathBuf, std::io::Error),
    #[error("cannot determine a state directory (set WARDEN_STATE_DIR or HOME)")]
    NoStateDir,
    #[error("store error: {0}")]
    Store(#[from] StoreOpenError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// A started daemon, ready to serve.
pub struct Daemon {
    pub coordinator: Arc<Coordinator<SystemClock>>,
    pub(crate) gateway: Arc<StoreGateway>,
    pub(crate) listener: Listener<SystemClock>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) paths: Paths,
    /// Held for the daemon's lifetime; releasing it frees the instance
    /// lock.
    #[allow(dead_code)]
    pub(crate) lock_file: File,
}

impl Daemon {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token fires, then stop workloads and
    /// tear down.
    pub async fn run(self) {
        let kill_on_shutdown = self.listener.kill_flag();
        self.listener.run().await;

        tracing::info!("shutting down");
        let kill = kill_on_shutdown.load(std::sync::atomic::Ordering::Relaxed);
        tokio::time::timeout(
            crate::env::drain_timeout() + warden_core::DaemonConfig::default().default_stop_grace(),
            self.coordinator.shutdown_workloads(kill),
        )
        .await
        .unwrap_or_else(|_| tracing::warn!("workload shutdown timed out"));

        if let Err(e) = self.gateway.checkpoint() {
            tracing::warn!(error = %e, "final checkpoint failed");
        }
        cleanup(&self.paths);
        tracing::info!("daemon stopped");
    }
}

pub(crate) fn cleanup(paths: &Paths) {
    for path in [&paths.socket, &paths.lock] {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
