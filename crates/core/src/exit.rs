// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exit classification for a single workload run.

use serde::{Deserialize, Serialize};

/// How a run ended.
///
/// `SpawnFailed` is the synthetic outcome for a process that never came
/// up (executable missing, permission denied, bad cwd). Keeping it a
/// distinct variant — rather than a reserved integer — guarantees it can
/// never collide with a real exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitStatus {
    /// Process exited on its own with this code.
    Code(i32),
    /// Process was terminated by this signal.
    Signal(i32),
    /// The spawn itself failed; no process ever existed.
    SpawnFailed,
}

impl ExitStatus {
    /// A run is successful iff it exited with code 0 and not via signal.
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    /// The real exit code, when there is one.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Code(c) => Some(*c),
            _ => None,
        }
    }

    #[cfg(unix)]
    pub fn from_std(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status.code() {
            Some(code) => ExitStatus::Code(code),
            None => ExitStatus::Signal(status.signal().unwrap_or(0)),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(c) => write!(f, "exit code {c}"),
            ExitStatus::Signal(s) => write!(f, "signal {s}"),
            ExitStatus::SpawnFailed => write!(f, "spawn failed"),
        }
    }
}

#[cfg(test)]
#[path = "exit_tests.rs"]
mod tests;
