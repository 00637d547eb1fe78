// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed control errors.
//!
//! Every control operation returns either a typed result or a
//! [`ControlError`]: a stable machine-readable code, a human message, and
//! an optional hint. The error value crosses the IPC boundary verbatim so
//! front-ends can match on `kind` without parsing message text.

use serde::{Deserialize, Serialize};

/// Error kinds for control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NameConflict,
    InvalidArgv,
    InvalidField,
    InvalidExpression,
    InvalidPolicy,
    UnknownPolicy,
    AlreadyActive,
    AlreadyStopped,
    TransientState,
    Busy,
    Timeout,
    SpawnError,
    StoreUnavailable,
    SubscriberLagged,
    Internal,
}

impl ErrorKind {
    /// Short stable code, suitable for exit-status mapping and scripts.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::NameConflict => "name_conflict",
            ErrorKind::InvalidArgv => "invalid_argv",
            ErrorKind::InvalidField => "invalid_field",
            ErrorKind::InvalidExpression => "invalid_expression",
            ErrorKind::InvalidPolicy => "invalid_policy",
            ErrorKind::UnknownPolicy => "unknown_policy",
            ErrorKind::AlreadyActive => "already_active",
            ErrorKind::AlreadyStopped => "already_stopped",
            ErrorKind::TransientState => "transient_state",
            ErrorKind::Busy => "busy",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SpawnError => "spawn_error",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::SubscriberLagged => "subscriber_lagged",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a caller may retry the same command after observing a
    /// state change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientState | ErrorKind::Timeout | ErrorKind::StoreUnavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A typed control error: kind + message + optional hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ControlError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ControlError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} not found"))
    }

    pub fn name_conflict(name: &str) -> Self {
        Self::new(ErrorKind::NameConflict, format!("workload name {name:?} already exists"))
    }

    pub fn invalid_argv(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgv, message)
    }

    pub fn invalid_field(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidField, message)
    }

    pub fn invalid_expression(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidExpression, message)
    }

    pub fn invalid_policy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPolicy, message)
    }

    pub fn unknown_policy(name: &str) -> Self {
        Self::new(ErrorKind::UnknownPolicy, format!("restart policy {name:?} is not defined"))
            .with_hint("define it with put_policy first")
    }

    pub fn already_active(phase: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::AlreadyActive, format!("workload is already active ({phase})"))
    }

    pub fn already_stopped(phase: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::AlreadyStopped, format!("workload is not running ({phase})"))
    }

    pub fn transient_state(phase: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::TransientState, format!("workload is {phase}"))
            .with_hint("retry after the next state change")
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn timeout(op: &str) -> Self {
        Self::new(ErrorKind::Timeout, format!("{op} timed out"))
            .with_hint("the command may still complete; retries are safe")
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
