// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Restart policies and their pure evaluation.
//!
//! A policy is a named record of field values; there is no behavior
//! attached to it beyond [`decide`] and [`backoff_delay`], which are pure
//! so every branch can be tested without a process or a clock.

use crate::error::ControlError;
use crate::exit::ExitStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Distinguished `max_retries` value meaning "retry forever".
pub const UNBOUNDED_RETRIES: u32 = u32::MAX;

/// Named, reusable restart policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub name: String,
    /// Maximum consecutive retries; [`UNBOUNDED_RETRIES`] means unbounded.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    /// Backoff multiplier, finite and ≥ 1.0.
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Exit codes that trigger a restart. Empty means "any non-zero".
    /// Signal terminations and spawn failures always qualify.
    #[serde(default)]
    pub restart_on_exit_codes: BTreeSet<i32>,
    /// Whether a clean exit (code 0) is also restarted.
    #[serde(default)]
    pub restart_on_success: bool,
    /// Whether a workload whose process was lost across a daemon restart
    /// is started again during recovery.
    #[serde(default)]
    pub restart_on_lost: bool,
}

impl RestartPolicy {
    /// The built-in do-nothing policy: never restart.
    pub fn none() -> Self {
        Self {
            name: "none".to_string(),
            max_retries: 0,
            initial_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            restart_on_exit_codes: BTreeSet::new(),
            restart_on_success: false,
            restart_on_lost: false,
        }
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if self.name.is_empty() {
            return Err(ControlError::invalid_policy("policy name must not be empty"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ControlError::invalid_policy(format!(
                "multiplier must be finite and >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ControlError::invalid_policy(format!(
                "initial_delay ({}ms) exceeds max_delay ({}ms)",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Whether this exit qualifies for a restart attempt at all.
    fn exit_qualifies(&self, exit: ExitStatus) -> bool {
        match exit {
            ExitStatus::Code(0) => self.restart_on_success,
            ExitStatus::Code(code) => {
                self.restart_on_exit_codes.is_empty()
                    || self.restart_on_exit_codes.contains(&code)
            }
            // No code to match against the set.
            ExitStatus::Signal(_) | ExitStatus::SpawnFailed => true,
        }
    }
}

/// Outcome of evaluating a policy against an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Come to rest in `Stopped`.
    Stop,
    /// Back off for `delay`, then start again.
    Retry { delay: Duration },
    /// Retries exhausted: come to rest in `Failed`.
    GiveUp,
}

/// Backoff before retry number `consecutive_failures + 1`:
/// `min(initial × multiplier^consecutive_failures, max)`.
pub fn backoff_delay(policy: &RestartPolicy, consecutive_failures: u32) -> Duration {
    let initial = policy.initial_delay_ms as f64;
    // powi saturates to infinity for large exponents; min() with the cap
    // keeps the result finite.
    let exponent = consecutive_failures.min(i32::MAX as u32) as i32;
    let raw = initial * policy.multiplier.powi(exponent);
    let capped = raw.min(policy.max_delay_ms as f64);
    Duration::from_millis(capped.max(0.0) as u64)
}

/// Evaluate a finished run against its policy.
///
/// `consecutive_failures` is the count *before* this exit; callers
/// increment it when the decision is `Retry`.
pub fn decide(
    policy: &RestartPolicy,
    exit: ExitStatus,
    consecutive_failures: u32,
) -> RestartDecision {
    if !policy.exit_qualifies(exit) {
        return RestartDecision::Stop;
    }
    if policy.max_retries != UNBOUNDED_RETRIES && consecutive_failures + 1 > policy.max_retries {
        // A successful exit with restart_on_success exhausting its budget
        // still rests in Stopped, not Failed.
        return if exit.is_success() { RestartDecision::Stop } else { RestartDecision::GiveUp };
    }
    RestartDecision::Retry { delay: backoff_delay(policy, consecutive_failures) }
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
