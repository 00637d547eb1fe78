// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The timer wheel: deadline → token delivery.
//!
//! The only component allowed to sleep on absolute time. Everything
//! else registers a `(deadline, token)` pair together with the channel
//! that should receive the token, and gets woken through its own
//! mailbox. Tokens with equal deadlines are delivered in insertion
//! order. Cancellation is by token id.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type TimerToken = u64;

/// Worst-case delivery lag when no earlier deadline wakes the driver.
const RESOLUTION: Duration = Duration::from_millis(100);

struct Entry {
    deadline: Instant,
    /// Insertion sequence; breaks ties so equal deadlines deliver in
    /// insertion order.
    seq: u64,
    token: TimerToken,
    tx: mpsc::Sender<TimerToken>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Tokens scheduled and not yet popped; membership check makes
    /// cancellation cheap without touching the heap.
    live: HashSet<TimerToken>,
    cancelled: HashSet<TimerToken>,
    next_token: TimerToken,
    next_seq: u64,
}

/// Shared timer wheel. Create once, [`run`](TimerWheel::run) once.
pub struct TimerWheel {
    inner: Mutex<Inner>,
    wake: Notify,
}

impl TimerWheel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(Inner::default()), wake: Notify::new() })
    }

    /// Register a deadline. The token is delivered to `tx` on or after
    /// the deadline.
    pub fn schedule_at(&self, deadline: Instant, tx: mpsc::Sender<TimerToken>) -> TimerToken {
        let token = {
            let mut inner = self.inner.lock();
            inner.next_token += 1;
            inner.next_seq += 1;
            let token = inner.next_token;
            let seq = inner.next_seq;
            inner.live.insert(token);
            inner.heap.push(Reverse(Entry { deadline, seq, token, tx }));
            token
        };
        self.wake.notify_one();
        token
    }

    pub fn schedule_after(&self, delay: Duration, tx: mpsc::Sender<TimerToken>) -> TimerToken {
        self.schedule_at(Instant::now() + delay, tx)
    }

    /// Cancel a pending timer. Returns false when the token already
    /// fired or never existed. The heap entry stays behind and is
    /// discarded lazily when it surfaces.
    pub fn cancel(&self, token: TimerToken) -> bool {
        let mut inner = self.inner.lock();
        if inner.live.remove(&token) {
            inner.cancelled.insert(token);
            true
        } else {
            false
        }
    }

    /// Number of pending (non-cancelled) timers.
    pub fn pending(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Drive deliveries until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let (due, next_deadline) = self.pop_due(Instant::now());

            for (token, tx) in due {
                // A full or closed mailbox is the receiver's problem;
                // the wheel never blocks.
                if let Err(e) = tx.try_send(token) {
                    tracing::trace!(token, error = %e, "timer delivery skipped");
                }
            }

            let sleep_until = next_deadline.unwrap_or_else(|| Instant::now() + RESOLUTION);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(sleep_until) => {}
            }
        }
    }

    /// Pop everything due at `now`; also report the next pending
    /// deadline.
    fn pop_due(&self, now: Instant) -> (Vec<(TimerToken, mpsc::Sender<TimerToken>)>, Option<Instant>) {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();
        loop {
            match inner.heap.peek() {
                Some(Reverse(entry)) if entry.deadline <= now => {
                    let Some(Reverse(entry)) = inner.heap.pop() else { break };
                    if !inner.cancelled.remove(&entry.token) {
                        inner.live.remove(&entry.token);
                        due.push((entry.token, entry.tx));
                    }
                }
                _ => break,
            }
        }
        // Skim cancelled entries off the top so the sleep target is real.
        while let Some(Reverse(entry)) = inner.heap.peek() {
            if inner.cancelled.contains(&entry.token) {
                let token = entry.token;
                inner.heap.pop();
                inner.cancelled.remove(&token);
            } else {
                break;
            }
        }
        let next = inner.heap.peek().map(|Reverse(e)| e.deadline);
        (due, next)
    }
}

#[cfg(test)]
#[path = "timer_tests.rs"]
mod tests;
