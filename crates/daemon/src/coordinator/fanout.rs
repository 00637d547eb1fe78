// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event fan-out with bounded per-subscriber queues.
//!
//! Publishing never blocks: a subscriber whose queue is full is dropped
//! on the spot and the survivors are told via `subscriber:lagged`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use warden_core::workload::WorkloadId;
use warden_core::Event;

/// Queue depth per subscriber.
const SUBSCRIBER_QUEUE: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
    /// Restrict delivery to one workload's events; `None` gets
    /// everything. Events with no workload association go to everyone.
    workload: Option<WorkloadId>,
}

#[derive(Default)]
pub struct EventFan {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventFan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, workload: Option<WorkloadId>) -> (u64, mpsc::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.subscribers.lock().push(Subscriber { id, tx, workload });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver to every matching subscriber. Full or closed queues drop
    /// the subscriber; survivors are notified once per casualty.
    pub fn publish(&self, event: &Event) {
        let mut lagged = Vec::new();
        {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|subscriber| {
                if !matches(subscriber, event) {
                    return true;
                }
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(subscriber = subscriber.id, "subscriber lagged, dropping");
                        lagged.push(subscriber.id);
                        false
                    }
                }
            });
        }
        for id in lagged {
            self.publish(&Event::SubscriberLagged { subscriber: id });
        }
    }
}

fn matches(subscriber: &Subscriber, event: &Event) -> bool {
    match (subscriber.workload, event.workload()) {
        (Some(filter), Some(workload)) => filter == workload,
        _ => true,
    }
}

#[cfg(test)]
#[path = "fanout_tests.rs"]
mod tests;
