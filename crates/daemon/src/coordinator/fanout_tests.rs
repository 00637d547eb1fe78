// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use warden_core::workload::Phase;

fn phase_event(workload: &str) -> Event {
    Event::PhaseChanged {
        workload: WorkloadId::from(workload),
        from: Phase::Idle,
        to: Phase::Starting,
        at_ms: 0,
    }
}

#[tokio::test]
async fn delivers_to_all_unfiltered_subscribers() {
    let fan = EventFan::new();
    let (_a, mut rx_a) = fan.subscribe(None);
    let (_b, mut rx_b) = fan.subscribe(None);

    fan.publish(&phase_event("wl-1"));

    assert!(matches!(rx_a.recv().await, Some(Event::PhaseChanged { .. })));
    assert!(matches!(rx_b.recv().await, Some(Event::PhaseChanged { .. })));
}

#[tokio::test]
async fn workload_filter_applies() {
    let fan = EventFan::new();
    let (_id, mut rx) = fan.subscribe(Some(WorkloadId::from("wl-1")));

    fan.publish(&phase_event("wl-2"));
    fan.publish(&phase_event("wl-1"));

    match rx.recv().await {
        Some(Event::PhaseChanged { workload, .. }) => assert_eq!(workload, "wl-1"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(rx.try_recv().is_err(), "filtered event leaked");
}

#[tokio::test]
async fn global_events_reach_filtered_subscribers() {
    let fan = EventFan::new();
    let (_id, mut rx) = fan.subscribe(Some(WorkloadId::from("wl-1")));

    fan.publish(&Event::PersistenceLag { pending: 1, consecutive_failures: 3 });
    assert!(matches!(rx.recv().await, Some(Event::PersistenceLag { .. })));
}

#[tokio::test]
async fn slow_subscriber_is_dropped_and_reported() {
    let fan = std::sync::Arc::new(EventFan::new());
    let (slow_id, _slow_rx) = fan.subscribe(None);
    let (_live, mut live_rx) = fan.subscribe(None);

    // A live subscriber keeps draining and watches for the lag notice.
    let collector = tokio::spawn(async move {
        while let Some(event) = live_rx.recv().await {
            if let Event::SubscriberLagged { subscriber } = event {
                return subscriber;
            }
        }
        0
    });

    // Overfill the slow subscriber's queue (capacity 256) while the
    // live one drains.
    for _ in 0..400 {
        fan.publish(&phase_event("wl-1"));
        tokio::task::yield_now().await;
    }
    assert_eq!(fan.subscriber_count(), 1, "slow subscriber dropped");

    let reported = tokio::time::timeout(std::time::Duration::from_secs(2), collector)
        .await
        .expect("lag notice never arrived")
        .expect("collector died");
    assert_eq!(reported, slow_id);
}

#[tokio::test]
async fn unsubscribe_removes() {
    let fan = EventFan::new();
    let (id, mut rx) = fan.subscribe(None);
    fan.unsubscribe(id);
    fan.publish(&phase_event("wl-1"));
    assert!(rx.try_recv().is_err());
    assert_eq!(fan.subscriber_count(), 0);
}
