// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn terminated(id: &str) -> Event {
    Event::SessionTerminated { session_id: id.to_owned() }
}

#[tokio::test]
async fn delivers_to_matching_subscribers_only() -> anyhow::Result<()> {
    let hub = EventHub::new(8);
    let mut started = hub.subscribe(EventKind::SessionStarted);
    let mut ended = hub.subscribe(EventKind::SessionTerminated);

    hub.emit(Event::SessionStarted { session_id: "s-1".to_owned(), computer: "laptop".to_owned() });

    let event = started.recv().await?;
    assert!(matches!(event, Event::SessionStarted { ref session_id, .. } if session_id == "s-1"));
    assert!(ended.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn emission_order_preserved_per_subscriber() -> anyhow::Result<()> {
    let hub = EventHub::new(8);
    let mut rx = hub.subscribe(EventKind::SessionTerminated);

    for i in 0..5 {
        hub.emit(terminated(&format!("s-{i}")));
    }
    for i in 0..5 {
        let event = rx.recv().await?;
        assert!(
            matches!(event, Event::SessionTerminated { ref session_id } if *session_id == format!("s-{i}"))
        );
    }
    Ok(())
}

#[tokio::test]
async fn emit_without_subscribers_is_silent() {
    let hub = EventHub::new(8);
    // Must not fail or block.
    hub.emit(terminated("nobody-listening"));
    assert_eq!(hub.subscriber_count(EventKind::SessionTerminated), 0);
}

#[tokio::test]
async fn fan_out_reaches_every_subscriber() -> anyhow::Result<()> {
    let hub = EventHub::new(8);
    let mut a = hub.subscribe(EventKind::PeerLost);
    let mut b = hub.subscribe(EventKind::PeerLost);

    hub.emit(Event::PeerLost { computer: "workstation".to_owned() });

    for rx in [&mut a, &mut b] {
        let event = rx.recv().await?;
        assert!(matches!(event, Event::PeerLost { ref computer } if computer == "workstation"));
    }
    Ok(())
}

#[test]
fn every_kind_has_a_channel_and_a_name() {
    let hub = EventHub::default();
    for kind in EventKind::ALL {
        assert_eq!(hub.subscriber_count(*kind), 0);
        assert!(!kind.as_str().is_empty());
    }
}

#[test]
fn event_kind_mapping_is_consistent() {
    let update = Event::OutputUpdated(OutputUpdate {
        session_id: "s-1".to_owned(),
        sequence: 1,
        bytes: Bytes::from_static(b"hi"),
        summary: "hi".to_owned(),
        cursor: 2,
    });
    assert_eq!(update.kind(), EventKind::OutputUpdated);
    assert_eq!(update.kind().as_str(), "output_updated");
}
