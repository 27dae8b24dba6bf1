use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use xyfinder_rust_ble::{DeviceFamily, EventBus, EventKind, FinderDevice, FinderEvent};

fn device() -> Arc<FinderDevice> {
    Arc::new(FinderDevice::new(DeviceFamily::Xy3, None))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_subscriber_does_not_block_others() {
    let bus = EventBus::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _slow = bus
        .subscribe(&EventKind::ALL, "slow", |_| {
            std::thread::sleep(Duration::from_millis(50));
        })
        .unwrap();
    let _fast = bus
        .subscribe(&EventKind::ALL, "fast", move |event| {
            let _ = tx.send(event.kind());
        })
        .unwrap();

    let device = device();
    for _ in 0..5 {
        bus.publish(FinderEvent::Updated {
            device: device.clone(),
        });
    }

    // publish returned without waiting on the slow callback
    for _ in 0..5 {
        assert_eq!(rx.recv().await, Some(EventKind::Updated));
    }
}

#[tokio::test]
async fn test_events_arrive_in_publish_order() {
    let bus = EventBus::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = bus
        .subscribe(&EventKind::ALL, "ordered", move |event| {
            let _ = tx.send(event.kind());
        })
        .unwrap();

    let device = device();
    bus.publish(FinderEvent::Connected {
        device: device.clone(),
    });
    bus.publish(FinderEvent::Updated {
        device: device.clone(),
    });
    bus.publish(FinderEvent::Disconnected { device });

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(rx.recv().await.unwrap());
    }
    assert_eq!(
        received,
        vec![
            EventKind::Connected,
            EventKind::Updated,
            EventKind::Disconnected
        ]
    );
}

#[tokio::test]
async fn test_subscriber_added_later_gets_later_events() {
    let bus = EventBus::new();
    let device = device();
    bus.publish(FinderEvent::Entered {
        device: device.clone(),
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _late = bus
        .subscribe(&[EventKind::Entered, EventKind::Exited], "late", move |event| {
            let _ = tx.send(event.kind());
        })
        .unwrap();

    bus.publish(FinderEvent::Exited { device });
    assert_eq!(rx.recv().await, Some(EventKind::Exited));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribe_from_inside_callback() {
    let bus = EventBus::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let inner_bus = bus.clone();
    let _handle = bus
        .subscribe(&EventKind::ALL, "once", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            inner_bus.unsubscribe("once");
        })
        .unwrap();

    let device = device();
    for _ in 0..3 {
        bus.publish(FinderEvent::Updated {
            device: device.clone(),
        });
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Removal is observed before the queued events are dispatched
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bus.subscriber_count(), 0);
}

#[tokio::test]
async fn test_key_can_be_reused_after_unsubscribe() {
    let bus = EventBus::new();
    let handle = assert_ok!(bus.subscribe(&EventKind::ALL, "reuse", |_| {}));
    assert_eq!(handle.key(), "reuse");
    assert_err!(bus.subscribe(&[EventKind::Updated], "reuse", |_| {}));
    handle.unregister();

    assert_ok!(bus.subscribe(&EventKind::ALL, "reuse", |_| {}));
}

#[tokio::test]
async fn test_stale_handle_keeps_new_subscriber() {
    let bus = EventBus::new();
    let old = assert_ok!(bus.subscribe(&EventKind::ALL, "shared", |_| {}));
    assert!(bus.unsubscribe("shared"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _new = assert_ok!(bus.subscribe(&EventKind::ALL, "shared", move |event| {
        let _ = tx.send(event.kind());
    }));

    // Dropping the first handle must not touch the new owner of the key
    drop(old);
    assert_eq!(bus.subscriber_count(), 1);

    bus.publish(FinderEvent::Updated { device: device() });
    assert_eq!(rx.recv().await, Some(EventKind::Updated));
}
