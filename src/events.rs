//! Finder events and the event bus.
//!
//! Producers (the scan orchestrator and the command queues) publish
//! [`FinderEvent`]s to an [`EventBus`]. Consumers subscribe with a unique key
//! and the set of [`EventKind`]s they care about. Every subscriber gets its own
//! queue and dispatch task, so a slow callback never stalls the radio
//! notification path or other subscribers.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::device::{FinderDevice, Proximity};
use crate::error::{Error, Result};

/// Kind of a [`FinderEvent`], used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// A link was established.
    Connected,
    /// A command found the link already up.
    AlreadyConnected,
    /// Connecting failed or the link dropped unexpectedly.
    ConnectionError,
    /// A link was re-established after an unexpected drop.
    Reconnected,
    /// A link was closed.
    Disconnected,
    /// The device's button was pressed.
    ButtonPressed,
    /// The device was sighted.
    Detected,
    /// The device came into range.
    Entered,
    /// The device left range.
    Exited,
    /// The device's data changed.
    Updated,
    /// A GATT operation timed out.
    TimedOut,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [EventKind; 11] = [
        Self::Connected,
        Self::AlreadyConnected,
        Self::ConnectionError,
        Self::Reconnected,
        Self::Disconnected,
        Self::ButtonPressed,
        Self::Detected,
        Self::Entered,
        Self::Exited,
        Self::Updated,
        Self::TimedOut,
    ];
}

/// Phase in which an operation timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimeoutKind {
    /// During a characteristic read.
    GetOperation,
    /// During a characteristic write.
    SetOperation,
}

/// Type of a button press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ButtonPress {
    /// Single click.
    Single,
    /// Double click.
    Double,
    /// Press and hold.
    Long,
}

impl ButtonPress {
    /// Decode a button characteristic value.
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Single),
            2 => Some(Self::Double),
            3 => Some(Self::Long),
            _ => None,
        }
    }
}

/// Event reported about a finder device.
#[derive(Debug, Clone)]
pub enum FinderEvent {
    /// A link was established.
    Connected {
        /// The device.
        device: Arc<FinderDevice>,
    },
    /// A command found the link already up.
    AlreadyConnected {
        /// The device.
        device: Arc<FinderDevice>,
    },
    /// Connecting failed or the link dropped unexpectedly.
    ConnectionError {
        /// The device.
        device: Arc<FinderDevice>,
        /// What went wrong.
        error: Error,
    },
    /// A link was re-established after an unexpected drop.
    Reconnected {
        /// The device.
        device: Arc<FinderDevice>,
    },
    /// A link was closed.
    Disconnected {
        /// The device.
        device: Arc<FinderDevice>,
    },
    /// The device's button was pressed.
    ButtonPressed {
        /// The device.
        device: Arc<FinderDevice>,
        /// Kind of press.
        press: ButtonPress,
    },
    /// The device was sighted.
    Detected {
        /// The device.
        device: Arc<FinderDevice>,
        /// Advertised power level.
        power_level: u8,
        /// Signal strength of the sighting.
        rssi: i16,
        /// Proximity bucket of the sighting.
        proximity: Proximity,
    },
    /// The device came into range.
    Entered {
        /// The device.
        device: Arc<FinderDevice>,
    },
    /// The device left range.
    Exited {
        /// The device.
        device: Arc<FinderDevice>,
    },
    /// The device's data changed.
    Updated {
        /// The device.
        device: Arc<FinderDevice>,
    },
    /// A GATT operation timed out.
    TimedOut {
        /// The device.
        device: Arc<FinderDevice>,
        /// Phase that timed out.
        kind: TimeoutKind,
    },
}

impl FinderEvent {
    /// The device the event is about.
    pub fn device(&self) -> &Arc<FinderDevice> {
        match self {
            Self::Connected { device }
            | Self::AlreadyConnected { device }
            | Self::ConnectionError { device, .. }
            | Self::Reconnected { device }
            | Self::Disconnected { device }
            | Self::ButtonPressed { device, .. }
            | Self::Detected { device, .. }
            | Self::Entered { device }
            | Self::Exited { device }
            | Self::Updated { device }
            | Self::TimedOut { device, .. } => device,
        }
    }

    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::AlreadyConnected { .. } => EventKind::AlreadyConnected,
            Self::ConnectionError { .. } => EventKind::ConnectionError,
            Self::Reconnected { .. } => EventKind::Reconnected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::ButtonPressed { .. } => EventKind::ButtonPressed,
            Self::Detected { .. } => EventKind::Detected,
            Self::Entered { .. } => EventKind::Entered,
            Self::Exited { .. } => EventKind::Exited,
            Self::Updated { .. } => EventKind::Updated,
            Self::TimedOut { .. } => EventKind::TimedOut,
        }
    }
}

/// Handle for an event subscription.
///
/// Dropping the handle removes the subscription.
pub struct SubscriptionHandle {
    key: String,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    fn new(key: String, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            key,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Remove this subscription.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Key the subscription was registered under.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .finish()
    }
}

/// One registered subscriber.
struct Subscriber {
    /// Unique per subscription, even when a key is reused.
    id: u64,
    key: String,
    kinds: HashSet<EventKind>,
    /// Cleared on unsubscribe; checked right before every callback.
    active: Arc<AtomicBool>,
    queue: mpsc::UnboundedSender<FinderEvent>,
}

struct BusInner {
    /// Subscribers in subscription order.
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    /// Unfiltered stream of every published event.
    stream_tx: broadcast::Sender<FinderEvent>,
    /// Source of subscriber ids.
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, matches: impl Fn(&Subscriber) -> bool) -> bool {
        let mut subscribers = self.subscribers.write();
        match subscribers.iter().position(|s| matches(s)) {
            Some(index) => {
                let subscriber = subscribers.remove(index);
                subscriber.active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// In-process publish/subscribe hub for [`FinderEvent`]s.
///
/// Cloning is cheap and every clone refers to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        let (stream_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                stream_tx,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe `callback` to the given event kinds under a unique `key`.
    ///
    /// The callback runs on a dedicated task of the current tokio runtime,
    /// receiving events in publish order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `key` is already subscribed and
    /// [`Error::Internal`] when called outside a tokio runtime.
    pub fn subscribe<F>(
        &self,
        kinds: &[EventKind],
        key: impl Into<String>,
        callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(FinderEvent) + Send + Sync + 'static,
    {
        let key = key.into();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("event subscription needs a runtime: {}", e)))?;

        let (queue, mut rx) = mpsc::unbounded_channel::<FinderEvent>();
        let active = Arc::new(AtomicBool::new(true));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut subscribers = self.inner.subscribers.write();
            if subscribers.iter().any(|s| s.key == key) {
                return Err(Error::InvalidParameter {
                    name: "key".to_string(),
                    value: key,
                });
            }
            subscribers.push(Arc::new(Subscriber {
                id,
                key: key.clone(),
                kinds: kinds.iter().copied().collect(),
                active: active.clone(),
                queue,
            }));
        }

        debug!("Subscribed {} to {:?}", key, kinds);

        let dispatch_key = key.clone();
        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                callback(event);
            }
            trace!("Dispatch task for {} ended", dispatch_key);
        });

        // The handle only ever removes its own subscription
        let inner = Arc::downgrade(&self.inner);
        Ok(SubscriptionHandle::new(key, move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove(|s| s.id == id);
            }
        }))
    }

    /// Remove the subscription registered under `key`.
    ///
    /// Returns `false` if no such subscription exists.
    pub fn unsubscribe(&self, key: &str) -> bool {
        let removed = self.inner.remove(|s| s.key == key);
        if removed {
            debug!("Unsubscribed {}", key);
        }
        removed
    }

    /// Deliver `event` to every subscriber interested in its kind.
    pub fn publish(&self, event: FinderEvent) {
        let kind = event.kind();
        trace!("Publishing {:?} for {}", kind, event.device().id());

        let subscribers: Vec<Arc<Subscriber>> = self.inner.subscribers.read().clone();

        for subscriber in subscribers
            .iter()
            .filter(|s| s.kinds.contains(&kind))
        {
            if !subscriber.active.load(Ordering::SeqCst) {
                continue;
            }
            if subscriber.queue.send(event.clone()).is_err() {
                warn!("Subscriber {} is no longer receiving", subscriber.key);
            }
        }

        let _ = self.inner.stream_tx.send(event);
    }

    /// Receive every published event, unfiltered.
    pub fn stream(&self) -> broadcast::Receiver<FinderEvent> {
        self.inner.stream_tx.subscribe()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceFamily;
    use std::time::Duration;

    fn device() -> Arc<FinderDevice> {
        Arc::new(FinderDevice::new(DeviceFamily::Xy4, None))
    }

    fn collector(
        bus: &EventBus,
        kinds: &[EventKind],
        key: &str,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<EventKind>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = bus
            .subscribe(kinds, key, move |event| {
                let _ = tx.send(event.kind());
            })
            .unwrap();
        (handle, rx)
    }

    #[test]
    fn test_event_kind_and_device() {
        let device = device();
        let event = FinderEvent::TimedOut {
            device: device.clone(),
            kind: TimeoutKind::GetOperation,
        };
        assert_eq!(event.kind(), EventKind::TimedOut);
        assert_eq!(event.device().id(), device.id());
    }

    #[test]
    fn test_button_press_from_raw() {
        assert_eq!(ButtonPress::from_raw(1), Some(ButtonPress::Single));
        assert_eq!(ButtonPress::from_raw(3), Some(ButtonPress::Long));
        assert_eq!(ButtonPress::from_raw(0), None);
    }

    #[test]
    fn test_subscribe_outside_runtime_fails() {
        let bus = EventBus::new();
        let result = bus.subscribe(&EventKind::ALL, "no-runtime", |_| {});
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_publish_filters_by_kind() {
        let bus = EventBus::new();
        let (_entered, mut entered_rx) = collector(&bus, &[EventKind::Entered], "entered");
        let (_all, mut all_rx) = collector(&bus, &EventKind::ALL, "all");

        let device = device();
        bus.publish(FinderEvent::Entered {
            device: device.clone(),
        });
        bus.publish(FinderEvent::Exited { device });

        assert_eq!(entered_rx.recv().await, Some(EventKind::Entered));
        assert_eq!(all_rx.recv().await, Some(EventKind::Entered));
        assert_eq!(all_rx.recv().await, Some(EventKind::Exited));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(entered_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let bus = EventBus::new();
        let (_handle, _rx) = collector(&bus, &[EventKind::Detected], "dup");
        let second = bus.subscribe(&[EventKind::Detected], "dup", |_| {});
        assert!(matches!(second, Err(Error::InvalidParameter { .. })));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (handle, mut rx) = collector(&bus, &EventKind::ALL, "gone");

        assert!(bus.unsubscribe("gone"));
        assert!(!bus.unsubscribe("gone"));
        bus.publish(FinderEvent::Updated { device: device() });

        // The dispatch task ends once the subscriber is removed
        assert_eq!(rx.recv().await, None);
        drop(handle);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_unsubscribes() {
        let bus = EventBus::new();
        let (handle, _rx) = collector(&bus, &EventKind::ALL, "scoped");
        assert_eq!(bus.subscriber_count(), 1);
        drop(handle);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_receives_everything() {
        let bus = EventBus::new();
        let mut stream = bus.stream();
        bus.publish(FinderEvent::Detected {
            device: device(),
            power_level: 4,
            rssi: -60,
            proximity: Proximity::Near,
        });
        let event = stream.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::Detected);
    }
}
