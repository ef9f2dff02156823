//! Broadcast channel for device events.
//!
//! [`EventBus`] wraps a [`tokio::sync::broadcast`] channel. Device clients
//! publish a [`DeviceEvent`] for every state change; listeners either take
//! the whole stream or a [`KindSubscription`] filtered to one
//! [`EventKind`]. Any number of listeners per kind is supported.

use tokio::sync::broadcast;

use super::device_event::{DeviceEvent, EventKind};

/// Broadcast bus for [`DeviceEvent`]s.
///
/// When the ring buffer is full, the oldest events are dropped for lagging
/// receivers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DeviceEvent>,
}

impl EventBus {
    /// Creates a new `EventBus` with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of receivers that received the event.
    /// If there are no active receivers, the event is silently dropped.
    pub fn publish(&self, event: DeviceEvent) -> usize {
        tracing::trace!(kind = ?event.kind(), telescope_id = %event.telescope_id(), "event published");
        self.sender.send(event).unwrap_or(0)
    }

    /// Creates a receiver for every future event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.sender.subscribe()
    }

    /// Creates a receiver that only yields events of `kind`.
    #[must_use]
    pub fn subscribe_kind(&self, kind: EventKind) -> KindSubscription {
        KindSubscription {
            kind,
            rx: self.sender.subscribe(),
        }
    }

    /// Returns the current number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiver filtered to a single [`EventKind`].
#[derive(Debug)]
pub struct KindSubscription {
    kind: EventKind,
    rx: broadcast::Receiver<DeviceEvent>,
}

impl KindSubscription {
    /// Waits for the next event of this subscription's kind.
    ///
    /// Lagged gaps are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`broadcast::error::RecvError::Closed`] once every publisher
    /// has been dropped.
    pub async fn recv(&mut self) -> Result<DeviceEvent, broadcast::error::RecvError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.kind() == self.kind => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, kind = ?self.kind, "event listener lagged");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the kind this subscription is filtered to.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::TelescopeId;
    use chrono::Utc;

    fn focuser(id: &str) -> DeviceEvent {
        DeviceEvent::FocuserMove {
            telescope_id: TelescopeId::from(id),
            position: Some(1200),
            timestamp: Utc::now(),
        }
    }

    fn wheel(id: &str) -> DeviceEvent {
        DeviceEvent::WheelMove {
            telescope_id: TelescopeId::from(id),
            state: Some("complete".to_string()),
            position: Some(2),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn publish_without_receivers_returns_zero() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(focuser("T1")), 0);
    }

    #[tokio::test]
    async fn kind_subscription_skips_other_kinds() {
        let bus = EventBus::new(16);
        let mut wheel_rx = bus.subscribe_kind(EventKind::WheelMove);

        bus.publish(focuser("T1"));
        bus.publish(wheel("T2"));

        let Ok(event) = wheel_rx.recv().await else {
            panic!("expected a wheel event");
        };
        assert_eq!(event.kind(), EventKind::WheelMove);
        assert_eq!(event.telescope_id().as_str(), "T2");
    }

    #[tokio::test]
    async fn multiple_listeners_per_kind() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe_kind(EventKind::FocuserMove);
        let mut b = bus.subscribe_kind(EventKind::FocuserMove);

        assert_eq!(bus.publish(focuser("T1")), 2);

        let (Ok(ea), Ok(eb)) = (a.recv().await, b.recv().await) else {
            panic!("both listeners should receive");
        };
        assert_eq!(ea.telescope_id(), eb.telescope_id());
    }

    #[test]
    fn receiver_count_tracks_subscribers() {
        let bus = EventBus::new(16);
        assert_eq!(bus.receiver_count(), 0);
        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe_kind(EventKind::Status);
        assert_eq!(bus.receiver_count(), 2);
        drop(rx1);
        assert_eq!(bus.receiver_count(), 1);
    }
}
