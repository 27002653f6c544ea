//! Hand-off from the driver's callback thread to the session owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::driver::{NotifyEvents, NotifyTarget};

/// Work posted to the session owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notification {
    MessagesAvailable,
    StatusChanged,
    BusOnOff,
    DeviceRemoved,
    DrainOutbound,
}

/// Runs on the driver thread. Posting is a non-blocking send; receive-class
/// events coalesce into one request per drain cycle.
struct NotifySink {
    messages_pending: AtomicBool,
    tx: UnboundedSender<Notification>,
}

impl NotifySink {
    fn post(&self, notification: Notification) {
        // the receiver is gone once the session is dropped
        let _ = self.tx.send(notification);
    }
}

impl NotifyTarget for NotifySink {
    fn notify(&self, events: NotifyEvents) {
        if events.intersects(NotifyEvents::RX | NotifyEvents::ERROR)
            && !self.messages_pending.swap(true, Ordering::AcqRel)
        {
            self.post(Notification::MessagesAvailable);
        }
        if events.contains(NotifyEvents::STATUS) {
            self.post(Notification::StatusChanged);
        }
        if events.contains(NotifyEvents::BUSONOFF) {
            self.post(Notification::BusOnOff);
        }
        if events.contains(NotifyEvents::REMOVED) {
            self.post(Notification::DeviceRemoved);
        }
    }
}

pub(crate) struct NotificationBridge {
    sink: Arc<NotifySink>,
    rx: UnboundedReceiver<Notification>,
}

impl NotificationBridge {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            sink: Arc::new(NotifySink {
                messages_pending: AtomicBool::new(false),
                tx,
            }),
            rx,
        }
    }

    /// The callback target handed to the driver.
    pub(crate) fn target(&self) -> Arc<dyn NotifyTarget> {
        Arc::<NotifySink>::clone(&self.sink)
    }

    /// Posts from the owner side, e.g. an outbound drain request.
    pub(crate) fn post(&self, notification: Notification) {
        self.sink.post(notification);
    }

    /// Re-arms the receive trigger. Called before reading the driver queue
    /// so that a message arriving mid-drain posts a new request.
    pub(crate) fn begin_drain(&self) {
        self.sink.messages_pending.store(false, Ordering::Release);
    }

    pub(crate) fn try_next(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    pub(crate) async fn next(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::{Notification, NotificationBridge};
    use crate::driver::NotifyEvents;

    #[test]
    fn test_receive_events_coalesce() {
        let mut bridge = NotificationBridge::new();
        let target = bridge.target();
        target.notify(NotifyEvents::RX);
        target.notify(NotifyEvents::RX);
        target.notify(NotifyEvents::ERROR);
        assert_eq!(bridge.try_next(), Some(Notification::MessagesAvailable));
        assert_eq!(bridge.try_next(), None);

        bridge.begin_drain();
        target.notify(NotifyEvents::RX);
        assert_eq!(bridge.try_next(), Some(Notification::MessagesAvailable));
        assert_eq!(bridge.try_next(), None);
    }

    #[test]
    fn test_low_rate_events_not_coalesced() {
        let mut bridge = NotificationBridge::new();
        let target = bridge.target();
        target.notify(NotifyEvents::STATUS);
        target.notify(NotifyEvents::STATUS);
        target.notify(NotifyEvents::BUSONOFF | NotifyEvents::REMOVED);
        let posted: Vec<_> = std::iter::from_fn(|| bridge.try_next()).collect();
        assert_eq!(
            posted,
            vec![
                Notification::StatusChanged,
                Notification::StatusChanged,
                Notification::BusOnOff,
                Notification::DeviceRemoved,
            ]
        );
    }

    #[tokio::test]
    async fn test_notify_from_foreign_thread() {
        let mut bridge = NotificationBridge::new();
        let target = bridge.target();
        thread::spawn(move || {
            for _ in 0..100 {
                target.notify(NotifyEvents::RX);
            }
            target.notify(NotifyEvents::STATUS);
        })
        .join()
        .unwrap();
        assert_eq!(bridge.next().await, Some(Notification::MessagesAvailable));
        assert_eq!(bridge.next().await, Some(Notification::StatusChanged));
        assert_eq!(bridge.try_next(), None);
    }

    #[test]
    fn test_post_after_receiver_dropped() {
        let bridge = NotificationBridge::new();
        let target = bridge.target();
        drop(bridge);
        target.notify(NotifyEvents::RX | NotifyEvents::REMOVED);
    }
}
