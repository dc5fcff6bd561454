//! Blocking rendezvous on a bus channel.
//!
//! Each waiter gets its own one-slot channel, so any number of threads can
//! wait at once as long as they wait on different channels.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::bus::{EventBus, SubscriptionId};
use crate::error::CortexError;
use crate::protocol::Event;

/// Turns the next event on a channel into a blocking return value.
#[derive(Clone)]
pub struct CorrelationGate {
    bus: Arc<EventBus>,
}

impl CorrelationGate {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Subscribe a one-shot listener on `channel` without blocking.
    ///
    /// Arm before sending the request so a fast reply cannot be published
    /// while nobody is listening.
    pub fn arm(&self, channel: &str) -> PendingReply {
        let (tx, rx) = mpsc::sync_channel::<Event>(1);
        let slot: Arc<Mutex<Option<SyncSender<Event>>>> = Arc::new(Mutex::new(Some(tx)));

        // The handler owns the sender; clearing the bus disconnects `rx`.
        let weak_slot = Arc::downgrade(&slot);
        let subscription = self.bus.subscribe(channel, move |event| {
            // One-shot: the sender is taken on first delivery, or by disarm.
            if let Some(tx) = slot.lock().take() {
                let _ = tx.try_send(event.clone());
            }
            Ok(())
        });

        PendingReply {
            bus: Arc::clone(&self.bus),
            channel: channel.to_string(),
            subscription: Some(subscription),
            slot: weak_slot,
            rx,
        }
    }

    /// Block until the next event on `channel`, or fail after `timeout`.
    pub fn await_on(&self, channel: &str, timeout: Duration) -> Result<Event, CortexError> {
        self.arm(channel).wait(timeout)
    }
}

/// An armed, not yet resolved wait. Dropping it removes the subscription.
pub struct PendingReply {
    bus: Arc<EventBus>,
    channel: String,
    subscription: Option<SubscriptionId>,
    slot: Weak<Mutex<Option<SyncSender<Event>>>>,
    rx: Receiver<Event>,
}

impl PendingReply {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Block for up to `timeout` while staying subscribed.
    ///
    /// A timed-out `recv` can be retried; the event is still delivered here
    /// if it is published later.
    pub fn recv(&self, timeout: Duration) -> Result<Event, CortexError> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Err(CortexError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(listener_dropped()),
        }
    }

    /// Block with no deadline, for an event whose publication is already
    /// under way (the router has claimed it but not yet delivered it).
    pub fn recv_claimed(&self) -> Result<Event, CortexError> {
        self.rx.recv().map_err(|_| listener_dropped())
    }

    /// Block the calling thread until the event arrives, then disarm.
    ///
    /// Fails with `Timeout` when nothing arrives in time, and with
    /// `ConnectionClosed` if the bus dropped the listener first. An event
    /// delivered between the deadline and the disarm is still returned.
    pub fn wait(mut self, timeout: Duration) -> Result<Event, CortexError> {
        let outcome = self.recv(timeout);
        self.disarm();
        let outcome = match outcome {
            Err(CortexError::Timeout(t)) => {
                self.rx.try_recv().map_err(|_| CortexError::Timeout(t))
            }
            other => other,
        };
        if let Ok(event) = &outcome {
            trace!("Gate on {} resolved with {}", self.channel, event.kind());
        }
        outcome
    }

    /// Remove the subscription and close the slot. Safe to call more than once.
    ///
    /// After this returns, anything buffered in `rx` is final.
    pub fn disarm(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(&self.channel, id);
        }
        if let Some(slot) = self.slot.upgrade() {
            slot.lock().take();
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn listener_dropped() -> CortexError {
    CortexError::ConnectionClosed("listener dropped before a reply arrived".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    #[test]
    fn test_await_on_receives_published_event() {
        let bus = Arc::new(EventBus::new());
        let gate = CorrelationGate::new(Arc::clone(&bus));

        let pending = gate.arm("ping_done#1");
        assert_eq!(bus.subscriber_count("ping_done#1"), 1);

        let publisher = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.publish("ping_done#1", &Event::Result(json!("pong"))))
        };

        let event = pending.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(event, Event::Result(json!("pong")));
        assert_eq!(publisher.join().unwrap(), 1);
        assert_eq!(bus.total_subscriptions(), 0);
    }

    #[test]
    fn test_timeout_leaves_no_subscription() {
        let bus = Arc::new(EventBus::new());
        let gate = CorrelationGate::new(Arc::clone(&bus));

        let err = gate
            .await_on("never_done#1", Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, CortexError::Timeout(d) if d == Duration::from_millis(20)));
        assert_eq!(bus.total_subscriptions(), 0);
    }

    #[test]
    fn test_only_first_event_is_kept() {
        let bus = Arc::new(EventBus::new());
        let gate = CorrelationGate::new(Arc::clone(&bus));

        let pending = gate.arm("ch");
        bus.publish("ch", &Event::Result(json!(1)));
        bus.publish("ch", &Event::Result(json!(2)));

        assert_eq!(
            pending.wait(Duration::from_secs(1)).unwrap(),
            Event::Result(json!(1))
        );
    }

    #[test]
    fn test_cleared_bus_reports_connection_closed() {
        let bus = Arc::new(EventBus::new());
        let gate = CorrelationGate::new(Arc::clone(&bus));

        let pending = gate.arm("ch");
        bus.clear();

        let err = pending.wait(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, CortexError::ConnectionClosed(_)));
    }

    #[test]
    fn test_concurrent_waiters_on_distinct_channels() {
        let bus = Arc::new(EventBus::new());
        let gate = CorrelationGate::new(Arc::clone(&bus));

        let waiters: Vec<_> = (0..8)
            .map(|i| {
                let pending = gate.arm(&format!("call_done#{i}"));
                thread::spawn(move || pending.wait(Duration::from_secs(5)))
            })
            .collect();

        for i in (0..8).rev() {
            bus.publish(&format!("call_done#{i}"), &Event::Result(json!(i)));
        }

        for (i, waiter) in waiters.into_iter().enumerate() {
            let event = waiter.join().unwrap().unwrap();
            assert_eq!(event, Event::Result(json!(i)));
        }
        assert_eq!(bus.total_subscriptions(), 0);
    }

    #[test]
    fn test_recv_timeout_keeps_listening() {
        let bus = Arc::new(EventBus::new());
        let gate = CorrelationGate::new(Arc::clone(&bus));
        let pending = gate.arm("late_done#1");

        let err = pending.recv(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CortexError::Timeout(_)));
        assert_eq!(bus.subscriber_count("late_done#1"), 1);

        bus.publish("late_done#1", &Event::Result(json!("late")));
        assert_eq!(pending.recv_claimed().unwrap(), Event::Result(json!("late")));
    }

    #[test]
    fn test_disarm_then_publish_is_dropped() {
        let bus = Arc::new(EventBus::new());
        let gate = CorrelationGate::new(Arc::clone(&bus));
        let mut pending = gate.arm("ch");

        bus.publish("ch", &Event::Result(json!(1)));
        pending.disarm();
        assert_eq!(bus.publish("ch", &Event::Result(json!(2))), 0);

        // Delivered before disarm, so still returned even with a zero window.
        assert_eq!(
            pending.wait(Duration::ZERO).unwrap(),
            Event::Result(json!(1))
        );
    }

    #[test]
    fn test_drop_disarms() {
        let bus = Arc::new(EventBus::new());
        let gate = CorrelationGate::new(Arc::clone(&bus));
        let pending = gate.arm("ch");
        assert_eq!(pending.channel(), "ch");
        drop(pending);
        assert_eq!(bus.subscriber_count("ch"), 0);
    }
}
