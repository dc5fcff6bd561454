//! Named-channel publish/subscribe registry.
//!
//! Handlers run synchronously on the publishing thread, in subscription
//! order. The registry lock is released before any handler runs, so a handler
//! may subscribe or unsubscribe (including itself) without deadlocking.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::protocol::Event;

/// Callback invoked for every event published on a subscribed channel.
pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Receives handler failures instead of letting them unwind into the publisher.
pub type DiagnosticSink = Arc<dyn Fn(&HandlerFailure) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to remove that registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A handler that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub channel: String,
    pub subscription: SubscriptionId,
    pub message: String,
    pub panicked: bool,
}

struct Subscriber {
    id: SubscriptionId,
    handler: Handler,
}

/// Connection-scoped event bus.
pub struct EventBus {
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    diagnostics: DiagnosticSink,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus whose handler failures are logged via `tracing`.
    pub fn new() -> Self {
        Self::with_diagnostics(Arc::new(|failure: &HandlerFailure| {
            error!(
                channel = %failure.channel,
                panicked = failure.panicked,
                "Event handler failed: {}",
                failure.message
            );
        }))
    }

    /// Create a bus that reports handler failures to `sink`.
    pub fn with_diagnostics(sink: DiagnosticSink) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            diagnostics: sink,
        }
    }

    /// Register `handler` on `channel`.
    ///
    /// Registering the same closure twice yields two independent
    /// subscriptions, each invoked once per publish.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(channel, Arc::new(handler))
    }

    /// Register an already shared handler.
    pub fn subscribe_handler(&self, channel: &str, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber { id, handler });
        trace!("Subscribed {:?} to {}", id, channel);
        id
    }

    /// Remove one registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut channels = self.channels.lock();
        let Some(subscribers) = channels.get_mut(channel) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Deliver `event` to every handler currently on `channel`.
    ///
    /// Publishing to a channel nobody listens on is a no-op. Returns the
    /// number of handlers invoked.
    pub fn publish(&self, channel: &str, event: &Event) -> usize {
        let handlers: Vec<(SubscriptionId, Handler)> = match self.channels.lock().get(channel) {
            Some(subscribers) => subscribers
                .iter()
                .map(|s| (s.id, Arc::clone(&s.handler)))
                .collect(),
            None => return 0,
        };

        for (id, handler) in &handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => HandlerFailure {
                    channel: channel.to_string(),
                    subscription: *id,
                    message: format!("{e:#}"),
                    panicked: false,
                },
                Err(payload) => HandlerFailure {
                    channel: channel.to_string(),
                    subscription: *id,
                    message: panic_message(payload.as_ref()),
                    panicked: true,
                },
            };
            self.report(&failure);
        }

        handlers.len()
    }

    /// Hand `failure` to the sink. A sink that panics is logged and ignored.
    fn report(&self, failure: &HandlerFailure) {
        let sink = &self.diagnostics;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink(failure))) {
            error!(
                channel = %failure.channel,
                "Diagnostic sink panicked: {} (reporting: {})",
                panic_message(payload.as_ref()),
                failure.message
            );
        }
    }

    /// Number of live registrations on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, Vec::len)
    }

    /// Number of live registrations across all channels.
    pub fn total_subscriptions(&self) -> usize {
        self.channels.lock().values().map(Vec::len).sum()
    }

    /// Drop every registration.
    ///
    /// Handlers are dropped after the lock is released.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.channels.lock());
        drop(drained);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
