//! Inbound frame classification and the request-id routing table.
//!
//! Every frame the transport delivers goes through [`ResponseRouter::route_text`]
//! on the delivery thread. Nothing in here returns an error to the transport:
//! frames that cannot be matched are published on
//! [`UNRECOGNIZED_CHANNEL`](crate::protocol::UNRECOGNIZED_CHANNEL) and the
//! router moves on.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::error::MalformedFrame;
use crate::protocol::{
    stream_event, Event, RemoteErrorBody, Warning, CLOSED_CHANNEL, ERROR_CHANNEL,
    UNRECOGNIZED_CHANNEL, WARNING_CHANNEL,
};
use crate::transport::FrameHandler;

thread_local! {
    static ROUTING: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside [`ResponseRouter::route`] or
/// [`ResponseRouter::close`], i.e. running bus handlers for an inbound frame.
pub fn on_delivery_path() -> bool {
    ROUTING.with(Cell::get)
}

struct RoutingGuard {
    previous: bool,
}

impl RoutingGuard {
    fn enter() -> Self {
        Self {
            previous: ROUTING.with(|r| r.replace(true)),
        }
    }
}

impl Drop for RoutingGuard {
    fn drop(&mut self) {
        ROUTING.with(|r| r.set(self.previous));
    }
}

/// Why a route could not be registered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("request id {0} is still outstanding")]
    IdInUse(u64),
    #[error("connection closed: {0}")]
    Closed(String),
}

/// Routing table and connection state, guarded together.
#[derive(Debug)]
struct RouteTable {
    routes: HashMap<u64, String>,
    /// `Some(reason)` once the connection has closed.
    closed: Option<String>,
}

/// Decodes inbound frames and publishes them on the right bus channel.
pub struct ResponseRouter {
    bus: Arc<EventBus>,
    table: Mutex<RouteTable>,
}

impl ResponseRouter {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            table: Mutex::new(RouteTable {
                routes: HashMap::new(),
                closed: None,
            }),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Record that the reply to request `id` belongs on `channel`.
    pub fn register(&self, id: u64, channel: impl Into<String>) -> Result<(), RegisterError> {
        let mut table = self.table.lock();
        if let Some(reason) = &table.closed {
            return Err(RegisterError::Closed(reason.clone()));
        }
        if table.routes.contains_key(&id) {
            return Err(RegisterError::IdInUse(id));
        }
        table.routes.insert(id, channel.into());
        Ok(())
    }

    /// Forget the route for `id`. Returns the channel it pointed at, if any.
    pub fn retire(&self, id: u64) -> Option<String> {
        self.table.lock().routes.remove(&id)
    }

    /// Channel currently registered for `id`.
    pub fn expected_channel(&self, id: u64) -> Option<String> {
        self.table.lock().routes.get(&id).cloned()
    }

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        self.table.lock().routes.len()
    }

    pub fn is_open(&self) -> bool {
        self.table.lock().closed.is_none()
    }

    /// Decode one text frame and route it.
    pub fn route_text(&self, raw: &str) {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.route(&value),
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                self.unrecognized(raw.to_string(), MalformedFrame::InvalidJson(e.to_string()));
            }
        }
    }

    /// Classify one decoded frame and publish it.
    ///
    /// Priority: error, warning, reply to a live request id, push datum,
    /// catch-all. A live id is retired by the same lock acquisition that
    /// looks it up, so each request is resolved at most once. `null`
    /// members count as absent.
    pub fn route(&self, frame: &Value) {
        let _guard = RoutingGuard::enter();
        let Some(obj) = frame.as_object() else {
            self.unrecognized(frame.to_string(), MalformedFrame::NotAnObject);
            return;
        };

        let id = obj.get("id").filter(|v| !v.is_null());
        let take_live = || {
            id.and_then(Value::as_u64)
                .and_then(|id| self.retire(id).map(|channel| (id, channel)))
        };

        if let Some(error) = obj.get("error").filter(|v| !v.is_null()) {
            let body = RemoteErrorBody::from_value(error);
            match take_live() {
                Some((id, channel)) => {
                    debug!("Routing error for request {} to {}", id, channel);
                    self.bus.publish(&channel, &Event::Error(body));
                }
                None => {
                    warn!(
                        "Remote error {} without outstanding request: {}",
                        body.code, body.message
                    );
                    self.bus.publish(ERROR_CHANNEL, &Event::Error(body));
                }
            }
            return;
        }

        if let Some(warning) = obj.get("warning").filter(|v| !v.is_null()) {
            let warning = Warning::from_value(warning);
            debug!("Routing warning {}", warning.code);
            self.bus.publish(WARNING_CHANNEL, &Event::Warning(warning));
            return;
        }

        if let Some(result) = obj.get("result") {
            if let Some((id, channel)) = take_live() {
                debug!("Routing result for request {} to {}", id, channel);
                self.bus.publish(&channel, &Event::Result(result.clone()));
                return;
            }
        }

        if let Some(id) = id {
            // A live id without `result` or `error` leaves the request waiting.
            let live = id
                .as_u64()
                .is_some_and(|id| self.expected_channel(id).is_some());
            let reason = if live {
                warn!("Frame for request {} carries neither result nor error", id);
                MalformedFrame::UnknownShape
            } else {
                warn!("Frame references unknown request id {}", id);
                MalformedFrame::UnknownId(id.clone())
            };
            self.unrecognized(frame.to_string(), reason);
            return;
        }

        match stream_event(obj) {
            Some((channel, event)) => {
                self.bus.publish(&channel, &event);
            }
            None => self.unrecognized(frame.to_string(), MalformedFrame::UnknownShape),
        }
    }

    /// Mark the connection closed and wake everything still waiting.
    ///
    /// Only the first call has any effect.
    pub fn close(&self, reason: &str) {
        let _guard = RoutingGuard::enter();
        let drained: Vec<(u64, String)> = {
            let mut table = self.table.lock();
            if table.closed.is_some() {
                return;
            }
            table.closed = Some(reason.to_string());
            table.routes.drain().collect()
        };

        info!(
            "Connection closed ({}), failing {} outstanding request(s)",
            reason,
            drained.len()
        );

        let event = Event::Closed {
            reason: reason.to_string(),
        };
        for (_, channel) in &drained {
            self.bus.publish(channel, &event);
        }
        self.bus.publish(CLOSED_CHANNEL, &event);
        self.bus.clear();
    }

    fn unrecognized(&self, frame: String, reason: MalformedFrame) {
        self.bus
            .publish(UNRECOGNIZED_CHANNEL, &Event::Unrecognized { frame, reason });
    }
}

impl FrameHandler for ResponseRouter {
    fn on_frame(&self, text: &str) {
        self.route_text(text);
    }

    fn on_close(&self, reason: &str) {
        self.close(reason);
    }
}
