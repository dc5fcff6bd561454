//! Blocking call adapter over the event bus.
//!
//! `Client` is shared between threads: any number of callers may be blocked in
//! [`Client::call`] at once, each waiting on its own id-scoped channel, while
//! the transport's delivery thread routes replies to them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::{EventBus, SubscriptionId};
use crate::config::ClientConfig;
use crate::error::{CortexError, TransportError};
use crate::gate::{CorrelationGate, PendingReply};
use crate::protocol::{
    response_channel, stream_channel, Event, JsonRpcRequest, Warning, WARNING_CHANNEL,
};
use crate::router::{self, RegisterError, ResponseRouter};
use crate::transport::{self, FrameHandler, Transport};

/// Connection-scoped JSON-RPC client.
///
/// # Example
///
/// ```ignore
/// use cortex_link::{Client, ClientConfig};
/// use serde_json::json;
///
/// let client = Client::connect(ClientConfig::from_env())?;
/// let info = client.call("getCortexInfo", json!({}))?;
/// ```
pub struct Client {
    bus: Arc<EventBus>,
    router: Arc<ResponseRouter>,
    gate: CorrelationGate,
    transport: Arc<dyn Transport>,
    /// Monotonically increasing request ID counter.
    next_id: AtomicU64,
    config: ClientConfig,
}

impl Client {
    /// Connect to `config.endpoint`.
    pub fn connect(config: ClientConfig) -> Result<Self, CortexError> {
        let endpoint = config.endpoint.clone();
        let connect_timeout = config.connect_timeout;
        Self::open(config, move |handler| {
            transport::connect(&endpoint, handler, connect_timeout)
        })
    }

    /// Build a client on a transport produced by `connector`.
    ///
    /// The connector receives the frame handler the transport must deliver
    /// inbound frames to.
    pub fn open<F>(config: ClientConfig, connector: F) -> Result<Self, CortexError>
    where
        F: FnOnce(Arc<dyn FrameHandler>) -> Result<Arc<dyn Transport>, TransportError>,
    {
        Self::open_with_bus(config, Arc::new(EventBus::new()), connector)
    }

    /// Like [`open`](Self::open) with a caller-supplied bus (for a custom
    /// diagnostic sink).
    pub fn open_with_bus<F>(
        config: ClientConfig,
        bus: Arc<EventBus>,
        connector: F,
    ) -> Result<Self, CortexError>
    where
        F: FnOnce(Arc<dyn FrameHandler>) -> Result<Arc<dyn Transport>, TransportError>,
    {
        let router = Arc::new(ResponseRouter::new(Arc::clone(&bus)));
        let handler: Arc<dyn FrameHandler> = router.clone();
        let transport = connector(handler)?;

        Ok(Self {
            gate: CorrelationGate::new(Arc::clone(&bus)),
            bus,
            router,
            transport,
            next_id: AtomicU64::new(1),
            config,
        })
    }

    /// Call `method` and wait up to the configured request timeout.
    pub fn call(&self, method: &str, params: Value) -> Result<Value, CortexError> {
        self.call_with_timeout(method, params, self.config.request_timeout)
    }

    /// Send `{id, method, params}` and block until the matching reply.
    ///
    /// # Errors
    ///
    /// - `Remote` if the service answered with an error object
    /// - `Timeout` if nothing arrived within `timeout`
    /// - `ConnectionClosed` if the connection ended first
    /// - `Transport` if the request could not be sent, or if this runs
    ///   inside a bus handler (`OnDeliveryThread`)
    pub fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CortexError> {
        let params = match params {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        if router::on_delivery_path() {
            return Err(TransportError::OnDeliveryThread.into());
        }

        let (id, pending) = self.register_next(method)?;
        let request = JsonRpcRequest::new(method, params, id);

        let text = match serde_json::to_string(&request) {
            Ok(text) => text,
            Err(e) => {
                self.router.retire(id);
                return Err(TransportError::Encode(e.to_string()).into());
            }
        };

        debug!("Sending {} (id {})", method, id);
        if let Err(e) = self.transport.send(&text) {
            self.router.retire(id);
            return Err(e.into());
        }

        let outcome = match pending.recv(timeout) {
            // Retiring fails only if the router took the id first, in which
            // case the reply is already being published to us.
            Err(CortexError::Timeout(_)) if self.router.retire(id).is_none() => {
                debug!("{} (id {}) answered at the deadline", method, id);
                pending.recv_claimed()
            }
            other => other,
        };
        drop(pending);

        match outcome {
            Ok(event) => reply_from_event(event),
            Err(e) => {
                self.router.retire(id);
                warn!("{} (id {}) gave up: {}", method, id, e);
                Err(e)
            }
        }
    }

    /// Allocate an id, arm its gate and register its route.
    ///
    /// The gate is armed before the route exists so a reply can never be
    /// published to an empty channel. Ids still in the table are skipped.
    fn register_next(&self, method: &str) -> Result<(u64, PendingReply), CortexError> {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            let channel = response_channel(method, id);
            let pending = self.gate.arm(&channel);
            match self.router.register(id, channel) {
                Ok(()) => return Ok((id, pending)),
                Err(RegisterError::IdInUse(id)) => {
                    debug!("Request id {} still outstanding, skipping", id);
                }
                Err(RegisterError::Closed(reason)) => {
                    return Err(CortexError::ConnectionClosed(reason));
                }
            }
        }
    }

    /// Start listening for the next service warning.
    ///
    /// Arm before issuing the call that triggers the warning (e.g.
    /// `controlDevice`), then [`wait`](PendingWarning::wait) once the call
    /// returns; a warning pushed right behind the reply is not missed.
    pub fn arm_warning(&self) -> Result<PendingWarning, CortexError> {
        let pending = self.gate.arm(WARNING_CHANNEL);
        if !self.router.is_open() {
            return Err(CortexError::ConnectionClosed(
                "connection already closed".to_string(),
            ));
        }
        Ok(PendingWarning { pending })
    }

    /// Block until the service pushes a warning.
    ///
    /// Only sees warnings pushed after this is called; see
    /// [`arm_warning`](Self::arm_warning) to wait for one caused by a call.
    pub fn await_warning(&self, timeout: Duration) -> Result<Warning, CortexError> {
        self.arm_warning()?.wait(timeout)
    }

    /// Issue `method` and wait for the warning it triggers.
    pub fn call_then_await_warning(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<(Value, Warning), CortexError> {
        let warning = self.arm_warning()?;
        let result = self.call(method, params)?;
        Ok((result, warning.wait(timeout)?))
    }

    /// Push-style delivery for any channel.
    ///
    /// Handlers run on the frame delivery thread. A blocking [`call`](Self::call)
    /// from inside a handler fails with `TransportError::OnDeliveryThread`;
    /// hand the work to another thread instead.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(channel, handler)
    }

    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(channel, id)
    }

    /// Subscribe to push data for stream `tag` (e.g. `"met"`, `"mot"`).
    ///
    /// Same delivery-thread rules as [`subscribe`](Self::subscribe).
    pub fn on_stream<F>(&self, tag: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(&stream_channel(tag), handler)
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn router(&self) -> &Arc<ResponseRouter> {
        &self.router
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.router.pending_count()
    }

    pub fn is_open(&self) -> bool {
        self.router.is_open() && self.transport.is_open()
    }

    /// Tear the connection down. Blocked callers fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.transport.close();
        self.router.close("closed by client");
    }
}

/// A warning listener armed by [`Client::arm_warning`].
pub struct PendingWarning {
    pending: PendingReply,
}

impl PendingWarning {
    pub fn wait(self, timeout: Duration) -> Result<Warning, CortexError> {
        if router::on_delivery_path() {
            return Err(TransportError::OnDeliveryThread.into());
        }
        match self.pending.wait(timeout)? {
            Event::Warning(warning) => Ok(warning),
            Event::Closed { reason } => Err(CortexError::ConnectionClosed(reason)),
            other => Err(TransportError::UnexpectedReply(other.kind().to_string()).into()),
        }
    }
}

fn reply_from_event(event: Event) -> Result<Value, CortexError> {
    match event {
        Event::Result(value) => Ok(value),
        Event::Error(body) => Err(body.into()),
        Event::Closed { reason } => Err(CortexError::ConnectionClosed(reason)),
        other => Err(TransportError::UnexpectedReply(other.kind().to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RemoteErrorBody;
    use serde_json::json;

    #[test]
    fn test_reply_from_event() {
        assert_eq!(
            reply_from_event(Event::Result(json!({"ok": true}))).unwrap(),
            json!({"ok": true})
        );

        let err = reply_from_event(Event::Error(RemoteErrorBody {
            code: -32,
            message: "invalid token".to_string(),
            data: None,
        }))
        .unwrap_err();
        assert!(matches!(err, CortexError::Remote { code: -32, .. }));

        let err = reply_from_event(Event::Closed {
            reason: "eof".to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, CortexError::ConnectionClosed(ref r) if r == "eof"));

        let err = reply_from_event(Event::Warning(Warning {
            code: 1,
            message: Value::Null,
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            CortexError::Transport(TransportError::UnexpectedReply(_))
        ));
    }
}
