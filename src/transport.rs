//! Transport boundary between the client and the service connection.
//!
//! # Architecture
//!
//! ```text
//!  caller threads                 delivery thread (current-thread tokio runtime)
//! ┌──────────────┐  send(text)   ┌───────────────────────────────────────────┐
//! │ Client::call │ ─────────────►│ outbound queue ──► socket                 │
//! └──────────────┘               │ socket ──► FrameHandler::on_frame(text)   │
//!                                │ end of stream ──► FrameHandler::on_close  │
//!                                └───────────────────────────────────────────┘
//! ```
//!
//! `send` never blocks on the network: it enqueues and returns. Inbound frames
//! are handed to the [`FrameHandler`] one at a time, in arrival order, on the
//! delivery thread.

mod websocket;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TransportError;

pub use websocket::WsTransport;

/// Outbound half of a duplex text-frame channel.
pub trait Transport: Send + Sync {
    /// Queue one text frame. Fails with `NotOpen` once the channel is gone.
    fn send(&self, text: &str) -> Result<(), TransportError>;

    /// Ask the connection to shut down. `on_close` follows on the delivery thread.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Inbound half: receives frames and the end-of-connection notice.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, text: &str);

    /// Called exactly once, after the last frame.
    fn on_close(&self, reason: &str);
}

/// Connect to a `ws://` or `wss://` endpoint.
pub fn connect(
    endpoint: &str,
    handler: Arc<dyn FrameHandler>,
    connect_timeout: Duration,
) -> Result<Arc<dyn Transport>, TransportError> {
    let url = Url::parse(endpoint).map_err(|e| TransportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "ws" | "wss" => Ok(Arc::new(WsTransport::connect(
            url.as_str(),
            handler,
            connect_timeout,
        )?)),
        other => Err(TransportError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Item on a delivery thread's outbound queue.
pub(crate) enum Outgoing {
    Frame(String),
    Close,
}

/// Synchronous handle to a running delivery thread.
pub(crate) struct DeliveryHandle {
    outbound: UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryHandle {
    /// Spawn a named delivery thread, connect on it and start pumping.
    ///
    /// Returns once the connection is established (or failed). After that,
    /// `pump` owns the connection until it returns the close reason, which is
    /// passed to `handler.on_close`.
    pub(crate) fn spawn<Conn, C, CF, P, PF>(
        thread_name: &str,
        connect_timeout: Duration,
        handler: Arc<dyn FrameHandler>,
        connect: C,
        pump: P,
    ) -> Result<Self, TransportError>
    where
        Conn: 'static,
        C: FnOnce() -> CF + Send + 'static,
        CF: Future<Output = Result<Conn, TransportError>>,
        P: FnOnce(Conn, UnboundedReceiver<Outgoing>, Arc<dyn FrameHandler>) -> PF + Send + 'static,
        PF: Future<Output = String>,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), TransportError>>(1);

        let thread_open = Arc::clone(&open);
        let thread = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(TransportError::Connect(format!(
                            "failed to build runtime: {e}"
                        ))));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let conn = match tokio::time::timeout(connect_timeout, connect()).await {
                        Ok(Ok(conn)) => conn,
                        Ok(Err(e)) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                        Err(_) => {
                            let _ = ready_tx.send(Err(TransportError::Connect(format!(
                                "timed out after {connect_timeout:?}"
                            ))));
                            return;
                        }
                    };

                    thread_open.store(true, Ordering::SeqCst);
                    let _ = ready_tx.send(Ok(()));

                    let reason = pump(conn, outbound_rx, Arc::clone(&handler)).await;
                    thread_open.store(false, Ordering::SeqCst);
                    info!("Transport closed: {}", reason);
                    handler.on_close(&reason);
                });
            })
            .map_err(|e| TransportError::Connect(format!("failed to spawn delivery thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                outbound,
                open,
                thread: Mutex::new(Some(thread)),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(TransportError::Connect(
                    "delivery thread exited during connect".to_string(),
                ))
            }
        }
    }

    pub(crate) fn send(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.outbound
            .send(Outgoing::Frame(text.to_string()))
            .map_err(|_| TransportError::NotOpen)
    }

    pub(crate) fn close(&self) {
        if self.outbound.send(Outgoing::Close).is_err() {
            debug!("Close requested on an already stopped transport");
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        self.close();
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        // The last handle can be dropped from inside a frame handler.
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("Transport delivery thread panicked");
        }
    }
}
