//! WebSocket transport over `tokio-tungstenite`.
//!
//! The Cortex service speaks JSON-RPC in text frames on `wss://localhost:6868`.
//! TLS endpoints need the `tls` cargo feature.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{DeliveryHandle, FrameHandler, Outgoing, Transport};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client side of a WebSocket connection.
pub struct WsTransport {
    delivery: DeliveryHandle,
    url: String,
}

impl WsTransport {
    /// Open a WebSocket to `url` and start delivering inbound text frames
    /// to `handler` on a dedicated thread.
    pub fn connect(
        url: &str,
        handler: Arc<dyn FrameHandler>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        info!("Connecting to {}", url);
        let target = url.to_string();
        let delivery = DeliveryHandle::spawn(
            "cortex-ws",
            connect_timeout,
            handler,
            move || async move {
                let (ws, response) = connect_async(target.as_str())
                    .await
                    .map_err(|e| TransportError::Connect(format!("WebSocket connect: {e}")))?;
                debug!("WebSocket handshake completed ({})", response.status());
                Ok::<_, TransportError>(ws)
            },
            pump,
        )?;

        Ok(Self {
            delivery,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn send(&self, text: &str) -> Result<(), TransportError> {
        self.delivery.send(text)
    }

    fn close(&self) {
        self.delivery.close();
    }

    fn is_open(&self) -> bool {
        self.delivery.is_open()
    }
}

/// Shuttle frames until either side ends the connection. Returns the reason.
async fn pump(
    ws: WsStream,
    mut outbound: UnboundedReceiver<Outgoing>,
    handler: Arc<dyn FrameHandler>,
) -> String {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outgoing::Frame(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return format!("send failed: {e}");
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return "closed by client".to_string();
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => handler.on_frame(text.as_str()),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => handler.on_frame(text),
                    Err(e) => warn!("Dropping non UTF-8 binary frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) if !frame.reason.is_empty() => {
                            format!("closed by server: {}", frame.reason)
                        }
                        _ => "closed by server".to_string(),
                    };
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => return format!("read failed: {e}"),
                None => return "stream ended".to_string(),
            },
        }
    }
}
