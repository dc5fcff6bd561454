//! Cortex Link Library
//!
//! Blocking JSON-RPC client for the Emotiv Cortex service. One persistent
//! connection carries many request/response exchanges plus unsolicited push
//! data; this crate matches each reply to the call that caused it.
//!
//! - `bus` - named-channel publish/subscribe registry
//! - `router` - classifies inbound frames and owns the request-id table
//! - `gate` - turns the next event on a channel into a blocking return
//! - `client` - the `call` API built from the three above
//! - `cortex` - typed wrappers for the Cortex API calls
//! - `transport` - WebSocket connection on a delivery thread
//!
//! ```ignore
//! use cortex_link::{Client, ClientConfig};
//! use serde_json::json;
//!
//! let client = Client::connect(ClientConfig::from_env())?;
//! let info = client.call("getCortexInfo", json!({}))?;
//! client.on_stream("met", |event| {
//!     println!("{:?}", event);
//!     Ok(())
//! });
//! ```

pub mod bus;
pub mod client;
pub mod config;
pub mod cortex;
pub mod error;
pub mod gate;
pub mod protocol;
pub mod router;
pub mod transport;

pub use bus::{EventBus, HandlerFailure, SubscriptionId};
pub use client::{Client, PendingWarning};
pub use config::ClientConfig;
pub use error::{CortexError, MalformedFrame, TransportError};
pub use gate::{CorrelationGate, PendingReply};
pub use protocol::{Event, RemoteErrorBody, Warning};
pub use router::ResponseRouter;
pub use transport::{FrameHandler, Transport};
