//! Transport layer between the client and a runtime.
//!
//! A transport moves [`Message`]s to and from a runtime and reports
//! connectivity changes. The correlator only depends on the [`Transport`]
//! trait, so the medium is interchangeable:
//!
//! - **WebSocket** (`WebSocketTransport`): JSON text frames over a socket
//!   negotiated with the `noflo` subprotocol.
//! - **Channel** (`ChannelTransport`): an in-process pair of queues, used to
//!   embed a runtime in the same process and to script runtimes in tests.
//!
//! Browser-hosted transports (`iframe`, `webrtc`) are recognized by
//! [`TransportType::from_address`] but have no implementation here; callers
//! that can reach such a runtime supply their own [`Transport`].

pub mod channel;
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::errors::ClientError;
use crate::protocol::Message;

pub use channel::{ChannelTransport, RuntimeEnd};
pub use websocket::WebSocketTransport;

/// Log target for transport activity.
pub(crate) const LOG_TARGET: &str = "fbp_client::transport";

// ---------------------------------------------------------------------------
// TransportEvent
// ---------------------------------------------------------------------------

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A message arrived from the runtime.
    Message(Message),
    /// Connectivity changed.
    Status { online: bool },
    /// The connection ended, locally or remotely.
    Disconnected,
    /// The transport hit an error that did not end the connection.
    Error(String),
}

/// Where a transport delivers its events.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

// ---------------------------------------------------------------------------
// TransportType
// ---------------------------------------------------------------------------

/// Connection media a runtime definition may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// WebSocket connection (`ws://`, `wss://`).
    WebSocket,
    /// Runtime hosted in a browser frame (`http://`, `https://`).
    Iframe,
    /// Runtime reached over a WebRTC data channel.
    WebRtc,
    /// In-process channel pair.
    Channel,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

impl TransportType {
    /// Name of the transport as used in runtime definitions.
    pub fn value(&self) -> &'static str {
        match self {
            TransportType::WebSocket => "websocket",
            TransportType::Iframe => "iframe",
            TransportType::WebRtc => "webrtc",
            TransportType::Channel => "channel",
        }
    }

    /// Parse a transport name from a runtime definition.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "websocket" => Some(TransportType::WebSocket),
            "iframe" => Some(TransportType::Iframe),
            "webrtc" => Some(TransportType::WebRtc),
            "channel" => Some(TransportType::Channel),
            _ => None,
        }
    }

    /// Guess the transport from a runtime address.
    ///
    /// `ws:`/`wss:` addresses are WebSocket runtimes. `http:`/`https:`
    /// addresses are browser-hosted; they use WebRTC when the fragment
    /// carries `fbp_protocol=webrtc` and a frame otherwise.
    pub fn from_address(address: &str) -> Option<Self> {
        let url = Url::parse(address).ok()?;
        match url.scheme() {
            "ws" | "wss" => Some(TransportType::WebSocket),
            "http" | "https" => {
                let webrtc = url
                    .fragment()
                    .map_or(false, |fragment| fragment.contains("fbp_protocol=webrtc"));
                if webrtc {
                    Some(TransportType::WebRtc)
                } else {
                    Some(TransportType::Iframe)
                }
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A message-oriented connection to a runtime.
///
/// Implementations deliver every inbound message, in arrival order, to the
/// [`EventSink`] handed to [`connect`](Transport::connect), and must emit
/// [`TransportEvent::Disconnected`] whenever an established connection ends
/// so that in-flight commands can be settled.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The medium this transport uses.
    fn transport_type(&self) -> TransportType;

    /// Whether the connection is currently up.
    fn is_connected(&self) -> bool;

    /// Open the connection. A no-op when already connected.
    async fn connect(&self, events: EventSink) -> Result<(), anyhow::Error>;

    /// Close the connection. A no-op when not connected.
    async fn disconnect(&self) -> Result<(), anyhow::Error>;

    /// Send one message to the runtime.
    async fn send(&self, message: &Message) -> Result<(), anyhow::Error>;
}

/// Build the transport a runtime definition asks for.
pub fn create_transport(
    transport_type: TransportType,
    address: &str,
) -> Result<Arc<dyn Transport>, ClientError> {
    match transport_type {
        TransportType::WebSocket => Ok(Arc::new(WebSocketTransport::new(address))),
        other => Err(ClientError::UnsupportedTransport(other.value().to_string())),
    }
}
