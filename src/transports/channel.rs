//! In-process transport.
//!
//! [`ChannelTransport::pair`] returns the client side of the connection and
//! a [`RuntimeEnd`] through which an embedded runtime, or a test, reads the
//! commands the client sends and emits messages back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{EventSink, Transport, TransportEvent, TransportType, LOG_TARGET};
use crate::protocol::Message;

struct Shared {
    connected: AtomicBool,
    events: Mutex<Option<EventSink>>,
}

impl Shared {
    /// Emit an event to the connected client, if any.
    fn emit(&self, event: TransportEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(sink) = self.events.lock().take() {
            let _ = sink.send(TransportEvent::Status { online: false });
            let _ = sink.send(TransportEvent::Disconnected);
        }
    }
}

/// Client side of an in-process connection.
pub struct ChannelTransport {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
}

/// Runtime side of an in-process connection.
pub struct RuntimeEnd {
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Message>,
}

impl ChannelTransport {
    /// Create a connected pair of endpoints. The client side starts
    /// disconnected.
    pub fn pair() -> (ChannelTransport, RuntimeEnd) {
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            events: Mutex::new(None),
        });
        let (outbound, inbound) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                shared: Arc::clone(&shared),
                outbound,
            },
            RuntimeEnd { shared, inbound },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Channel
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self, events: EventSink) -> Result<(), anyhow::Error> {
        if self.is_connected() {
            return Ok(());
        }
        *self.shared.events.lock() = Some(events);
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.emit(TransportEvent::Status { online: true });
        log::debug!(target: LOG_TARGET, "channel connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), anyhow::Error> {
        self.shared.close();
        log::debug!(target: LOG_TARGET, "channel disconnected");
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<(), anyhow::Error> {
        if !self.is_connected() {
            anyhow::bail!("channel is not connected");
        }
        self.outbound
            .send(message.clone())
            .map_err(|_| anyhow::anyhow!("runtime end of the channel is gone"))
    }
}

impl RuntimeEnd {
    /// Next command sent by the client.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    /// Next command sent by the client, if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.inbound.try_recv().ok()
    }

    /// Emit a message to the client. Returns `false` when no client is
    /// connected.
    pub fn send(&self, protocol: &str, command: &str, payload: Value) -> bool {
        self.emit(Message::new(protocol, command, payload))
    }

    pub fn emit(&self, message: Message) -> bool {
        self.shared.emit(TransportEvent::Message(message))
    }

    /// Report a non-fatal transport error to the client.
    pub fn error(&self, detail: impl Into<String>) -> bool {
        self.shared.emit(TransportEvent::Error(detail.into()))
    }

    /// Drop the connection from the runtime side.
    pub fn drop_connection(&self) {
        self.shared.close();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}
