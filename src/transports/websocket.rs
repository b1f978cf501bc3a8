//! WebSocket transport.
//!
//! Runtimes listening on `ws://` addresses speak JSON text frames, one
//! message per frame, and expect the `noflo` WebSocket subprotocol. A reader
//! task forwards frames to the event sink and reports `Disconnected` when the
//! socket closes for any reason.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{EventSink, Transport, TransportEvent, TransportType, LOG_TARGET};
use crate::protocol::Message;

/// WebSocket subprotocol spoken by FBP runtimes.
pub const SUBPROTOCOL: &str = "noflo";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Frame>;

/// Transport for runtimes reachable over WebSocket.
pub struct WebSocketTransport {
    address: String,
    connected: Arc<AtomicBool>,
    writer: Mutex<Option<WsSink>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    events: parking_lot::Mutex<Option<EventSink>>,
}

impl WebSocketTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connected: Arc::new(AtomicBool::new(false)),
            writer: Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
            events: parking_lot::Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn read_loop(
        mut reader: SplitStream<WsStream>,
        connected: Arc<AtomicBool>,
        events: EventSink,
    ) {
        while let Some(frame) = reader.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!(target: LOG_TARGET, "WebSocket read error, stopping reader: {}", e);
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            };

            let text = match frame {
                Frame::Text(text) => text.to_string(),
                Frame::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Frame::Close(_) => {
                    log::info!(target: LOG_TARGET, "WebSocket closed by runtime");
                    break;
                }
                _ => continue,
            };

            match serde_json::from_str::<Message>(&text) {
                Ok(message) => {
                    if events.send(TransportEvent::Message(message)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!(target: LOG_TARGET, "Ignoring malformed frame: {}", e);
                    let _ = events.send(TransportEvent::Error(format!("malformed frame: {e}")));
                }
            }
        }

        if connected.swap(false, Ordering::SeqCst) {
            let _ = events.send(TransportEvent::Status { online: false });
            let _ = events.send(TransportEvent::Disconnected);
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self, events: EventSink) -> Result<(), anyhow::Error> {
        let mut writer = self.writer.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        log::info!(target: LOG_TARGET, "Connecting to {}", self.address);

        let mut request = self.address.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (sink, source) = stream.split();

        *writer = Some(sink);
        self.connected.store(true, Ordering::SeqCst);
        let _ = events.send(TransportEvent::Status { online: true });
        *self.events.lock() = Some(events.clone());

        let handle = tokio::spawn(Self::read_loop(source, Arc::clone(&self.connected), events));
        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }
        log::info!(target: LOG_TARGET, "Connected to {}", self.address);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), anyhow::Error> {
        let mut writer = self.writer.lock().await;
        let Some(mut sink) = writer.take() else {
            return Ok(());
        };
        if let Err(e) = sink.send(Frame::Close(None)).await {
            log::debug!(target: LOG_TARGET, "Close frame failed: {}", e);
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let events = self.events.lock().take();
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Some(events) = events {
                let _ = events.send(TransportEvent::Status { online: false });
                let _ = events.send(TransportEvent::Disconnected);
            }
        }
        log::info!(target: LOG_TARGET, "Disconnected from {}", self.address);
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<(), anyhow::Error> {
        let json = serde_json::to_string(message)?;
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            anyhow::bail!("WebSocket to {} is not connected", self.address);
        };
        sink.send(Frame::Text(json.into())).await?;
        Ok(())
    }
}
