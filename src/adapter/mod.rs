//! Command correlation.
//!
//! The runtime answers commands asynchronously, interleaved with unsolicited
//! signals, and without any request identifier. The client therefore keeps
//! exactly one command in flight: the [`Adapter`] hands every command to a
//! dispatcher task which queues it, sends it when the previous one has
//! settled, and classifies each inbound message as an answer to the active
//! command or as a signal for the [`SignalHub`].
//!
//! The dispatcher owns all correlation state (queue, active slot, negotiated
//! version); nothing else mutates it. It reacts to three inputs:
//!
//! - commands submitted through the [`Adapter`] handle,
//! - [`TransportEvent`]s from the transport,
//! - the deadline of the active command.
//!
//! Commands submitted while disconnected stay queued and are sent in order
//! once a handshake has completed on the new connection.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::client::ClientOptions;
use crate::errors::{ClientError, ProtocolError};
use crate::observe::SignalHub;
use crate::permissions::CapabilityStore;
use crate::protocol::{Deadline, Expectation, Message, ProtocolVersion, ERROR_COMMAND};
use crate::schema::{SchemaPath, Validator};
use crate::transports::{EventSink, Transport, TransportEvent};

const REQUEST_TARGET: &str = "fbp_client::adapter::request";
const RESPONSE_TARGET: &str = "fbp_client::adapter::response";
const SIGNAL_TARGET: &str = "fbp_client::adapter::signal";

type Reply = oneshot::Sender<Result<Value, ClientError>>;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A command waiting for its turn.
struct PendingCommand {
    message: Message,
    reply: Reply,
}

impl PendingCommand {
    fn resolve(self, payload: Value) {
        let _ = self.reply.send(Ok(payload));
    }

    fn reject(self, error: ClientError) {
        let _ = self.reply.send(Err(error));
    }

    fn timed_out(self) {
        let error = ClientError::Timeout {
            protocol: self.message.protocol.clone(),
            command: self.message.command.clone(),
        };
        self.reject(error);
    }

    fn disconnected(self) {
        let error = ClientError::Disconnected {
            protocol: self.message.protocol.clone(),
            command: self.message.command.clone(),
        };
        self.reject(error);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// The `runtime:getruntime` handshake of a new connection.
    Handshake,
    Command,
}

/// The command currently in flight.
struct ActiveCommand {
    pending: PendingCommand,
    role: Role,
    expectation: Expectation,
    /// Payloads of an aggregated answer received so far.
    collected: Vec<Value>,
    deadline: Option<Instant>,
}

enum Request {
    Send(PendingCommand),
    Handshake(PendingCommand),
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Handle to a dispatcher task.
///
/// The dispatcher stops once every handle is dropped; commands still queued
/// at that point fail with [`ClientError::Closed`].
#[derive(Clone)]
pub struct Adapter {
    requests: mpsc::UnboundedSender<Request>,
    events: EventSink,
}

impl Adapter {
    /// Start a dispatcher for `transport`. Must be called from within a
    /// Tokio runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        hub: SignalHub,
        capabilities: Arc<CapabilityStore>,
        validator: Arc<dyn Validator>,
        options: &ClientOptions,
    ) -> Self {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            transport,
            hub,
            capabilities,
            validator,
            command_timeout: options.command_timeout,
            connection_timeout: options.connection_timeout,
            skip_permissions: options.skip_permissions,
            queue: VecDeque::new(),
            handshake: None,
            active: None,
            session: None,
        };
        tokio::spawn(dispatcher.run(requests_rx, events_rx));
        Self { requests, events }
    }

    /// Sink to hand to [`Transport::connect`].
    pub fn event_sink(&self) -> EventSink {
        self.events.clone()
    }

    /// Queue a command.
    ///
    /// The command is queued before this returns, so commands are sent in
    /// the order `send` is called regardless of when the returned futures are
    /// polled. The future settles with the answer payload (a list of
    /// payloads for `component:list`).
    pub fn send(&self, message: Message) -> impl Future<Output = Result<Value, ClientError>> + Send + 'static {
        self.submit(message, Request::Send)
    }

    /// Run the handshake for a freshly opened connection.
    ///
    /// The handshake is sent ahead of any queued command. On success the
    /// negotiated protocol version and capabilities take effect and queued
    /// commands start flowing; the future settles with the `runtime:runtime`
    /// payload.
    pub fn handshake(&self, message: Message) -> impl Future<Output = Result<Value, ClientError>> + Send + 'static {
        self.submit(message, Request::Handshake)
    }

    fn submit(
        &self,
        message: Message,
        wrap: fn(PendingCommand) -> Request,
    ) -> impl Future<Output = Result<Value, ClientError>> + Send + 'static {
        let (reply, answer) = oneshot::channel();
        // A stopped dispatcher drops the request, which closes `answer`.
        let _ = self.requests.send(wrap(PendingCommand { message, reply }));
        async move { answer.await.unwrap_or_else(|_| Err(ClientError::Closed)) }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Dispatcher {
    transport: Arc<dyn Transport>,
    hub: SignalHub,
    capabilities: Arc<CapabilityStore>,
    validator: Arc<dyn Validator>,
    command_timeout: Duration,
    connection_timeout: Duration,
    skip_permissions: bool,
    queue: VecDeque<PendingCommand>,
    handshake: Option<PendingCommand>,
    active: Option<ActiveCommand>,
    /// Version negotiated on the current connection.
    session: Option<ProtocolVersion>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let deadline = self.active.as_ref().and_then(|active| active.deadline);
            // Transport events go first: a disconnect from a previous
            // connection must be seen before the next handshake is sent.
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.on_event(event).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline().await
                }
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
            }
        }
        self.shutdown();
    }

    async fn on_request(&mut self, request: Request) {
        match request {
            Request::Send(pending) => {
                log::trace!(target: REQUEST_TARGET, "queued {}", pending.message.signature());
                self.queue.push_back(pending);
            }
            Request::Handshake(pending) => {
                if let Some(stale) = self.handshake.replace(pending) {
                    stale.reject(ClientError::Closed);
                }
            }
        }
        self.tick().await;
    }

    async fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => self.on_message(message).await,
            TransportEvent::Status { online: true } => self.tick().await,
            TransportEvent::Status { online: false } | TransportEvent::Disconnected => {
                self.on_disconnected()
            }
            TransportEvent::Error(detail) => {
                log::warn!(target: RESPONSE_TARGET, "Transport error: {}", detail);
            }
        }
    }

    /// Send the next command if nothing is in flight.
    ///
    /// The handshake goes first and only needs a connection. Queued commands
    /// additionally need a version negotiated on the current connection.
    ///
    /// A failed send rejects only the command being sent and closes the
    /// connection; the rest of the queue waits for the next handshake.
    async fn tick(&mut self) {
        if self.active.is_some() || !self.transport.is_connected() {
            return;
        }
        let (pending, role, expectation) = if let Some(pending) = self.handshake.take() {
            (pending, Role::Handshake, Expectation::handshake())
        } else {
            let Some(version) = self.session else {
                return;
            };
            let Some(pending) = self.queue.pop_front() else {
                return;
            };
            let expectation = version
                .responses()
                .expectation(&pending.message.protocol, &pending.message.command);
            (pending, Role::Command, expectation)
        };

        log::debug!(target: REQUEST_TARGET, "{}", pending.message.signature());
        if let Err(e) = self.transport.send(&pending.message).await {
            log::warn!(
                target: REQUEST_TARGET,
                "Failed to send {}: {}",
                pending.message.signature(),
                e
            );
            pending.reject(ClientError::transport(e));
            self.on_disconnected();
            if let Err(e) = self.transport.disconnect().await {
                log::debug!(target: REQUEST_TARGET, "Disconnect after failed send: {}", e);
            }
            return;
        }

        let now = Instant::now();
        let deadline = match (role, expectation.deadline()) {
            (Role::Handshake, _) => Some(now + self.connection_timeout),
            (Role::Command, Deadline::Never) => None,
            (Role::Command, Deadline::Grace(window)) => Some(now + window),
            (Role::Command, Deadline::Standard) => Some(now + self.command_timeout),
        };
        self.active = Some(ActiveCommand {
            pending,
            role,
            expectation,
            collected: Vec::new(),
            deadline,
        });
    }

    fn check_inbound(&self, message: &Message) -> Result<(), ProtocolError> {
        self.validator.validate(&SchemaPath::output(message), message)?;
        if !self.skip_permissions
            && !self.capabilities.can_receive(&message.protocol, &message.command)
        {
            return Err(ProtocolError::NotPermitted {
                protocol: message.protocol.clone(),
                command: message.command.clone(),
            });
        }
        Ok(())
    }

    async fn on_message(&mut self, mut message: Message) {
        message.strip_secret();
        let checked = self.check_inbound(&message);
        let accepted = self
            .active
            .as_ref()
            .map_or(false, |active| active.expectation.accepts(&message));

        if !accepted {
            match checked {
                Ok(()) => {
                    log::debug!(target: SIGNAL_TARGET, "{}", message.signature());
                    self.hub.publish(message);
                }
                Err(error) => {
                    log::warn!(target: SIGNAL_TARGET, "{}", error);
                    self.hub.publish_error(error);
                }
            }
            return;
        }

        let Some(mut active) = self.active.take() else {
            return;
        };
        log::debug!(
            target: RESPONSE_TARGET,
            "{} for request {}",
            message.signature(),
            active.pending.message.signature()
        );

        if let Err(error) = checked {
            active.pending.reject(ClientError::Protocol(error));
        } else if message.command == ERROR_COMMAND {
            let error = ClientError::Remote {
                message: message
                    .payload_str("message")
                    .unwrap_or("runtime reported an error")
                    .to_string(),
                stack: message.payload_str("stack").map(str::to_string),
            };
            active.pending.reject(error);
        } else {
            match (active.role, active.expectation.aggregate()) {
                (Role::Handshake, _) => self.complete_handshake(active.pending, message.payload),
                (Role::Command, Some(aggregate)) if message.command == aggregate.item => {
                    active.collected.push(message.payload);
                    self.active = Some(active);
                    return;
                }
                (Role::Command, Some(aggregate)) if message.command == aggregate.terminator => {
                    let items = std::mem::take(&mut active.collected);
                    active.pending.resolve(Value::Array(items));
                }
                (Role::Command, _) => active.pending.resolve(message.payload),
            }
        }
        self.tick().await;
    }

    fn complete_handshake(&mut self, pending: PendingCommand, payload: Value) {
        let announced = payload
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(version) = ProtocolVersion::parse(&announced) else {
            pending.reject(ClientError::UnsupportedVersion(announced));
            return;
        };
        let capabilities: Vec<String> = payload
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        log::info!(
            target: RESPONSE_TARGET,
            "Runtime speaks protocol {} ({}) with {} capabilities",
            announced,
            version,
            capabilities.len()
        );
        self.capabilities.replace(capabilities);
        self.session = Some(version);
        pending.resolve(payload);
    }

    async fn on_deadline(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let signature = active.pending.message.signature();
        match (active.role, active.expectation.deadline()) {
            (Role::Command, Deadline::Grace(_)) => {
                // Runtimes before 0.7 never acknowledge packets.
                log::debug!(target: RESPONSE_TARGET, "{} assumed delivered", signature);
                let PendingCommand { mut message, reply } = active.pending;
                message.strip_secret();
                let _ = reply.send(Ok(message.payload));
            }
            _ => {
                log::warn!(target: RESPONSE_TARGET, "{} timed out", signature);
                active.pending.timed_out();
            }
        }
        self.tick().await;
    }

    fn on_disconnected(&mut self) {
        self.session = None;
        if let Some(active) = self.active.take() {
            log::warn!(
                target: RESPONSE_TARGET,
                "Runtime disconnected while waiting for {}",
                active.pending.message.signature()
            );
            active.pending.disconnected();
        }
        if let Some(handshake) = self.handshake.take() {
            handshake.disconnected();
        }
        if !self.queue.is_empty() {
            log::debug!(
                target: REQUEST_TARGET,
                "{} commands wait for the runtime to reconnect",
                self.queue.len()
            );
        }
    }

    fn shutdown(mut self) {
        if let Some(active) = self.active.take() {
            active.pending.reject(ClientError::Closed);
        }
        if let Some(handshake) = self.handshake.take() {
            handshake.reject(ClientError::Closed);
        }
        for pending in self.queue.drain(..) {
            pending.reject(ClientError::Closed);
        }
        self.hub.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
