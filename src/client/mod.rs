//! FBP runtime client.
//!
//! [`FbpClient`] ties the pieces together: it owns the transport, runs the
//! handshake, checks outbound commands against the vocabulary and the
//! granted capabilities, and hands them to the correlator. Signals are
//! observed through [`FbpClient::observe`].
//!
//! ```ignore
//! let client = FbpClient::new(RuntimeDefinition::new("ws://localhost:3569"), ClientOptions::from_env())?;
//! client.connect().await?;
//! let components = client.component().list(json!({})).await?;
//! ```

pub mod commands;
pub mod config;
pub mod definition;
pub mod graph;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::adapter::Adapter;
use crate::errors::ClientError;
use crate::observe::{Matcher, SignalHub, Subscription};
use crate::permissions::CapabilityStore;
use crate::protocol::message::SECRET_KEY;
use crate::protocol::{Message, RUNTIME_PROTOCOL};
use crate::schema::{NoopValidator, SchemaPath, SchemaValidator, Validator};
use crate::transports::{create_transport, Transport};

pub use commands::{ComponentCommands, GraphCommands, NetworkCommands, RuntimeCommands, TraceCommands};
pub use config::ClientOptions;
pub use definition::RuntimeDefinition;
pub use graph::{Connection, ExportedPort, GraphDefinition, GraphProperties, PortRef, Process};

const LOG_TARGET: &str = "fbp_client";

/// Client for one runtime.
pub struct FbpClient {
    definition: RwLock<RuntimeDefinition>,
    options: ClientOptions,
    transport: Arc<dyn Transport>,
    adapter: Adapter,
    hub: SignalHub,
    capabilities: Arc<CapabilityStore>,
    validator: Arc<dyn Validator>,
    /// Set by the first successful handshake.
    negotiated: AtomicBool,
    connecting: tokio::sync::Mutex<()>,
}

impl FbpClient {
    /// Create a client for the runtime described by `definition`.
    ///
    /// The transport is taken from `definition.protocol`, or guessed from
    /// the address. Only WebSocket runtimes can be reached this way; use
    /// [`FbpClient::with_transport`] for anything else.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(mut definition: RuntimeDefinition, options: ClientOptions) -> Result<Self, ClientError> {
        let transport_type = definition.resolve_transport()?;
        let transport = create_transport(transport_type, &definition.address)?;
        Ok(Self::build(definition, options, transport))
    }

    /// Create a client that talks to the runtime through `transport`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn with_transport(
        mut definition: RuntimeDefinition,
        options: ClientOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        if definition.address.trim().is_empty() {
            return Err(ClientError::InvalidDefinition(
                "Runtime address is required".to_string(),
            ));
        }
        definition.protocol = Some(transport.transport_type().value().to_string());
        Ok(Self::build(definition, options, transport))
    }

    fn build(definition: RuntimeDefinition, options: ClientOptions, transport: Arc<dyn Transport>) -> Self {
        let validator: Arc<dyn Validator> = if options.skip_validation {
            Arc::new(NoopValidator)
        } else {
            Arc::new(SchemaValidator::new())
        };
        let hub = SignalHub::new();
        let capabilities = Arc::new(CapabilityStore::new());
        let adapter = Adapter::spawn(
            Arc::clone(&transport),
            hub.clone(),
            Arc::clone(&capabilities),
            Arc::clone(&validator),
            &options,
        );
        Self {
            definition: RwLock::new(definition),
            options,
            transport,
            adapter,
            hub,
            capabilities,
            validator,
            negotiated: AtomicBool::new(false),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Current runtime definition, including what the last handshake
    /// reported.
    pub fn definition(&self) -> RuntimeDefinition {
        self.definition.read().clone()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Capabilities granted by the last handshake.
    pub fn capabilities(&self) -> Arc<Vec<String>> {
        self.capabilities.snapshot()
    }

    pub fn can_send(&self, protocol: &str, command: &str) -> bool {
        self.capabilities.can_send(protocol, command)
    }

    pub fn can_receive(&self, protocol: &str, command: &str) -> bool {
        self.capabilities.can_receive(protocol, command)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Connect and run the handshake.
    ///
    /// Returns the definition updated with what the runtime announced. When
    /// already connected this returns the current definition right away. If
    /// the connection or the handshake fails, or does not finish within the
    /// connection timeout, the transport is closed again.
    pub async fn connect(&self) -> Result<RuntimeDefinition, ClientError> {
        let _connecting = self.connecting.lock().await;
        if self.is_connected() {
            return Ok(self.definition());
        }

        let address = self.definition.read().address.clone();
        log::info!(target: LOG_TARGET, "Connecting to {}", address);
        let outcome = tokio::time::timeout(self.options.connection_timeout, self.establish()).await;
        let payload = match outcome {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => {
                self.abandon().await;
                return Err(if err.is_timeout() {
                    ClientError::ConnectionTimeout { address }
                } else {
                    err
                });
            }
            Err(_) => {
                self.abandon().await;
                return Err(ClientError::ConnectionTimeout { address });
            }
        };

        self.negotiated.store(true, Ordering::SeqCst);
        let mut definition = self.definition.write();
        definition.apply_handshake(&payload);
        log::info!(
            target: LOG_TARGET,
            "Connected to {} runtime at {} (protocol {})",
            definition.runtime_type.as_deref().unwrap_or("unknown"),
            definition.address,
            definition.version.as_deref().unwrap_or("?")
        );
        Ok(definition.clone())
    }

    async fn establish(&self) -> Result<Value, ClientError> {
        self.transport
            .connect(self.adapter.event_sink())
            .await
            .map_err(ClientError::transport)?;
        let mut payload = Map::new();
        let secret = self.definition.read().secret.clone();
        if let Some(secret) = secret {
            payload.insert(SECRET_KEY.to_string(), Value::String(secret));
        }
        let handshake = Message::new(RUNTIME_PROTOCOL, "getruntime", Value::Object(payload));
        self.adapter.handshake(handshake).await
    }

    async fn abandon(&self) {
        if let Err(e) = self.transport.disconnect().await {
            log::debug!(target: LOG_TARGET, "Disconnect after failed connect: {}", e);
        }
    }

    /// Close the connection. Commands already queued are kept and sent after
    /// the next successful [`connect`](FbpClient::connect).
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.transport.disconnect().await.map_err(ClientError::transport)
    }

    /// Send `protocol:command` and wait for the answer.
    ///
    /// The payload is validated and checked against the granted capabilities
    /// right away; a rejected command never reaches the runtime. Accepted
    /// commands are queued immediately, so the order of `send` calls is the
    /// order in which the runtime receives them.
    pub fn send(&self, protocol: &str, command: &str, payload: Value) -> BoxFuture<'static, Result<Value, ClientError>> {
        match self.prepare(protocol, command, payload) {
            Ok(message) => self.adapter.send(message).boxed(),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    fn prepare(&self, protocol: &str, command: &str, payload: Value) -> Result<Message, ClientError> {
        let mut payload = match payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let secret = self.definition.read().secret.clone();
        if let (Some(object), Some(secret)) = (payload.as_object_mut(), secret) {
            object.insert(SECRET_KEY.to_string(), Value::String(secret));
        }
        let message = Message::new(protocol, command, payload);
        self.validator.validate(&SchemaPath::input(&message), &message)?;

        if !self.negotiated.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        if !self.options.skip_permissions && !self.capabilities.can_send(protocol, command) {
            return Err(ClientError::PermissionDenied {
                protocol: protocol.to_string(),
                command: command.to_string(),
            });
        }
        Ok(message)
    }

    /// Start buffering signals that match `matcher`.
    pub fn observe(&self, matcher: Matcher) -> Subscription {
        self.hub.subscribe(matcher)
    }

    pub fn runtime(&self) -> RuntimeCommands<'_> {
        RuntimeCommands::new(self)
    }

    pub fn graph(&self) -> GraphCommands<'_> {
        GraphCommands::new(self)
    }

    pub fn network(&self) -> NetworkCommands<'_> {
        NetworkCommands::new(self)
    }

    pub fn component(&self) -> ComponentCommands<'_> {
        ComponentCommands::new(self)
    }

    pub fn trace(&self) -> TraceCommands<'_> {
        TraceCommands::new(self)
    }
}

impl std::fmt::Debug for FbpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FbpClient")
            .field("definition", &*self.definition.read())
            .field("connected", &self.is_connected())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_new_rejects_bad_definitions() {
        let err = FbpClient::new(RuntimeDefinition::default(), ClientOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), "Runtime address is required");

        let err = FbpClient::new(
            RuntimeDefinition::new("https://app.flowhub.io/#fbp_protocol=webrtc"),
            ClientOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Unsupported FBP transport webrtc");
    }

    #[tokio::test]
    async fn test_new_websocket_client() {
        let client = FbpClient::new(
            RuntimeDefinition::new("ws://localhost:3569"),
            ClientOptions::default(),
        )
        .unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.definition().protocol.as_deref(), Some("websocket"));
    }

    #[tokio::test]
    async fn test_connect_updates_definition() {
        let (client, mut runtime) = channel_client(ClientOptions::default());
        let (connected, request) = handshake(&client, &mut runtime, &["protocol:graph"]).await;
        let definition = connected.unwrap();

        assert!(request.is("runtime", "getruntime"));
        assert_eq!(request.payload_str("secret"), Some("s3cret"));
        assert!(client.is_connected());
        assert_eq!(definition.runtime_type.as_deref(), Some("noflo-test"));
        assert_eq!(definition.version.as_deref(), Some("0.7"));
        assert_eq!(definition.graph.as_deref(), Some("main"));
        assert_eq!(definition.protocol.as_deref(), Some("channel"));
        assert_eq!(client.capabilities().as_slice(), ["protocol:graph".to_string()]);
        assert!(client.can_send("graph", "addnode"));
        assert!(!client.can_send("network", "start"));
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_a_no_op() {
        let (client, mut runtime) = connected_client(ALL_CAPABILITIES).await;
        let definition = client.connect().await.unwrap();
        assert_eq!(definition.version.as_deref(), Some("0.7"));
        assert!(runtime.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        let options = ClientOptions::default().with_connection_timeout(Duration::from_millis(50));
        let (client, mut runtime) = channel_client(options);
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.to_string(), "Connection to channel://test timed out");
        assert!(!client.is_connected());
        assert!(runtime.recv().await.unwrap().is("runtime", "getruntime"));
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let (client, mut runtime) = channel_client(ClientOptions::default());
        let err = client.network().getstatus(json!({"graph": "main"})).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert!(runtime.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_invalid_command_never_reaches_runtime() {
        let (client, mut runtime) = connected_client(ALL_CAPABILITIES).await;
        let err = client.graph().addnode(json!({"id": "Repeat"})).await.unwrap_err();
        match err {
            ClientError::Validation(err) => {
                assert!(err.to_string().contains("Client sent invalid payload for graph:addnode"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(runtime.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unpermitted_command_never_reaches_runtime() {
        let (client, mut runtime) = connected_client(&["protocol:graph"]).await;
        let err = client.network().start(json!({"graph": "main"})).await.unwrap_err();
        assert_eq!(err.to_string(), "Not permitted to send network:start messages");
        assert!(runtime.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_skip_permissions() {
        let (client, mut runtime) =
            channel_client(ClientOptions::default().with_skip_permissions(true));
        let (connected, _) = handshake(&client, &mut runtime, &[]).await;
        connected.unwrap();

        let start = client.network().start(json!({"graph": "main"}));
        assert!(runtime.recv().await.unwrap().is("network", "start"));
        runtime.send("network", "started", json!({"graph": "main"}));
        assert!(start.await.is_ok());
    }

    #[tokio::test]
    async fn test_secret_is_injected_and_stripped() {
        let (client, mut runtime) = connected_client(ALL_CAPABILITIES).await;
        let status = client.network().getstatus(json!({"graph": "main"}));

        let request = runtime.recv().await.unwrap();
        assert_eq!(request.payload_str("secret"), Some("s3cret"));
        runtime.send(
            "network",
            "status",
            json!({"graph": "main", "running": false, "secret": "s3cret"}),
        );
        assert_eq!(status.await.unwrap(), json!({"graph": "main", "running": false}));
    }

    #[tokio::test]
    async fn test_observe_network_run() {
        let (client, mut runtime) = connected_client(ALL_CAPABILITIES).await;
        let run = client.observe(Matcher::parse(&["network:*"]).unwrap());

        let start = client.network().start(json!({"graph": "main"}));
        runtime.recv().await.unwrap();
        runtime.send("network", "started", json!({"graph": "main"}));
        start.await.unwrap();

        runtime.send("network", "output", json!({"message": "hello"}));
        runtime.send("network", "stopped", json!({"graph": "main"}));
        let signals = run
            .until(
                Matcher::parse(&["network:stopped"]).unwrap(),
                Matcher::parse(&["network:error", "network:processerror"]).unwrap(),
            )
            .await
            .unwrap();
        let commands: Vec<&str> = signals.iter().map(|s| s.command.as_str()).collect();
        assert_eq!(commands, vec!["output", "stopped"]);
    }

    #[tokio::test]
    async fn test_commands_survive_reconnect() {
        let (client, mut runtime) = connected_client(ALL_CAPABILITIES).await;
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());

        let status = client.network().getstatus(json!({"graph": "main"}));
        let (connected, request) = handshake(&client, &mut runtime, ALL_CAPABILITIES).await;
        connected.unwrap();
        assert!(request.is("runtime", "getruntime"));

        assert!(runtime.recv().await.unwrap().is("network", "getstatus"));
        runtime.send("network", "status", json!({"graph": "main", "running": true}));
        assert_eq!(status.await.unwrap()["running"], true);
    }

    #[tokio::test]
    async fn test_trace_commands() {
        let (client, mut runtime) = connected_client(ALL_CAPABILITIES).await;
        let dump = client.trace().dump(json!({"graph": "main", "type": "flowtrace.json"}));
        assert!(runtime.recv().await.unwrap().is("trace", "dump"));
        runtime.send(
            "trace",
            "dump",
            json!({"graph": "main", "type": "flowtrace.json", "flowtrace": "{}"}),
        );
        assert_eq!(dump.await.unwrap()["flowtrace"], "{}");
    }
}
