//! Runtime definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ClientError;
use crate::transports::TransportType;

/// How to reach a runtime, and what it told us about itself.
///
/// Definitions are usually read from a registry or a config file; the
/// fields after `secret` are filled in from the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Where the runtime listens, e.g. `ws://localhost:3569`.
    #[serde(default)]
    pub address: String,
    /// Transport name. Inferred from `address` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Shared secret sent along with every command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Runtime implementation, e.g. `noflo-nodejs`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub runtime_type: Option<String>,
    /// Protocol version the runtime speaks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Graph the runtime runs by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<String>,
    /// Component library namespace of the runtime's project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl RuntimeDefinition {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Check the definition and settle which transport it uses.
    pub fn resolve_transport(&mut self) -> Result<TransportType, ClientError> {
        if self.address.trim().is_empty() {
            return Err(ClientError::InvalidDefinition(
                "Runtime address is required".to_string(),
            ));
        }
        let transport = match self.protocol.as_deref() {
            Some(name) => TransportType::from_str_opt(name)
                .ok_or_else(|| ClientError::UnsupportedTransport(name.to_string()))?,
            None => TransportType::from_address(&self.address).ok_or_else(|| {
                ClientError::InvalidDefinition("Runtime connection protocol is required".to_string())
            })?,
        };
        self.protocol = Some(transport.value().to_string());
        Ok(transport)
    }

    /// Record what the runtime announced in `runtime:runtime`.
    pub fn apply_handshake(&mut self, payload: &Value) {
        let text = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);

        if let Some(runtime_type) = text("type") {
            self.runtime_type = Some(runtime_type);
        }
        if let Some(version) = text("version") {
            self.version = Some(version);
        }
        if let Some(capabilities) = payload.get("capabilities").and_then(Value::as_array) {
            self.capabilities = capabilities
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        if let Some(graph) = text("graph") {
            self.graph = Some(graph);
        }
        if let Some(id) = text("id") {
            self.id = Some(id);
        }
        if let Some(label) = text("label") {
            self.label = Some(label);
        }
        if let Some(namespace) = text("namespace") {
            self.namespace = Some(namespace);
        }
        if let Some(repository) = text("repository") {
            self.repository = Some(repository);
        }
    }
}
