//! Message envelope and `protocol:command` signatures.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Payload key carrying the runtime secret on outbound commands.
pub const SECRET_KEY: &str = "secret";

/// Wildcard accepted on either side of a signature.
pub const WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single FBP protocol message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sub-protocol (`runtime`, `graph`, `network`, `component`, `trace`).
    pub protocol: String,
    /// Command within the protocol.
    pub command: String,
    /// Command-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    /// Create a new message.
    pub fn new(protocol: impl Into<String>, command: impl Into<String>, payload: Value) -> Self {
        Self {
            protocol: protocol.into(),
            command: command.into(),
            payload,
        }
    }

    /// The `protocol:command` signature of this message.
    pub fn signature(&self) -> Signature {
        Signature::new(self.protocol.clone(), self.command.clone())
    }

    /// Whether this message has the given protocol and command.
    pub fn is(&self, protocol: &str, command: &str) -> bool {
        self.protocol == protocol && self.command == command
    }

    /// Remove the runtime secret from the payload, if present.
    pub fn strip_secret(&mut self) {
        if let Some(payload) = self.payload.as_object_mut() {
            payload.remove(SECRET_KEY);
        }
    }

    /// Look up a string field of the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Direction of a message relative to the runtime.
///
/// `Input` messages are sent by the client to the runtime, `Output`
/// messages are emitted by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    /// Schema path segment for this direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }

    /// Which side of the connection produces messages in this direction.
    pub fn sender(&self) -> &'static str {
        match self {
            Direction::Input => "Client",
            Direction::Output => "Runtime",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// A `protocol:command` pair where either side may be the `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub protocol: String,
    pub command: String,
}

/// Error returned when a signature string has no `:` separator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid signature '{0}', expected 'protocol:command'")]
pub struct SignatureParseError(pub String);

impl Signature {
    pub fn new(protocol: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            command: command.into(),
        }
    }

    /// Whether the given protocol and command satisfy this signature.
    pub fn matches(&self, protocol: &str, command: &str) -> bool {
        side_matches(&self.protocol, protocol) && side_matches(&self.command, command)
    }

    /// Whether the message satisfies this signature.
    pub fn matches_message(&self, message: &Message) -> bool {
        self.matches(&message.protocol, &message.command)
    }
}

fn side_matches(pattern: &str, value: &str) -> bool {
    pattern == WILDCARD || pattern == value
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.command)
    }
}

impl FromStr for Signature {
    type Err = SignatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((protocol, command)) if !protocol.is_empty() && !command.is_empty() => {
                Ok(Signature::new(protocol, command))
            }
            _ => Err(SignatureParseError(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_format() {
        let raw = r#"{"protocol":"network","command":"started","payload":{"graph":"main"}}"#;
        let message: Message = serde_json::from_str(raw).unwrap();
        assert!(message.is("network", "started"));
        assert_eq!(message.payload_str("graph"), Some("main"));
        assert_eq!(message.signature().to_string(), "network:started");
    }

    #[test]
    fn test_message_missing_payload_defaults_to_null() {
        let message: Message =
            serde_json::from_str(r#"{"protocol":"component","command":"componentsready"}"#)
                .unwrap();
        assert!(message.payload.is_null());
    }

    #[test]
    fn test_strip_secret() {
        let mut message = Message::new("graph", "clear", json!({"id": "g", "secret": "s3"}));
        message.strip_secret();
        assert_eq!(message.payload, json!({"id": "g"}));

        // Non-object payloads are left alone.
        let mut scalar = Message::new("component", "componentsready", json!(3));
        scalar.strip_secret();
        assert_eq!(scalar.payload, json!(3));
    }

    #[test]
    fn test_signature_wildcards() {
        let any_network: Signature = "network:*".parse().unwrap();
        assert!(any_network.matches("network", "data"));
        assert!(!any_network.matches("graph", "data"));

        let any_error: Signature = "*:error".parse().unwrap();
        assert!(any_error.matches("graph", "error"));
        assert!(!any_error.matches("graph", "clear"));

        let exact: Signature = "runtime:packet".parse().unwrap();
        assert!(exact.matches("runtime", "packet"));
        assert!(!exact.matches("runtime", "packetsent"));
    }

    #[test]
    fn test_signature_parse_errors() {
        assert!("network".parse::<Signature>().is_err());
        assert!(":start".parse::<Signature>().is_err());
        assert!("network:".parse::<Signature>().is_err());
    }

    #[test]
    fn test_direction_strings() {
        assert_eq!(Direction::Input.as_str(), "input");
        assert_eq!(Direction::Output.to_string(), "output");
        assert_eq!(Direction::Input.sender(), "Client");
        assert_eq!(Direction::Output.sender(), "Runtime");
    }
}
