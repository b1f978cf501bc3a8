//! Message validation.
//!
//! The client checks every outbound command before it is queued and every
//! inbound message before it is correlated. The [`Validator`] trait is the
//! seam; [`SchemaValidator`] checks messages against the command vocabulary
//! compiled in from `commands.yaml` (known protocol, known command for the
//! direction, required payload properties present), and [`NoopValidator`]
//! accepts everything for runtimes that are known to be non-conformant.

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::Deserialize;
use thiserror::Error;

use crate::protocol::{Direction, Message};

const EMBEDDED_COMMANDS: &str = include_str!("commands.yaml");

static VOCABULARY: Lazy<Vocabulary> = Lazy::new(|| {
    serde_yaml::from_str(EMBEDDED_COMMANDS).expect("embedded commands.yaml is valid")
});

// ---------------------------------------------------------------------------
// SchemaPath
// ---------------------------------------------------------------------------

/// Identifies the schema a message is checked against:
/// `/{protocol}/{direction}/{command}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaPath {
    pub protocol: String,
    pub direction: Direction,
    pub command: String,
}

impl SchemaPath {
    pub fn new(protocol: impl Into<String>, direction: Direction, command: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            direction,
            command: command.into(),
        }
    }

    /// Schema path of a message sent by the client.
    pub fn input(message: &Message) -> Self {
        Self::new(message.protocol.clone(), Direction::Input, message.command.clone())
    }

    /// Schema path of a message emitted by the runtime.
    pub fn output(message: &Message) -> Self {
        Self::new(message.protocol.clone(), Direction::Output, message.command.clone())
    }
}

impl fmt::Display for SchemaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", self.protocol, self.direction, self.command)
    }
}

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// A message did not conform to the protocol vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} sent invalid payload for {protocol}:{command}: {detail}", .direction.sender())]
pub struct ValidationError {
    pub direction: Direction,
    pub protocol: String,
    pub command: String,
    pub detail: String,
}

impl ValidationError {
    pub fn new(path: &SchemaPath, detail: impl Into<String>) -> Self {
        Self {
            direction: path.direction,
            protocol: path.protocol.clone(),
            command: path.command.clone(),
            detail: detail.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Checks a message against the schema at `path`.
pub trait Validator: Send + Sync {
    fn validate(&self, path: &SchemaPath, message: &Message) -> Result<(), ValidationError>;
}

/// Accepts every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn validate(&self, _path: &SchemaPath, _message: &Message) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Validates messages against the embedded command vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }
}

impl Validator for SchemaValidator {
    fn validate(&self, path: &SchemaPath, message: &Message) -> Result<(), ValidationError> {
        let Some(required) = VOCABULARY.required(&path.protocol, path.direction, &path.command) else {
            let detail = if VOCABULARY.protocols.contains_key(&path.protocol) {
                format!("unknown command '{}'", path.command)
            } else {
                format!("unknown protocol '{}'", path.protocol)
            };
            return Err(ValidationError::new(path, detail));
        };
        if required.is_empty() {
            return Ok(());
        }
        let Some(payload) = message.payload.as_object() else {
            return Err(ValidationError::new(path, "payload should be an object"));
        };
        let missing: Vec<&str> = required
            .iter()
            .filter(|property| !payload.contains_key(property.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(
                path,
                format!("missing required property {}", missing.join(", ")),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ProtocolCommands {
    #[serde(default)]
    input: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    output: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct Vocabulary {
    protocols: BTreeMap<String, ProtocolCommands>,
}

impl Vocabulary {
    fn required(&self, protocol: &str, direction: Direction, command: &str) -> Option<&Vec<String>> {
        let commands = self.protocols.get(protocol)?;
        match direction {
            Direction::Input => commands.input.get(command),
            Direction::Output => commands.output.get(command),
        }
    }
}

/// Protocols known to the vocabulary.
pub fn protocols() -> Vec<&'static str> {
    VOCABULARY.protocols.keys().map(String::as_str).collect()
}

/// Commands of `protocol` in `direction`, in alphabetical order.
pub fn commands(protocol: &str, direction: Direction) -> Vec<&'static str> {
    let Some(commands) = VOCABULARY.protocols.get(protocol) else {
        return Vec::new();
    };
    let table = match direction {
        Direction::Input => &commands.input,
        Direction::Output => &commands.output,
    };
    table.keys().map(String::as_str).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(direction: Direction, message: &Message) -> Result<(), ValidationError> {
        let path = SchemaPath::new(message.protocol.clone(), direction, message.command.clone());
        SchemaValidator::new().validate(&path, message)
    }

    #[test]
    fn test_valid_input_packet() {
        let message = Message::new(
            "runtime",
            "packet",
            json!({"port": "foo", "event": "connect", "graph": "bar"}),
        );
        assert!(check(Direction::Input, &message).is_ok());
    }

    #[test]
    fn test_invalid_input_packet() {
        let message = Message::new("runtime", "packet", json!({"port": "foo", "event": "connect"}));
        let err = check(Direction::Input, &message).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("Client sent invalid"));
        assert!(text.contains("runtime:packet"));
        assert!(text.contains("graph"));
    }

    #[test]
    fn test_valid_output_ports() {
        let message = Message::new(
            "runtime",
            "ports",
            json!({"graph": "bar", "inPorts": [], "outPorts": []}),
        );
        assert!(check(Direction::Output, &message).is_ok());
    }

    #[test]
    fn test_invalid_output_ports() {
        let message = Message::new("runtime", "ports", json!({"inPorts": [], "outPorts": []}));
        let err = check(Direction::Output, &message).unwrap_err();
        assert!(err.to_string().contains("Runtime sent invalid"));
        assert!(err.to_string().contains("graph"));
        assert_eq!(err.direction, Direction::Output);
    }

    #[test]
    fn test_handshake_without_capabilities_is_invalid() {
        let message = Message::new(
            "runtime",
            "runtime",
            json!({"type": "foo", "version": "0.4", "baz": "bar"}),
        );
        let err = check(Direction::Output, &message).unwrap_err();
        assert!(err.to_string().contains("invalid payload for runtime:runtime"));
    }

    #[test]
    fn test_unknown_command_and_protocol() {
        let unknown_command = Message::new("graph", "explode", json!({}));
        assert!(check(Direction::Input, &unknown_command)
            .unwrap_err()
            .detail
            .contains("unknown command"));

        let unknown_protocol = Message::new("telepathy", "think", json!({}));
        assert!(check(Direction::Input, &unknown_protocol)
            .unwrap_err()
            .detail
            .contains("unknown protocol"));
    }

    #[test]
    fn test_direction_matters() {
        // `componentsready` only ever comes from the runtime.
        let message = Message::new("component", "componentsready", json!(12));
        assert!(check(Direction::Output, &message).is_ok());
        assert!(check(Direction::Input, &message).is_err());
    }

    #[test]
    fn test_non_object_payload_rejected_when_properties_required() {
        let message = Message::new("network", "data", json!("oops"));
        assert!(check(Direction::Output, &message).is_err());
    }

    #[test]
    fn test_noop_validator_accepts_everything() {
        let message = Message::new("telepathy", "think", json!(null));
        let path = SchemaPath::output(&message);
        assert!(NoopValidator.validate(&path, &message).is_ok());
    }

    #[test]
    fn test_schema_path_display() {
        let message = Message::new("graph", "clear", json!({}));
        assert_eq!(SchemaPath::input(&message).to_string(), "/graph/input/clear");
        assert_eq!(SchemaPath::output(&message).to_string(), "/graph/output/clear");
    }

    #[test]
    fn test_vocabulary_listing() {
        let protocols = protocols();
        for protocol in ["component", "graph", "network", "runtime", "trace"] {
            assert!(protocols.contains(&protocol));
        }
        assert_eq!(commands("component", Direction::Input), vec!["getsource", "list", "source"]);
        assert!(commands("nope", Direction::Input).is_empty());
    }
}
