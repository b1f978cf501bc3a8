//! Capability gate.
//!
//! A runtime announces a list of capability tokens in its `runtime:runtime`
//! handshake message. Each token authorizes a fixed set of messages the
//! client may send (`inputs`) and receive (`outputs`). The table is compiled
//! into the binary from `capabilities.yaml` and never changes at runtime, so
//! the checks here are pure and safe to call from any thread.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::protocol::Direction;

const EMBEDDED_CAPABILITIES: &str = include_str!("capabilities.yaml");

static TABLE: Lazy<CapabilityTable> = Lazy::new(|| {
    CapabilityTable::from_yaml(EMBEDDED_CAPABILITIES).expect("embedded capabilities.yaml is valid")
});

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// One capability as declared in the table.
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CapabilityFile {
    capabilities: Vec<CapabilityDefinition>,
}

/// Reverse index from `protocol:command` to the capabilities allowing it.
#[derive(Debug)]
struct CapabilityTable {
    definitions: Vec<CapabilityDefinition>,
    inputs: HashMap<String, HashSet<String>>,
    outputs: HashMap<String, HashSet<String>>,
}

impl CapabilityTable {
    fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        let file: CapabilityFile = serde_yaml::from_str(content)?;
        let mut inputs: HashMap<String, HashSet<String>> = HashMap::new();
        let mut outputs: HashMap<String, HashSet<String>> = HashMap::new();
        for capability in &file.capabilities {
            for signature in &capability.inputs {
                inputs
                    .entry(signature.clone())
                    .or_default()
                    .insert(capability.name.clone());
            }
            for signature in &capability.outputs {
                outputs
                    .entry(signature.clone())
                    .or_default()
                    .insert(capability.name.clone());
            }
        }
        Ok(Self {
            definitions: file.capabilities,
            inputs,
            outputs,
        })
    }

    fn allowing(&self, direction: Direction, signature: &str) -> Option<&HashSet<String>> {
        match direction {
            Direction::Input => self.inputs.get(signature),
            Direction::Output => self.outputs.get(signature),
        }
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// All capabilities known to the client.
pub fn definitions() -> &'static [CapabilityDefinition] {
    &TABLE.definitions
}

/// Names of the capabilities that authorize `protocol:command` in `direction`.
pub fn allowing_capabilities(protocol: &str, command: &str, direction: Direction) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = TABLE
        .allowing(direction, &format!("{protocol}:{command}"))
        .map(|set| set.iter().map(String::as_str).collect())
        .unwrap_or_default();
    names.sort_unstable();
    names
}

fn permitted<S: AsRef<str>>(
    direction: Direction,
    protocol: &str,
    command: &str,
    capabilities: &[S],
) -> bool {
    let Some(allowed) = TABLE.allowing(direction, &format!("{protocol}:{command}")) else {
        return false;
    };
    capabilities.iter().any(|c| allowed.contains(c.as_ref()))
}

/// Whether a client holding `capabilities` may send `protocol:command`.
///
/// `runtime:getruntime` is always allowed: it is how capabilities are
/// discovered in the first place.
pub fn can_send<S: AsRef<str>>(protocol: &str, command: &str, capabilities: &[S]) -> bool {
    if protocol == "runtime" && command == "getruntime" {
        return true;
    }
    permitted(Direction::Input, protocol, command, capabilities)
}

/// Whether a client holding `capabilities` may receive `protocol:command`.
///
/// `runtime:runtime` is always allowed: it carries the capabilities.
pub fn can_receive<S: AsRef<str>>(protocol: &str, command: &str, capabilities: &[S]) -> bool {
    if protocol == "runtime" && command == "runtime" {
        return true;
    }
    permitted(Direction::Output, protocol, command, capabilities)
}

// ---------------------------------------------------------------------------
// CapabilityStore
// ---------------------------------------------------------------------------

/// The capability set granted by the most recent handshake.
///
/// Readers take a snapshot `Arc`; a new handshake swaps in a whole new set,
/// so a check never observes a half-updated list.
#[derive(Debug, Default)]
pub struct CapabilityStore {
    current: RwLock<Arc<Vec<String>>>,
}

impl CapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current capability set.
    pub fn snapshot(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.current.read())
    }

    /// Replace the capability set wholesale.
    pub fn replace(&self, capabilities: Vec<String>) {
        *self.current.write() = Arc::new(capabilities);
    }

    pub fn can_send(&self, protocol: &str, command: &str) -> bool {
        can_send(protocol, command, self.snapshot().as_slice())
    }

    pub fn can_receive(&self, protocol: &str, command: &str) -> bool {
        can_receive(protocol, command, self.snapshot().as_slice())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: &[&str] = &[];

    #[test]
    fn test_getruntime_always_sendable() {
        assert!(can_send("runtime", "getruntime", NONE));
    }

    #[test]
    fn test_network_start_send_permissions() {
        assert!(!can_send("network", "start", NONE));
        assert!(!can_send("network", "start", &["network:status"]));
        assert!(can_send("network", "start", &["protocol:network"]));
        assert!(can_send("network", "start", &["network:control"]));
    }

    #[test]
    fn test_runtime_always_receivable() {
        assert!(can_receive("runtime", "runtime", NONE));
    }

    #[test]
    fn test_network_started_receive_permissions() {
        assert!(!can_receive("network", "started", NONE));
        assert!(can_receive("network", "started", &["protocol:network"]));
        assert!(can_receive("network", "started", &["network:control"]));
        assert!(can_receive("network", "started", &["network:status"]));
        assert!(!can_receive("network", "started", &["component:getsource"]));
    }

    #[test]
    fn test_graph_clear_receive_permissions() {
        assert!(!can_receive("graph", "clear", NONE));
        assert!(can_receive("graph", "clear", &["protocol:graph"]));
        assert!(can_receive("graph", "clear", &["graph:readonly"]));
        assert!(!can_send("graph", "clear", &["graph:readonly"]));
    }

    #[test]
    fn test_packet_requires_runtime_protocol() {
        let limited = ["protocol:graph", "network:control"];
        assert!(!can_send("runtime", "packet", &limited));
        assert!(!can_receive("runtime", "packet", &limited));
        assert!(can_send("runtime", "packet", &["protocol:runtime"]));
    }

    #[test]
    fn test_unknown_signature_is_denied() {
        assert!(!can_send("graph", "explode", &["protocol:graph"]));
        assert!(!can_receive("nope", "nothing", &["protocol:graph"]));
    }

    #[test]
    fn test_unknown_capabilities_are_ignored() {
        assert!(!can_send("network", "start", &["network:everything", "admin"]));
        assert!(can_send("network", "start", &["admin", "network:control"]));
    }

    #[test]
    fn test_allowing_capabilities() {
        assert_eq!(
            allowing_capabilities("network", "start", Direction::Input),
            vec!["network:control", "protocol:network"]
        );
        assert!(allowing_capabilities("graph", "clear", Direction::Input)
            .iter()
            .all(|c| *c != "graph:readonly"));
    }

    #[test]
    fn test_definitions_loaded() {
        let names: Vec<&str> = definitions().iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"protocol:graph"));
        assert!(names.contains(&"network:data"));
        assert!(names.contains(&"protocol:trace"));
    }

    #[test]
    fn test_store_replaces_wholesale() {
        let store = CapabilityStore::new();
        assert!(!store.can_send("network", "start"));

        let before = store.snapshot();
        store.replace(vec!["network:control".into()]);
        assert!(store.can_send("network", "start"));
        // Earlier snapshots keep seeing the earlier set.
        assert!(before.is_empty());

        store.replace(vec!["protocol:graph".into()]);
        assert!(!store.can_send("network", "start"));
        assert!(store.can_send("graph", "addnode"));
    }
}
