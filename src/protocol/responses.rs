//! Which inbound commands settle which outbound command.
//!
//! Most commands are answered by a message with the same name. A handful
//! are answered under a different name for historical reasons, and
//! `component:list` is answered by a stream of `component` messages closed by
//! `componentsready`. Every command may also be answered by `error`.

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;

use super::message::Message;
use super::{COMPONENT_PROTOCOL, ERROR_COMMAND, RUNTIME_PROTOCOL};

/// How long a pre-0.7 `runtime:packet` waits for an error before it is
/// assumed delivered.
pub const PACKET_GRACE_PERIOD: Duration = Duration::from_millis(10);

/// Remappings shared by every protocol revision.
const COMMON_REMAPS: &[(&str, &[&str])] = &[
    ("component:getsource", &["source"]),
    ("component:source", &["component"]),
    ("component:list", &["component", "componentsready"]),
    ("network:start", &["started"]),
    ("network:stop", &["stopped"]),
    ("network:getstatus", &["status"]),
];

pub(crate) static LEGACY_RESPONSES: Lazy<ResponseTable> = Lazy::new(|| {
    // A 0.6 runtime never answers a packet; only `error` may settle it early.
    ResponseTable::build(&[("runtime:packet", &[])], Deadline::Grace(PACKET_GRACE_PERIOD))
});

pub(crate) static ACKNOWLEDGED_RESPONSES: Lazy<ResponseTable> = Lazy::new(|| {
    ResponseTable::build(&[("runtime:packet", &["packetsent"])], Deadline::Standard)
});

// ---------------------------------------------------------------------------
// Deadline / Aggregate
// ---------------------------------------------------------------------------

/// When an in-flight command stops waiting for its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Wait indefinitely.
    Never,
    /// Resolve with the command's own payload once the window passes
    /// without an error.
    Grace(Duration),
    /// Reject with a timeout after the configured command timeout.
    Standard,
}

/// Multi-message answer: `item` messages are collected until `terminator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregate {
    pub item: &'static str,
    pub terminator: &'static str,
}

const COMPONENT_LIST: Aggregate = Aggregate {
    item: "component",
    terminator: "componentsready",
};

// ---------------------------------------------------------------------------
// Expectation
// ---------------------------------------------------------------------------

/// Everything the dispatcher needs to know to correlate one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    protocol: String,
    responses: Vec<String>,
    aggregate: Option<Aggregate>,
    deadline: Deadline,
}

impl Expectation {
    /// Expectation for the bootstrap `runtime:getruntime` request.
    pub fn handshake() -> Self {
        Self {
            protocol: RUNTIME_PROTOCOL.to_string(),
            responses: vec!["runtime".to_string()],
            aggregate: None,
            deadline: Deadline::Standard,
        }
    }

    /// Protocol the answer must arrive on.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Success command names, in declaration order. `error` is implied.
    pub fn responses(&self) -> &[String] {
        &self.responses
    }

    pub fn aggregate(&self) -> Option<Aggregate> {
        self.aggregate
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Whether `message` is an answer (success or error) to this command.
    pub fn accepts(&self, message: &Message) -> bool {
        message.protocol == self.protocol
            && (message.command == ERROR_COMMAND
                || self.responses.iter().any(|r| *r == message.command))
    }
}

// ---------------------------------------------------------------------------
// ResponseTable
// ---------------------------------------------------------------------------

/// Per-revision correlation rules, keyed by `protocol:command`.
#[derive(Debug)]
pub struct ResponseTable {
    remaps: HashMap<&'static str, &'static [&'static str]>,
    packet_deadline: Deadline,
}

impl ResponseTable {
    fn build(
        overrides: &[(&'static str, &'static [&'static str])],
        packet_deadline: Deadline,
    ) -> Self {
        let remaps = COMMON_REMAPS
            .iter()
            .chain(overrides.iter())
            .copied()
            .collect();
        Self {
            remaps,
            packet_deadline,
        }
    }

    /// Build the expectation for sending `protocol:command`.
    pub fn expectation(&self, protocol: &str, command: &str) -> Expectation {
        let key = format!("{protocol}:{command}");
        let responses = match self.remaps.get(key.as_str()) {
            Some(names) => names.iter().map(|n| n.to_string()).collect(),
            None => vec![command.to_string()],
        };
        let aggregate = (key == "component:list").then_some(COMPONENT_LIST);
        let deadline = if protocol == COMPONENT_PROTOCOL {
            Deadline::Never
        } else if key == "runtime:packet" {
            self.packet_deadline
        } else {
            Deadline::Standard
        };
        Expectation {
            protocol: protocol.to_string(),
            responses,
            aggregate,
            deadline,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
