//! FBP protocol vocabulary shared by every layer of the client.
//!
//! This module provides the message envelope exchanged with a runtime, the
//! `protocol:command` signatures used for pattern matching, the negotiated
//! protocol version, and the per-version table describing which inbound
//! command answers which outbound command.

pub mod message;
pub mod responses;
pub mod version;

pub use message::{Direction, Message, Signature, SignatureParseError};
pub use responses::{Aggregate, Deadline, Expectation, ResponseTable, PACKET_GRACE_PERIOD};
pub use version::ProtocolVersion;

/// Command name a runtime uses to report a failed request on any protocol.
pub const ERROR_COMMAND: &str = "error";

/// Protocol carrying the handshake and exported-port packets.
pub const RUNTIME_PROTOCOL: &str = "runtime";

/// Protocol whose commands may perform slow I/O on the runtime side.
pub const COMPONENT_PROTOCOL: &str = "component";
