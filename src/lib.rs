//! # fbp-client
//!
//! Client for runtimes speaking the Flow-Based Programming (FBP) network
//! protocol.
//!
//! The crate is organized the way a message travels:
//!
//! - [`protocol`]: messages, signatures, protocol revisions and the rules
//!   that pair a command with its answer.
//! - [`schema`] and [`permissions`]: the command vocabulary and the
//!   capability table every message is checked against.
//! - [`transports`]: how messages reach a runtime.
//! - [`adapter`]: the correlator that sends one command at a time and
//!   settles it with the matching answer.
//! - [`observe`]: subscriptions to unsolicited signals.
//! - [`client`]: the [`FbpClient`] facade tying the above together.

pub mod adapter;
pub mod client;
pub mod errors;
pub mod observe;
pub mod permissions;
pub mod protocol;
pub mod schema;
pub mod transports;

pub use client::{ClientOptions, FbpClient, GraphDefinition, RuntimeDefinition};
pub use errors::{ClientError, ObserveError, ProtocolError, UnexpectedSignal};
pub use observe::{Matcher, SignalHub, Subscription};
pub use permissions::{can_receive, can_send};
pub use protocol::{Direction, Message, ProtocolVersion, Signature};
pub use schema::ValidationError;
pub use transports::{Transport, TransportEvent, TransportType};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
