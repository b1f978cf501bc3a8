//! Error types for the FBP client.
//!
//! `ClientError` is what a caller awaiting a command sees. `ProtocolError`
//! describes a runtime that broke the protocol; it is broadcast to every
//! signal subscription and only becomes a `ClientError` when the offending
//! message was the answer a command was waiting for. `ObserveError` settles
//! a [`Subscription::until`](crate::observe::Subscription::until) wait.

use std::fmt;

use thiserror::Error;

use crate::protocol::{Message, Signature};
use crate::schema::ValidationError;

/// The runtime sent something the client cannot accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The message failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// The runtime sent a message the granted capabilities do not cover.
    #[error("Not permitted to receive {protocol}:{command} messages")]
    NotPermitted { protocol: String, command: String },
}

impl ProtocolError {
    /// Signature of the offending message.
    pub fn signature(&self) -> Signature {
        match self {
            ProtocolError::Invalid(err) => Signature::new(err.protocol.clone(), err.command.clone()),
            ProtocolError::NotPermitted { protocol, command } => {
                Signature::new(protocol.clone(), command.clone())
            }
        }
    }
}

/// Failure of a client operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The outbound payload did not validate; nothing was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The granted capabilities do not allow sending this command.
    #[error("Not permitted to send {protocol}:{command} messages")]
    PermissionDenied { protocol: String, command: String },

    /// The answer to this command broke the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The runtime answered with an `error` message.
    #[error("{message}")]
    Remote {
        message: String,
        stack: Option<String>,
    },

    /// No answer arrived within the command timeout.
    #[error("{protocol}:{command} timed out")]
    Timeout { protocol: String, command: String },

    /// The runtime did not complete the handshake in time.
    #[error("Connection to {address} timed out")]
    ConnectionTimeout { address: String },

    /// The transport went away while the command was in flight.
    #[error("{protocol}:{command} failed: runtime disconnected")]
    Disconnected { protocol: String, command: String },

    /// The transport reported an error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Commands require at least one completed handshake.
    #[error("FBP client must be connected to the runtime before sending commands")]
    NotConnected,

    #[error("Unsupported FBP protocol version {0}")]
    UnsupportedVersion(String),

    #[error("Unsupported FBP transport {0}")]
    UnsupportedTransport(String),

    /// The runtime definition or graph is unusable.
    #[error("{0}")]
    InvalidDefinition(String),

    /// The dispatcher has shut down.
    #[error("FBP client has been shut down")]
    Closed,
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. } | ClientError::ConnectionTimeout { .. })
    }

    pub(crate) fn transport(err: anyhow::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Observation errors
// ---------------------------------------------------------------------------

/// A signal matched a failure pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct UnexpectedSignal {
    /// The signal's `error` payload field, or a generic description.
    pub message: String,
    /// Signature of the signal that matched.
    pub signature: Signature,
    /// Remote stack trace, when the payload carried one.
    pub stack: Option<String>,
    /// Signals observed up to and including the failing one.
    pub signals: Vec<Message>,
}

impl UnexpectedSignal {
    /// Build the error from the failing signal and the history leading to it.
    pub fn from_signal(signal: &Message, signals: Vec<Message>) -> Self {
        let signature = signal.signature();
        let message = signal
            .payload_str("error")
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unexpected {signature} message"));
        Self {
            message,
            signature,
            stack: signal.payload_str("stack").map(str::to_string),
            signals,
        }
    }
}

impl fmt::Display for UnexpectedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for UnexpectedSignal {}

/// Failure of a signal wait.
#[derive(Debug, Error)]
pub enum ObserveError {
    #[error(transparent)]
    Unexpected(UnexpectedSignal),

    /// The runtime broke the protocol while the wait was active.
    #[error("{error}")]
    Protocol {
        error: ProtocolError,
        signals: Vec<Message>,
    },

    /// The client shut down before the wait settled.
    #[error("signal feed closed")]
    Closed,
}

impl ObserveError {
    /// Signals observed before the wait failed.
    pub fn signals(&self) -> &[Message] {
        match self {
            ObserveError::Unexpected(err) => &err.signals,
            ObserveError::Protocol { signals, .. } => signals,
            ObserveError::Closed => &[],
        }
    }
}
