//! Error types and the remote error model.

use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Strand error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StrandError {
    /// A received message violated the event encoding contract
    #[error("Invalid event: {0}")]
    MalformedEvent(String),

    /// A peer sent a control or reply event we cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    TimeoutExpired(String),

    /// Legacy heartbeat middleware gave up on the peer
    #[error("{0}")]
    LostRemote(String),

    /// Channel-owned heartbeat gave up on the peer
    #[error("{0}")]
    HeartbeatError(String),

    #[error("Cannot send on closed channel {0}")]
    ChannelClosed(String),

    /// Error raised by the remote handler and carried by an `ERR` event
    #[error("{0}")]
    Remote(RemoteError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Framing error: {0}")]
    Framing(String),

    /// Local API misuse, such as replying after a call has finished
    #[error("{0}")]
    Usage(String),
}

impl StrandError {
    /// Kind name of the error, as reported to callers and peers
    pub fn name(&self) -> &str {
        match self {
            StrandError::MalformedEvent(_) => "MalformedEvent",
            StrandError::Protocol(_) => "ProtocolError",
            StrandError::TimeoutExpired(_) => "TimeoutExpired",
            StrandError::LostRemote(_) => "LostRemote",
            StrandError::HeartbeatError(_) => "HeartbeatError",
            StrandError::ChannelClosed(_) => "ChannelClosed",
            StrandError::Remote(remote) => &remote.kind,
            StrandError::Transport(_) => "TransportError",
            StrandError::Framing(_) => "FramingError",
            StrandError::Usage(_) => "UsageError",
        }
    }

    /// Human-readable message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            StrandError::MalformedEvent(m)
            | StrandError::Protocol(m)
            | StrandError::TimeoutExpired(m)
            | StrandError::LostRemote(m)
            | StrandError::HeartbeatError(m)
            | StrandError::ChannelClosed(m)
            | StrandError::Transport(m)
            | StrandError::Framing(m)
            | StrandError::Usage(m) => m,
            StrandError::Remote(remote) => &remote.message,
        }
    }

    /// Convert into the `{kind, message, trace}` record sent in an `ERR` event
    pub fn into_remote(self) -> RemoteError {
        match self {
            StrandError::Remote(remote) => remote,
            other => RemoteError::new(other.name().to_string(), other.message().to_string()),
        }
    }
}

impl From<RemoteError> for StrandError {
    fn from(remote: RemoteError) -> Self {
        StrandError::Remote(remote)
    }
}

/// Application error propagated verbatim from a remote handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error kind, e.g. the exception class name on the remote side
    pub kind: String,

    /// Human-readable explanation
    pub message: String,

    /// Remote stack trace, if the peer sent one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl RemoteError {
    /// Create a new remote error with the given kind and message
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    /// Set the trace field
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Arguments of the `ERR` event carrying this error: `[kind, message, trace]`
    pub fn to_args(&self) -> Vec<Value> {
        vec![
            Value::from(self.kind.as_str()),
            Value::from(self.message.as_str()),
            self.trace
                .as_deref()
                .map(Value::from)
                .unwrap_or(Value::Nil),
        ]
    }

    /// Parse the arguments of an `ERR` event
    pub fn from_args(args: &[Value]) -> Result<Self, StrandError> {
        let [kind, message, trace] = args else {
            return Err(StrandError::Protocol(format!(
                "Bad error: expected 3 arguments, got {}",
                args.len()
            )));
        };

        let text = |value: &Value| match value {
            Value::String(s) => s.as_str().map(str::to_string),
            Value::Nil => None,
            other => Some(other.to_string()),
        };

        Ok(Self {
            kind: text(kind).unwrap_or_else(|| "Error".to_string()),
            message: text(message).unwrap_or_default(),
            trace: text(trace),
        })
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
