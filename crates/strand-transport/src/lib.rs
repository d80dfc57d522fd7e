//! Transport layer implementations for Strand.
//!
//! A transport socket moves multi-frame messages between peers, in order
//! per peer, with no flow control of its own. Two socket kinds exist:
//! - Router: prefixes every inbound message with the sending peer's
//!   identity frame and routes every outbound message by its first frame
//! - Dealer: passes messages through untouched, spreading outbound
//!   messages round-robin over its peers
//!
//! Endpoints are `inproc://name` (same process) or `tcp://host:port`.

mod hub;
pub mod memory;
pub mod tcp;

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use strand_core::StrandError;
use tokio::sync::mpsc;

pub use hub::Link;
use hub::Hub;

/// A transport message: an ordered list of frames
pub type Message = Vec<Bytes>;

/// Transport error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    #[error("No route to peer {0}")]
    UnknownPeer(String),

    #[error("No connected peers")]
    NoPeers,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Address already in use: {0}")]
    AddressInUse(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<TransportError> for StrandError {
    fn from(err: TransportError) -> Self {
        StrandError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Socket kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Router,
    Dealer,
}

/// Parsed transport endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `inproc://name`
    Inproc(String),
    /// `tcp://host:port`
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, address) = s
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidEndpoint(s.to_string()))?;

        if address.is_empty() {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }

        match scheme {
            "inproc" => Ok(Endpoint::Inproc(address.to_string())),
            "tcp" => Ok(Endpoint::Tcp(address.replacen('*', "0.0.0.0", 1))),
            _ => Err(TransportError::InvalidEndpoint(s.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inproc(name) => write!(f, "inproc://{}", name),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Receiving half of a transport socket
#[derive(Debug)]
pub struct MessageReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MessageReceiver {
    /// Wait for the next inbound message; `None` once the socket is closed
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Sending and control half of a transport socket
///
/// Cheap to clone; every clone drives the same socket.
#[derive(Clone)]
pub struct Transport {
    hub: Hub,
}

impl Transport {
    /// Create a new socket of the given kind
    pub fn new(kind: SocketKind) -> (Self, MessageReceiver) {
        let (hub, rx) = Hub::new(kind);
        (Self { hub }, MessageReceiver { rx })
    }

    /// Create a router socket (server side)
    pub fn router() -> (Self, MessageReceiver) {
        Self::new(SocketKind::Router)
    }

    /// Create a dealer socket (client side)
    pub fn dealer() -> (Self, MessageReceiver) {
        Self::new(SocketKind::Dealer)
    }

    pub fn kind(&self) -> SocketKind {
        self.hub.kind()
    }

    /// Accept peers on an endpoint, returning the endpoint actually bound
    ///
    /// Binding `tcp://host:0` picks a free port; the returned endpoint
    /// carries it.
    pub async fn bind(&self, endpoint: &str) -> Result<Endpoint, TransportError> {
        match endpoint.parse()? {
            Endpoint::Inproc(name) => memory::bind(&self.hub, &name),
            Endpoint::Tcp(addr) => tcp::bind(&self.hub, &addr).await,
        }
    }

    /// Connect to a peer listening on an endpoint
    pub async fn connect(&self, endpoint: &str) -> Result<Endpoint, TransportError> {
        match endpoint.parse()? {
            Endpoint::Inproc(name) => memory::connect(&self.hub, &name),
            Endpoint::Tcp(addr) => tcp::connect(&self.hub, &addr).await,
        }
    }

    /// Queue a message for delivery; never blocks
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        self.hub.route(message)
    }

    /// Close the socket
    ///
    /// `linger` bounds how long queued outbound messages may keep draining;
    /// `None` waits until they are written.
    pub fn close(&self, linger: Option<Duration>) {
        self.hub.close(linger);
    }

    pub fn is_closed(&self) -> bool {
        self.hub.is_closed()
    }

    /// Number of currently attached peers
    pub fn peer_count(&self) -> usize {
        self.hub.peer_count()
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind())
            .field("peers", &self.peer_count())
            .finish()
    }
}
