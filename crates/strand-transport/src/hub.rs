//! Peer table shared by every transport kind.

use crate::{Message, SocketKind, TransportError};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// One attached peer connection
pub trait Link: Send + Sync + 'static {
    /// Hand a message to the peer; must not block
    fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Stop the link, draining queued messages for at most `linger`
    fn close(&self, linger: Option<Duration>);
}

struct Peer {
    identity: Bytes,
    link: Arc<dyn Link>,
}

struct HubState {
    peers: Vec<Peer>,
    cursor: usize,
    inbound: Option<mpsc::UnboundedSender<Message>>,
}

struct HubInner {
    kind: SocketKind,
    state: Mutex<HubState>,
    next_identity: AtomicU64,
    closed: watch::Sender<bool>,
}

/// Shared peer table of one transport socket
#[derive(Clone)]
pub(crate) struct Hub {
    inner: Arc<HubInner>,
}

#[derive(Clone)]
pub(crate) struct WeakHub {
    inner: Weak<HubInner>,
}

impl WeakHub {
    pub(crate) fn upgrade(&self) -> Option<Hub> {
        self.inner.upgrade().map(|inner| Hub { inner })
    }
}

impl Hub {
    pub(crate) fn new(kind: SocketKind) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let hub = Self {
            inner: Arc::new(HubInner {
                kind,
                state: Mutex::new(HubState {
                    peers: Vec::new(),
                    cursor: 0,
                    inbound: Some(tx),
                }),
                next_identity: AtomicU64::new(0),
                closed,
            }),
        };
        (hub, rx)
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn kind(&self) -> SocketKind {
        self.inner.kind
    }

    pub(crate) fn downgrade(&self) -> WeakHub {
        WeakHub {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Allocate the identity frame for a new peer
    pub(crate) fn next_identity(&self) -> Bytes {
        let n = self.inner.next_identity.fetch_add(1, Ordering::Relaxed);
        Bytes::from(format!("peer-{:08x}", n))
    }

    pub(crate) fn attach(&self, identity: Bytes, link: Arc<dyn Link>) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.inbound.is_none() {
            return Err(TransportError::Closed);
        }
        state.peers.push(Peer { identity, link });
        Ok(())
    }

    pub(crate) fn detach(&self, identity: &Bytes) {
        let mut state = self.state();
        let before = state.peers.len();
        state.peers.retain(|peer| &peer.identity != identity);
        if state.peers.len() != before {
            debug!("Peer {} detached", String::from_utf8_lossy(identity));
        }
    }

    /// Accept an inbound message from the peer known as `identity`
    pub(crate) fn deliver(&self, identity: &Bytes, mut message: Message) {
        if self.inner.kind == SocketKind::Router {
            message.insert(0, identity.clone());
        }

        let state = self.state();
        if let Some(inbound) = &state.inbound {
            let _ = inbound.send(message);
        }
    }

    /// Send an outbound message to the right peer
    pub(crate) fn route(&self, mut message: Message) -> Result<(), TransportError> {
        let link = {
            let mut state = self.state();
            if state.inbound.is_none() {
                return Err(TransportError::Closed);
            }

            match self.inner.kind {
                SocketKind::Router => {
                    if message.is_empty() {
                        return Err(TransportError::UnknownPeer(String::new()));
                    }
                    let identity = message.remove(0);
                    state
                        .peers
                        .iter()
                        .find(|peer| peer.identity == identity)
                        .map(|peer| Arc::clone(&peer.link))
                        .ok_or_else(|| {
                            TransportError::UnknownPeer(String::from_utf8_lossy(&identity).into_owned())
                        })?
                }
                SocketKind::Dealer => {
                    if state.peers.is_empty() {
                        return Err(TransportError::NoPeers);
                    }
                    let index = state.cursor % state.peers.len();
                    state.cursor = state.cursor.wrapping_add(1);
                    Arc::clone(&state.peers[index].link)
                }
            }
        };

        link.send(message)
    }

    pub(crate) fn close(&self, linger: Option<Duration>) {
        let peers = {
            let mut state = self.state();
            state.inbound = None;
            std::mem::take(&mut state.peers)
        };

        for peer in peers {
            peer.link.close(linger);
        }
        self.inner.closed.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state().inbound.is_none()
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.state().peers.len()
    }
}
