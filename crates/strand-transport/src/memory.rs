//! In-process transport (`inproc://name`).
//!
//! Peers in the same process exchange messages by handing them straight to
//! each other's inbound queue. Delivery is immediate and ordered.

use crate::hub::{Hub, Link, WeakHub};
use crate::{Endpoint, Message, TransportError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tracing::debug;

fn registry() -> &'static Mutex<HashMap<String, WeakHub>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, WeakHub>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Link that delivers into another in-process socket
struct MemoryLink {
    /// The socket on the far side
    target: WeakHub,
    /// Identity the far side knows us by
    identity: Bytes,
}

impl Link for MemoryLink {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        let target = self.target.upgrade().ok_or(TransportError::Closed)?;
        if target.is_closed() {
            return Err(TransportError::Closed);
        }
        target.deliver(&self.identity, message);
        Ok(())
    }

    fn close(&self, _linger: Option<Duration>) {
        if let Some(target) = self.target.upgrade() {
            target.detach(&self.identity);
        }
    }
}

pub(crate) fn bind(hub: &Hub, name: &str) -> Result<Endpoint, TransportError> {
    let mut registry = registry().lock().unwrap_or_else(PoisonError::into_inner);

    let taken = registry
        .get(name)
        .and_then(WeakHub::upgrade)
        .is_some_and(|existing| !existing.is_closed());
    if taken {
        return Err(TransportError::AddressInUse(format!("inproc://{}", name)));
    }

    registry.insert(name.to_string(), hub.downgrade());
    debug!("Bound inproc://{}", name);
    Ok(Endpoint::Inproc(name.to_string()))
}

pub(crate) fn connect(hub: &Hub, name: &str) -> Result<Endpoint, TransportError> {
    let remote = registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .and_then(WeakHub::upgrade)
        .filter(|remote| !remote.is_closed())
        .ok_or_else(|| TransportError::ConnectionRefused(format!("inproc://{}", name)))?;

    let local_identity = hub.next_identity();
    let remote_identity = remote.next_identity();

    // Each side's link delivers into the other under the identity the
    // receiver assigned to the sender.
    remote.attach(
        remote_identity.clone(),
        Arc::new(MemoryLink {
            target: hub.downgrade(),
            identity: local_identity.clone(),
        }),
    )?;
    hub.attach(
        local_identity,
        Arc::new(MemoryLink {
            target: remote.downgrade(),
            identity: remote_identity,
        }),
    )?;

    debug!("Connected to inproc://{}", name);
    Ok(Endpoint::Inproc(name.to_string()))
}

#[cfg(test)]
mod tests {
    use crate::Transport;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_router_dealer_exchange() {
        let (router, mut router_rx) = Transport::router();
        router.bind("inproc://memory-exchange").await.unwrap();

        let (dealer, mut dealer_rx) = Transport::dealer();
        dealer.connect("inproc://memory-exchange").await.unwrap();

        dealer
            .send(vec![Bytes::new(), Bytes::from_static(b"hello")])
            .unwrap();

        let request = router_rx.recv().await.unwrap();
        assert_eq!(request.len(), 3);
        assert_eq!(&request[2][..], b"hello");

        // Reply through the envelope the router added
        router
            .send(vec![request[0].clone(), Bytes::new(), Bytes::from_static(b"world")])
            .unwrap();

        let reply = dealer_rx.recv().await.unwrap();
        assert_eq!(reply, vec![Bytes::new(), Bytes::from_static(b"world")]);
    }

    #[tokio::test]
    async fn test_bind_twice_fails() {
        let (first, _rx1) = Transport::router();
        first.bind("inproc://memory-twice").await.unwrap();

        let (second, _rx2) = Transport::router();
        assert!(second.bind("inproc://memory-twice").await.is_err());

        first.close(None);
        second.bind("inproc://memory-twice").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (dealer, _rx) = Transport::dealer();
        assert!(dealer.connect("inproc://memory-nobody").await.is_err());
    }

    #[tokio::test]
    async fn test_close_detaches_peer() {
        let (router, _router_rx) = Transport::router();
        router.bind("inproc://memory-detach").await.unwrap();

        let (dealer, _dealer_rx) = Transport::dealer();
        dealer.connect("inproc://memory-detach").await.unwrap();
        assert_eq!(router.peer_count(), 1);

        dealer.close(None);
        assert_eq!(router.peer_count(), 0);
    }
}
