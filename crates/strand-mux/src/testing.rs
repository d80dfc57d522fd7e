//! Raw transport peers for exercising channels from the wire side

use crate::channel::Channel;
use crate::config::SocketConfig;
use crate::socket::MultiplexingSocket;
use bytes::Bytes;
use std::time::Duration;
use strand_core::{Event, Header, StrandError, Value};
use strand_transport::{MessageReceiver, Transport};
use tokio::sync::{mpsc, oneshot};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Router-side multiplexing socket with a raw dealer peer
pub(crate) async fn raw_peer(
    name: &str,
    config: SocketConfig,
) -> (MultiplexingSocket, Transport, MessageReceiver) {
    let socket = MultiplexingSocket::router(config);
    socket.bind(&format!("inproc://{}", name)).await.unwrap();

    let (peer, peer_rx) = Transport::dealer();
    peer.connect(&format!("inproc://{}", name)).await.unwrap();
    (socket, peer, peer_rx)
}

/// Dealer-side multiplexing socket with a raw router peer
pub(crate) async fn raw_server(
    name: &str,
    config: SocketConfig,
) -> (MultiplexingSocket, Transport, MessageReceiver) {
    let (server, server_rx) = Transport::router();
    server.bind(&format!("inproc://{}", name)).await.unwrap();

    let socket = MultiplexingSocket::dealer(config);
    socket.connect(&format!("inproc://{}", name)).await.unwrap();
    (socket, server, server_rx)
}

pub(crate) fn send_raw(transport: &Transport, envelope: Vec<Bytes>, header: Header, name: &str, args: Vec<Value>) {
    let event = Event::new(envelope, header, name, args);
    transport.send(event.serialize().unwrap()).unwrap();
}

pub(crate) async fn next_event(rx: &mut MessageReceiver) -> Event {
    let message = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    Event::from_message(message).unwrap()
}

/// Fail if another event shows up within `quiet`
pub(crate) async fn assert_silent(rx: &mut MessageReceiver, quiet: Duration) {
    if let Ok(Some(message)) = tokio::time::timeout(quiet, rx.recv()).await {
        panic!("unexpected event: {:?}", Event::from_message(message).map(|e| e.name));
    }
}

pub(crate) fn collect_events(channel: &Channel) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.register(move |_, event, _| {
        let _ = tx.send(event.clone());
    });
    rx
}

pub(crate) fn closed_reason(channel: &Channel) -> oneshot::Receiver<Option<StrandError>> {
    let (tx, rx) = oneshot::channel();
    channel.on_closed(move |reason| {
        let _ = tx.send(reason.cloned());
    });
    rx
}

/// Poll until `done` holds
pub(crate) async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
}
