//! TCP transport (`tcp://host:port`).
//!
//! Each TCP connection is one peer link. Messages are framed with
//! `strand_core::framing` so frame boundaries survive the byte stream.

use crate::hub::{Hub, Link, WeakHub};
use crate::{Endpoint, Message, TransportError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use strand_core::framing::{encode_message, MessageParser};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Read buffer size per connection
const READ_BUFFER_SIZE: usize = 16 * 1024;

enum WriterCommand {
    Message(Bytes),
    Close(Option<Duration>),
}

/// Link backed by a connection's writer task
struct TcpLink {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl Link for TcpLink {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        self.tx
            .send(WriterCommand::Message(encode_message(&message)))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, linger: Option<Duration>) {
        let _ = self.tx.send(WriterCommand::Close(linger));
    }
}

pub(crate) async fn bind(hub: &Hub, addr: &str) -> Result<Endpoint, TransportError> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            TransportError::AddressInUse(format!("tcp://{}", addr))
        } else {
            TransportError::from(e)
        }
    })?;

    let local_addr = listener.local_addr()?;
    info!("Strand transport listening on tcp://{}", local_addr);

    let weak = hub.downgrade();
    let closed = hub.closed_signal();
    tokio::spawn(accept_loop(listener, weak, closed));

    Ok(Endpoint::Tcp(local_addr.to_string()))
}

pub(crate) async fn connect(hub: &Hub, addr: &str) -> Result<Endpoint, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionRefused(format!("tcp://{}: {}", addr, e)))?;

    let peer_addr = stream.peer_addr()?;
    attach_stream(hub, stream)?;
    debug!("Connected to tcp://{}", peer_addr);

    Ok(Endpoint::Tcp(peer_addr.to_string()))
}

async fn accept_loop(listener: TcpListener, hub: WeakHub, mut closed: watch::Receiver<bool>) {
    loop {
        if *closed.borrow() {
            break;
        }

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    let Some(hub) = hub.upgrade() else { break };
                    debug!("Accepted connection from {}", remote_addr);
                    if let Err(e) = attach_stream(&hub, stream) {
                        debug!("Dropping connection from {}: {}", remote_addr, e);
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                }
            },
            _ = closed.changed() => break,
        }
    }
}

fn attach_stream(hub: &Hub, stream: TcpStream) -> Result<(), TransportError> {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let identity = hub.next_identity();

    let (tx, rx) = mpsc::unbounded_channel();
    hub.attach(identity.clone(), Arc::new(TcpLink { tx }))?;

    tokio::spawn(write_loop(writer, rx));
    tokio::spawn(read_loop(reader, hub.downgrade(), identity, hub.closed_signal()));
    Ok(())
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Message(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!("Write failed: {}", e);
                    return;
                }
            }
            WriterCommand::Close(linger) => {
                rx.close();
                let drain = async {
                    while let Some(WriterCommand::Message(bytes)) = rx.recv().await {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                };
                match linger {
                    Some(linger) => {
                        let _ = tokio::time::timeout(linger, drain).await;
                    }
                    None => drain.await,
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    hub: WeakHub,
    identity: Bytes,
    mut closed: watch::Receiver<bool>,
) {
    let mut parser = MessageParser::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'read: loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Read failed: {}", e);
                    break;
                }
            },
            _ = closed.changed() => break,
        };

        parser.feed(&buf[..n]);
        loop {
            match parser.parse_message() {
                Ok(Some(message)) => match hub.upgrade() {
                    Some(hub) => hub.deliver(&identity, message),
                    None => return,
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping peer after framing error: {}", e);
                    break 'read;
                }
            }
        }
    }

    if let Some(hub) = hub.upgrade() {
        hub.detach(&identity);
    }
}
