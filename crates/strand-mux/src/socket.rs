//! Multiplexing socket: many channels over one transport socket.
//!
//! Every inbound event is routed by its `response_to` header. Events that
//! answer a known channel go to that channel; everything else is handed to
//! the socket's call handlers, which decide whether to open a channel for it.

use crate::channel::{Channel, ChannelState, Origin};
use crate::config::SocketConfig;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use strand_core::{Event, IdGenerator, StrandError};
use strand_transport::{Endpoint, Message, MessageReceiver, Transport};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Socket-level errors kept for slow subscribers
const ERROR_BACKLOG: usize = 64;

/// Handler for events that belong to no open channel
pub type CallHandler = Arc<dyn Fn(&MultiplexingSocket, Event) + Send + Sync>;

pub(crate) struct SocketCore {
    transport: Transport,
    config: SocketConfig,
    ids: Arc<IdGenerator>,
    channels: Mutex<HashMap<String, Channel>>,
    call_handlers: Mutex<Vec<CallHandler>>,
    errors: broadcast::Sender<StrandError>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SocketCore {
    /// Serialize and send an event; failures become socket errors
    pub(crate) fn send_event(&self, event: &Event) {
        let sent = event
            .serialize()
            .and_then(|frames| self.transport.send(frames).map_err(StrandError::from));
        if let Err(e) = sent {
            self.emit_error(e);
        }
    }

    pub(crate) fn emit_error(&self, error: StrandError) {
        warn!("Socket error: {}", error);
        // No subscribers is fine
        let _ = self.errors.send(error);
    }

    /// Forget a closed channel, unless its id has since been reused
    pub(crate) fn remove_channel(&self, channel: &Channel) {
        let mut channels = lock(&self.channels);
        if channels
            .get(channel.id())
            .is_some_and(|current| current.ptr_eq(channel))
        {
            channels.remove(channel.id());
        }
    }
}

/// A transport socket carrying many independent channels
///
/// Cheap to clone; every clone drives the same socket. Must be created
/// inside a Tokio runtime.
#[derive(Clone)]
pub struct MultiplexingSocket {
    core: Arc<SocketCore>,
}

impl MultiplexingSocket {
    /// Wrap a transport socket and start routing its inbound messages
    pub fn new(transport: Transport, receiver: MessageReceiver, config: SocketConfig) -> Self {
        Self::with_ids(transport, receiver, config, IdGenerator::new())
    }

    /// Like `new`, with a caller-supplied id generator
    pub fn with_ids(
        transport: Transport,
        receiver: MessageReceiver,
        config: SocketConfig,
        ids: IdGenerator,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_BACKLOG);
        let core = Arc::new(SocketCore {
            transport,
            config,
            ids: Arc::new(ids),
            channels: Mutex::new(HashMap::new()),
            call_handlers: Mutex::new(Vec::new()),
            errors,
        });

        tokio::spawn(receive_loop(Arc::downgrade(&core), receiver));
        Self { core }
    }

    /// Multiplexing socket over a new router transport (server side)
    pub fn router(config: SocketConfig) -> Self {
        let (transport, receiver) = Transport::router();
        Self::new(transport, receiver, config)
    }

    /// Multiplexing socket over a new dealer transport (client side)
    pub fn dealer(config: SocketConfig) -> Self {
        let (transport, receiver) = Transport::dealer();
        Self::new(transport, receiver, config)
    }

    pub async fn bind(&self, endpoint: &str) -> Result<Endpoint, StrandError> {
        Ok(self.core.transport.bind(endpoint).await?)
    }

    pub async fn connect(&self, endpoint: &str) -> Result<Endpoint, StrandError> {
        Ok(self.core.transport.connect(endpoint).await?)
    }

    pub fn transport(&self) -> &Transport {
        &self.core.transport
    }

    pub fn config(&self) -> &SocketConfig {
        &self.core.config
    }

    /// Open a channel
    ///
    /// With no source event the channel is local and gets a fresh id. With
    /// a source event (an incoming call) the channel answers that call: it
    /// takes the event's message id and envelope.
    pub fn open_channel(&self, source: Option<&Event>) -> Channel {
        let (origin, id, envelope) = match source {
            Some(event) => (
                Origin::Peer,
                event.message_id().to_string(),
                event.envelope.clone(),
            ),
            None => (Origin::Local, self.core.ids.next_id(), Vec::new()),
        };

        let channel = Channel::open(
            origin,
            id.clone(),
            envelope,
            self.core.config.clone(),
            self.core.ids.clone(),
            Arc::downgrade(&self.core),
        );

        let replaced = lock(&self.core.channels).insert(id, channel.clone());
        if let Some(previous) = replaced {
            warn!(channel = %previous.id(), "Duplicate channel id, dropping the older channel");
            previous.destroy(None);
        }

        channel
    }

    /// Look up an open channel by id
    pub fn channel(&self, id: &str) -> Option<Channel> {
        lock(&self.core.channels).get(id).cloned()
    }

    /// Number of channels not yet closed
    pub fn channel_count(&self) -> usize {
        lock(&self.core.channels).len()
    }

    /// Subscribe to events that belong to no channel
    ///
    /// Handlers run in subscription order on the socket's receive task,
    /// before the next inbound message is routed, so a channel opened by a
    /// handler sees every later event addressed to it. Handlers must not
    /// block.
    pub fn on_call<F>(&self, handler: F)
    where
        F: Fn(&MultiplexingSocket, Event) + Send + Sync + 'static,
    {
        lock(&self.core.call_handlers).push(Arc::new(handler));
    }

    /// Subscribe to socket-level errors (malformed input, transport failures)
    pub fn errors(&self) -> broadcast::Receiver<StrandError> {
        self.core.errors.subscribe()
    }

    /// Close every channel, then the transport
    ///
    /// `linger` bounds how long queued outbound data may keep draining.
    /// Channels still waiting for remote capacity afterwards are destroyed.
    pub fn close(&self, linger: Option<Duration>) {
        let channels: Vec<Channel> = lock(&self.core.channels).values().cloned().collect();
        debug!(channels = channels.len(), "Closing socket");

        for channel in &channels {
            channel.close();
        }
        self.core.transport.close(linger);

        for channel in channels {
            if channel.state() != ChannelState::Closed {
                channel.destroy(None);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.core.transport.is_closed()
    }

    fn route(&self, message: Message) {
        let event = match Event::from_message(message) {
            Ok(event) => event,
            Err(e) => {
                self.core.emit_error(e);
                return;
            }
        };

        let target = lock(&self.core.channels).get(event.response_to()).cloned();
        if let Some(channel) = target {
            channel.invoke(event);
            return;
        }

        let handlers = lock(&self.core.call_handlers).clone();
        if handlers.is_empty() {
            trace!(name = %event.name, "Dropping unrouted event");
            return;
        }
        for handler in handlers {
            handler(self, event.clone());
        }
    }
}

impl fmt::Debug for MultiplexingSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexingSocket")
            .field("transport", &self.core.transport)
            .field("channels", &self.channel_count())
            .finish()
    }
}

async fn receive_loop(core: Weak<SocketCore>, mut receiver: MessageReceiver) {
    while let Some(message) = receiver.recv().await {
        let Some(core) = core.upgrade() else {
            break;
        };
        MultiplexingSocket { core }.route(message);
    }
    debug!("Socket receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        closed_reason, collect_events, next_event, raw_peer, raw_server, send_raw, WAIT,
    };
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strand_core::event::{HEARTBEAT, MORE, OK, STREAM};
    use strand_core::{Header, Value};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_first_send_uses_channel_id() {
        let (socket, _server, mut server_rx) = raw_server("mux-first-send", SocketConfig::default()).await;

        let channel = socket.open_channel(None);
        assert_eq!(channel.origin(), Origin::Local);
        channel.send("add42", vec![Value::from(30)]).unwrap();

        let call = next_event(&mut server_rx).await;
        assert_eq!(call.name, "add42");
        assert_eq!(call.message_id(), channel.id());
        assert_eq!(call.header.response_to, None);

        // The initial window follows the first event
        let more = next_event(&mut server_rx).await;
        assert_eq!(more.name, MORE);
        assert_eq!(more.response_to(), channel.id());
        assert_eq!(more.args_list(), vec![Value::from(100)]);
        assert_ne!(more.message_id(), channel.id());
    }

    #[tokio::test]
    async fn test_outbound_waits_for_capacity() {
        let (socket, server, mut server_rx) = raw_server("mux-capacity", SocketConfig::default()).await;

        let channel = socket.open_channel(None);
        for i in 0..3 {
            channel.send("item", vec![Value::from(i)]).unwrap();
        }

        // Initial remote capacity is one event
        let first = next_event(&mut server_rx).await;
        assert_eq!(first.args_list(), vec![Value::from(0)]);
        assert_eq!(next_event(&mut server_rx).await.name, MORE);
        assert_eq!(channel.queued_outbound(), 2);
        assert_eq!(channel.remote_capacity(), 0);

        send_raw(&server, first.envelope, Header::reply("s1", channel.id()), MORE, vec![Value::from(10)]);

        assert_eq!(next_event(&mut server_rx).await.args_list(), vec![Value::from(1)]);
        assert_eq!(next_event(&mut server_rx).await.args_list(), vec![Value::from(2)]);
        assert_eq!(channel.queued_outbound(), 0);
        assert_eq!(channel.remote_capacity(), 8);
    }

    #[tokio::test]
    async fn test_peer_channel_routes_replies() {
        let (socket, peer, mut peer_rx) = raw_peer("mux-peer-route", SocketConfig::default()).await;

        let (opened_tx, mut opened_rx) = mpsc::unbounded_channel();
        socket.on_call(move |socket, event| {
            let channel = socket.open_channel(Some(&event));
            let _ = opened_tx.send((channel, event));
        });

        send_raw(&peer, Vec::new(), Header::new("call-1"), "echo", vec![Value::from("hi")]);
        let (channel, call) = tokio::time::timeout(WAIT, opened_rx.recv()).await.unwrap().unwrap();

        assert_eq!(channel.origin(), Origin::Peer);
        assert_eq!(channel.id(), "call-1");
        assert_eq!(channel.envelope(), call.envelope.as_slice());
        assert_eq!(socket.channel_count(), 1);

        channel.send(OK, call.args_list().to_vec()).unwrap();
        let reply = next_event(&mut peer_rx).await;
        assert_eq!(reply.name, OK);
        assert_eq!(reply.response_to(), "call-1");
        assert_eq!(reply.args_list(), vec![Value::from("hi")]);

        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(socket.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_inbound_order_and_replenish() {
        let config = SocketConfig::default().window(4);
        let (socket, peer, mut peer_rx) = raw_peer("mux-replenish", config).await;

        let (opened_tx, mut opened_rx) = mpsc::unbounded_channel();
        socket.on_call(move |socket, event| {
            let channel = socket.open_channel(Some(&event));
            let _ = opened_tx.send(collect_events(&channel));
            channel.send(OK, Vec::new()).unwrap();
        });

        send_raw(&peer, Vec::new(), Header::new("call-2"), "feed", Vec::new());
        let mut events = tokio::time::timeout(WAIT, opened_rx.recv()).await.unwrap().unwrap();

        assert_eq!(next_event(&mut peer_rx).await.name, OK);
        let initial = next_event(&mut peer_rx).await;
        assert_eq!(initial.name, MORE);
        assert_eq!(initial.args_list(), vec![Value::from(4)]);

        for i in 0..3 {
            send_raw(&peer, Vec::new(), Header::reply(format!("m{}", i), "call-2"), STREAM, vec![Value::from(i)]);
        }

        // Capacity fell below half the window after the third event
        let update = next_event(&mut peer_rx).await;
        assert_eq!(update.name, MORE);
        assert!(update.args_list()[0].as_i64().unwrap() > 0);

        for i in 0..3 {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            assert_eq!(event.args_list(), vec![Value::from(i)]);
        }
    }

    #[tokio::test]
    async fn test_bad_capacity_update_destroys_channel() {
        let (socket, server, mut server_rx) = raw_server("mux-bad-more", SocketConfig::default()).await;

        let channel = socket.open_channel(None);
        let closed = closed_reason(&channel);
        channel.send("call", Vec::new()).unwrap();
        let call = next_event(&mut server_rx).await;

        send_raw(&server, call.envelope, Header::reply("s1", channel.id()), MORE, vec![Value::from("lots")]);

        let reason = tokio::time::timeout(WAIT, closed).await.unwrap().unwrap();
        assert!(matches!(reason, Some(StrandError::Protocol(_))));
        assert_eq!(socket.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_close_waits_for_drain() {
        let (socket, server, mut server_rx) = raw_server("mux-drain", SocketConfig::default()).await;

        let channel = socket.open_channel(None);
        channel.send("first", Vec::new()).unwrap();
        channel.send("second", Vec::new()).unwrap();
        channel.close();

        assert_eq!(channel.state(), ChannelState::Closing);
        assert!(channel.send("third", Vec::new()).is_err());
        assert_eq!(socket.channel_count(), 1);

        let first = next_event(&mut server_rx).await;
        assert_eq!(first.name, "first");
        assert_eq!(next_event(&mut server_rx).await.name, MORE);

        send_raw(&server, first.envelope, Header::reply("s1", channel.id()), MORE, vec![Value::from(5)]);
        assert_eq!(next_event(&mut server_rx).await.name, "second");

        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(socket.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_discards_and_deregisters() {
        let (socket, _server, _server_rx) = raw_server("mux-destroy", SocketConfig::default()).await;

        let channel = socket.open_channel(None);
        channel.send("first", Vec::new()).unwrap();
        channel.send("queued", Vec::new()).unwrap();
        assert_eq!(channel.queued_outbound(), 1);

        let closing = Arc::new(AtomicUsize::new(0));
        let counter = closing.clone();
        channel.on_closing(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.destroy(None);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.queued_outbound(), 0);
        assert_eq!(closing.load(Ordering::SeqCst), 1);
        assert!(socket.channel(channel.id()).is_none());

        // Idempotent
        channel.destroy(None);
        assert_eq!(closing.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_socket_error() {
        let (socket, peer, _peer_rx) = raw_peer("mux-malformed", SocketConfig::default()).await;
        let mut errors = socket.errors();

        peer.send(vec![Bytes::new(), Bytes::from_static(b"\xc1")]).unwrap();

        let error = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert!(matches!(error, StrandError::MalformedEvent(_)));
    }

    #[tokio::test]
    async fn test_middleware_order_and_short_circuit() {
        let (socket, peer, _peer_rx) = raw_peer("mux-middleware", SocketConfig::default()).await;

        let (opened_tx, mut opened_rx) = mpsc::unbounded_channel();
        socket.on_call(move |socket, event| {
            let channel = socket.open_channel(Some(&event));
            let seen = Arc::new(Mutex::new(Vec::new()));

            let first = seen.clone();
            channel.register(move |_, event, next| {
                first.lock().unwrap().push(format!("first:{}", event.name));
                if event.name != "swallow" {
                    next.run(event);
                }
            });
            let second = seen.clone();
            channel.register(move |_, event, _| {
                second.lock().unwrap().push(format!("second:{}", event.name));
            });

            channel.send(OK, Vec::new()).unwrap();
            let _ = opened_tx.send((channel, seen));
        });

        send_raw(&peer, Vec::new(), Header::new("call-3"), "open", Vec::new());
        let (_channel, seen) = tokio::time::timeout(WAIT, opened_rx.recv()).await.unwrap().unwrap();

        send_raw(&peer, Vec::new(), Header::reply("a", "call-3"), "swallow", Vec::new());
        send_raw(&peer, Vec::new(), Header::reply("b", "call-3"), "pass", Vec::new());

        tokio::time::timeout(WAIT, async {
            while seen.lock().unwrap().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:swallow", "first:pass", "second:pass"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_heartbeat_expires() {
        let config = SocketConfig::default().heartbeat(Duration::from_millis(100));
        let (socket, _server, mut server_rx) = raw_server("mux-heartbeat", config).await;

        let channel = socket.open_channel(None);
        let closed = closed_reason(&channel);
        channel.send("slow", Vec::new()).unwrap();

        assert_eq!(next_event(&mut server_rx).await.name, "slow");
        assert_eq!(next_event(&mut server_rx).await.name, MORE);
        assert_eq!(next_event(&mut server_rx).await.name, HEARTBEAT);

        let reason = tokio::time::timeout(WAIT, closed).await.unwrap().unwrap();
        assert!(matches!(reason, Some(StrandError::HeartbeatError(_))));
        assert_eq!(socket.channel_count(), 0);
    }
}
