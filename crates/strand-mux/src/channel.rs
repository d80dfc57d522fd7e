//! Channels: ordered, flow-controlled conversations multiplexed over a socket.
//!
//! A channel owns two buffers. The outbound buffer holds events waiting for
//! the peer to grant capacity; the inbound buffer holds received events
//! waiting for the dispatcher task to run them through the middleware chain.
//!
//! State machine:
//! ```text
//! Open --close()--> Closing --outbound drained--> Closed
//!   \                  \
//!    `---destroy()------`-----------------------> Closed
//! ```

use crate::config::SocketConfig;
use crate::middleware::{Middleware, Next};
use crate::socket::SocketCore;
use bytes::Bytes;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use strand_core::event::{self, HEARTBEAT, MORE};
use strand_core::{
    ChannelBuffer, Event, Header, IdGenerator, StrandError, Value, DEFAULT_REMOTE_CAPACITY,
};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Which side opened a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Opened here to start a call
    Local,
    /// Opened to answer a call the peer started
    Peer,
}

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// No new sends; queued outbound events are still draining
    Closing,
    Closed,
}

type ClosingListener = Box<dyn FnOnce() + Send>;
type ClosedListener = Box<dyn FnOnce(Option<&StrandError>) + Send>;

struct ChannelInner {
    state: ChannelState,
    /// True until the first application event goes out on a local channel
    fresh: bool,
    /// Whether the initial window has been advertised
    advertised: bool,
    inbound: ChannelBuffer<Event>,
    outbound: ChannelBuffer<Event>,
    middleware: Vec<Middleware>,
    last_heartbeat: Instant,
    timers: Vec<AbortHandle>,
    wake: Option<mpsc::UnboundedSender<()>>,
    on_closing: Vec<ClosingListener>,
    on_closed: Vec<ClosedListener>,
}

struct ChannelShared {
    id: String,
    origin: Origin,
    envelope: Vec<Bytes>,
    config: SocketConfig,
    ids: Arc<IdGenerator>,
    socket: Weak<SocketCore>,
    inner: Mutex<ChannelInner>,
}

/// Handle to a channel
///
/// Cheap to clone. A channel stays registered with its socket until it
/// reaches `Closed`; dropping handles does not close it.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

/// Non-owning channel handle, for timers and tasks that must not keep a
/// channel alive
#[derive(Clone)]
pub struct WeakChannel {
    shared: Weak<ChannelShared>,
}

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.shared.upgrade().map(|shared| Channel { shared })
    }
}

impl Channel {
    /// Create a channel and start its dispatcher (and heartbeat, if configured)
    pub(crate) fn open(
        origin: Origin,
        id: String,
        envelope: Vec<Bytes>,
        config: SocketConfig,
        ids: Arc<IdGenerator>,
        socket: Weak<SocketCore>,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let window = config.window;
        let heartbeat = config.heartbeat;

        let channel = Channel {
            shared: Arc::new(ChannelShared {
                id,
                origin,
                envelope,
                config,
                ids,
                socket,
                inner: Mutex::new(ChannelInner {
                    state: ChannelState::Open,
                    fresh: origin == Origin::Local,
                    advertised: false,
                    inbound: ChannelBuffer::new(window),
                    outbound: ChannelBuffer::with_capacity(window, DEFAULT_REMOTE_CAPACITY),
                    middleware: Vec::new(),
                    last_heartbeat: Instant::now(),
                    timers: Vec::new(),
                    wake: Some(wake_tx),
                    on_closing: Vec::new(),
                    on_closed: Vec::new(),
                }),
            }),
        };

        tokio::spawn(dispatch_loop(channel.downgrade(), wake_rx));

        if let Some(interval) = heartbeat {
            let task = tokio::spawn(heartbeat_loop(channel.downgrade(), interval));
            channel.lock().timers.push(task.abort_handle());
        }

        trace!(channel = %channel.id(), ?origin, "Opened channel");
        channel
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn origin(&self) -> Origin {
        self.shared.origin
    }

    /// Address frames of the peer this channel talks to
    pub fn envelope(&self) -> &[Bytes] {
        &self.shared.envelope
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    /// Events the peer currently lets us send
    pub fn remote_capacity(&self) -> i64 {
        self.lock().outbound.capacity()
    }

    /// Events we currently let the peer send
    pub fn inbound_capacity(&self) -> i64 {
        self.lock().inbound.capacity()
    }

    /// Events waiting for remote capacity
    pub fn queued_outbound(&self) -> usize {
        self.lock().outbound.len()
    }

    /// Events received but not yet dispatched
    pub fn queued_inbound(&self) -> usize {
        self.lock().inbound.len()
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Whether two handles refer to the same channel
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Append a handler to the receive middleware chain
    ///
    /// Handlers run in registration order on the channel's dispatcher task.
    /// A handler that does not call `next.run(event)` ends delivery of that
    /// event. Registering on a closed channel is a no-op.
    pub fn register<F>(&self, middleware: F)
    where
        F: Fn(&Channel, &Event, Next<'_>) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        if inner.state != ChannelState::Closed {
            inner.middleware.push(Arc::new(middleware));
        }
    }

    /// Run `listener` once the channel stops accepting sends
    ///
    /// Runs immediately if the channel is already closing or closed.
    pub fn on_closing(&self, listener: impl FnOnce() + Send + 'static) {
        let mut inner = self.lock();
        if inner.state == ChannelState::Open {
            inner.on_closing.push(Box::new(listener));
        } else {
            drop(inner);
            listener();
        }
    }

    /// Run `listener` once the channel is closed, with the error that
    /// destroyed it, if any
    ///
    /// Runs immediately if the channel is already closed.
    pub fn on_closed(&self, listener: impl FnOnce(Option<&StrandError>) + Send + 'static) {
        let mut inner = self.lock();
        if inner.state == ChannelState::Closed {
            drop(inner);
            listener(None);
        } else {
            inner.on_closed.push(Box::new(listener));
        }
    }

    /// Send an application event to the peer
    ///
    /// The event goes out immediately if the peer has granted capacity and
    /// is queued otherwise. Control event names bypass flow control.
    pub fn send(&self, name: &str, args: Vec<Value>) -> Result<(), StrandError> {
        self.send_args(name, Value::Array(args))
    }

    /// Like [`Channel::send`], with an args value that goes out unchanged
    pub fn send_args(&self, name: &str, args: Value) -> Result<(), StrandError> {
        if event::is_control(name) {
            let args = match args {
                Value::Array(items) => items,
                other => vec![other],
            };
            return self.send_control(name, args);
        }

        let mut inner = self.lock();
        if inner.state != ChannelState::Open {
            return Err(StrandError::ChannelClosed(self.shared.id.clone()));
        }

        let header = if inner.fresh {
            inner.fresh = false;
            Header::new(self.shared.id.clone())
        } else {
            self.reply_header()
        };
        let event = Event::with_args(self.shared.envelope.clone(), header, name, args);

        if inner.outbound.has_capacity() && inner.outbound.is_empty() {
            inner.outbound.decrement_capacity();
            self.transmit(event);
        } else {
            trace!(channel = %self.shared.id, "Remote capacity exhausted, queueing {}", name);
            inner.outbound.add(event);
        }

        if !inner.advertised {
            inner.advertised = true;
            self.advertise(&mut inner);
        }

        Ok(())
    }

    /// Send a control event outside flow control
    pub(crate) fn send_control(&self, name: &str, args: Vec<Value>) -> Result<(), StrandError> {
        let inner = self.lock();
        if inner.state == ChannelState::Closed {
            return Err(StrandError::ChannelClosed(self.shared.id.clone()));
        }
        self.transmit(self.control_event(name, args));
        drop(inner);
        Ok(())
    }

    /// Send queued outbound events while the peer has capacity
    pub fn flush(&self) {
        let drained = {
            let mut inner = self.lock();
            self.drain(&mut inner)
        };
        if drained {
            self.teardown(None);
        }
    }

    /// Stop accepting sends; the channel closes once its outbound queue drains
    pub fn close(&self) {
        let listeners = {
            let mut inner = self.lock();
            if inner.state != ChannelState::Open {
                return;
            }
            inner.state = ChannelState::Closing;
            mem::take(&mut inner.on_closing)
        };

        for listener in listeners {
            listener();
        }

        self.flush();
    }

    /// Close immediately, discarding buffered events
    ///
    /// `reason` is handed to `on_closed` listeners.
    pub fn destroy(&self, reason: Option<StrandError>) {
        if let Some(reason) = &reason {
            warn!(channel = %self.shared.id, "Destroying channel: {}", reason);
        }
        self.teardown(reason);
    }

    /// Feed an event routed to this channel by the socket
    pub(crate) fn invoke(&self, event: Event) {
        match event.name.as_str() {
            MORE => self.update_capacity(&event),
            HEARTBEAT if self.shared.config.heartbeat.is_some() => {
                self.lock().last_heartbeat = Instant::now();
            }
            _ => self.enqueue(event),
        }
    }

    fn update_capacity(&self, event: &Event) {
        let capacity = event
            .args_list()
            .first()
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)));

        let Some(capacity) = capacity else {
            self.destroy(Some(StrandError::Protocol(format!(
                "Bad buffer message: {:?}",
                event.args
            ))));
            return;
        };

        let drained = {
            let mut inner = self.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.outbound.set_capacity(capacity);
            self.drain(&mut inner)
        };
        if drained {
            self.teardown(None);
        }
    }

    fn enqueue(&self, event: Event) {
        let mut inner = self.lock();
        // A closing channel still hears heartbeats while its queue drains
        let accepted = match inner.state {
            ChannelState::Open => true,
            ChannelState::Closing => event.is_control(),
            ChannelState::Closed => false,
        };
        if !accepted {
            debug!(channel = %self.shared.id, "Dropping {} on {:?} channel", event.name, inner.state);
            return;
        }

        let replenish = !event.is_control() && self.shared.config.replenish.applies_to(&event.name);
        if !event.is_control() {
            inner.inbound.decrement_capacity();
        }
        inner.inbound.add(event);

        // Re-advertise once less than half the window is left
        if replenish && inner.inbound.capacity() * 2 < self.shared.config.window as i64 {
            self.advertise(&mut inner);
        }

        if let Some(wake) = &inner.wake {
            let _ = wake.send(());
        }
    }

    /// Grant the peer whatever room the inbound buffer has left
    fn advertise(&self, inner: &mut ChannelInner) {
        let capacity = self.shared.config.window as i64 - inner.inbound.len() as i64;
        if capacity > 0 {
            inner.inbound.set_capacity(capacity);
            self.transmit(self.control_event(MORE, vec![Value::from(capacity)]));
        }
    }

    /// Returns true when a closing channel has nothing left to send
    fn drain(&self, inner: &mut ChannelInner) -> bool {
        while inner.outbound.has_capacity() {
            let Some(event) = inner.outbound.remove() else {
                break;
            };
            inner.outbound.decrement_capacity();
            self.transmit(event);
        }
        inner.state == ChannelState::Closing && inner.outbound.is_empty()
    }

    fn teardown(&self, reason: Option<StrandError>) {
        let (closing, closed, middleware, timers) = {
            let mut inner = self.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            let closing = if inner.state == ChannelState::Open {
                mem::take(&mut inner.on_closing)
            } else {
                Vec::new()
            };

            inner.state = ChannelState::Closed;
            let dropped = inner.inbound.clear() + inner.outbound.clear();
            if dropped > 0 {
                debug!(channel = %self.shared.id, dropped, "Discarding buffered events");
            }
            inner.wake = None;

            (
                closing,
                mem::take(&mut inner.on_closed),
                mem::take(&mut inner.middleware),
                mem::take(&mut inner.timers),
            )
        };

        for timer in timers {
            timer.abort();
        }
        drop(middleware);

        if let Some(socket) = self.shared.socket.upgrade() {
            socket.remove_channel(self);
        }
        trace!(channel = %self.shared.id, "Closed channel");

        for listener in closing {
            listener();
        }
        for listener in closed {
            listener(reason.as_ref());
        }
    }

    fn reply_header(&self) -> Header {
        Header::reply(self.shared.ids.next_id(), self.shared.id.clone())
    }

    fn control_event(&self, name: &str, args: Vec<Value>) -> Event {
        Event::new(self.shared.envelope.clone(), self.reply_header(), name, args)
    }

    /// Hand an event to the socket
    ///
    /// Called with the channel lock held so events leave in the order they
    /// were accepted.
    fn transmit(&self, event: Event) {
        match self.shared.socket.upgrade() {
            Some(socket) => socket.send_event(&event),
            None => debug!(channel = %self.shared.id, "Socket gone, dropping {}", event.name),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("origin", &self.shared.origin)
            .field("state", &self.state())
            .finish()
    }
}

/// Deliver inbound events through the middleware chain, one per wakeup
async fn dispatch_loop(channel: WeakChannel, mut wake: mpsc::UnboundedReceiver<()>) {
    while wake.recv().await.is_some() {
        let Some(channel) = channel.upgrade() else {
            break;
        };

        let next = {
            let mut inner = channel.lock();
            if inner.state == ChannelState::Closed {
                break;
            }
            let event = inner.inbound.remove();
            event.map(|event| (event, inner.middleware.clone()))
        };

        if let Some((event, chain)) = next {
            Next::new(&channel, &chain).run(&event);
        }
    }
}

/// Channel-owned heartbeat: ping every `interval`, give up after two
/// silent intervals
async fn heartbeat_loop(channel: WeakChannel, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        ticker.tick().await;
        let Some(channel) = channel.upgrade() else {
            break;
        };

        let silent = {
            let inner = channel.lock();
            if inner.state == ChannelState::Closed {
                break;
            }
            inner.last_heartbeat.elapsed() > interval * 2
        };

        if silent {
            channel.destroy(Some(StrandError::HeartbeatError(format!(
                "Lost remote after {}ms heartbeat",
                (interval * 2).as_millis()
            ))));
            break;
        }

        let _ = channel.send_control(HEARTBEAT, vec![Value::from(0)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_silent, next_event, raw_peer, raw_server, send_raw, wait_until};
    use strand_core::event::STREAM;

    const QUIET: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_in_flight_bounded_by_latest_grant() {
        let (socket, server, mut server_rx) = raw_server("channel-grant-reset", SocketConfig::default()).await;

        let channel = socket.open_channel(None);
        for i in 0..12 {
            channel.send("item", vec![Value::from(i)]).unwrap();
        }

        // One event on the assumed capacity, then the window advertisement
        let first = next_event(&mut server_rx).await;
        assert_eq!(first.args_list(), vec![Value::from(0)]);
        assert_eq!(next_event(&mut server_rx).await.name, MORE);
        assert_silent(&mut server_rx, QUIET).await;
        assert_eq!(channel.queued_outbound(), 11);

        let envelope = first.envelope;
        let grant = |id: &str, capacity: i64| {
            send_raw(&server, envelope.clone(), Header::reply(id, channel.id()), MORE, vec![Value::from(capacity)]);
        };

        let mut received = 1i64;
        for (i, capacity) in [3i64, 2, 0, 4].into_iter().enumerate() {
            grant(&format!("grant{}", i), capacity);
            for _ in 0..capacity {
                let event = next_event(&mut server_rx).await;
                assert_eq!(event.name, "item");
                assert_eq!(event.args_list(), vec![Value::from(received)]);
                received += 1;
            }
            assert_silent(&mut server_rx, QUIET).await;
            assert_eq!(channel.remote_capacity(), 0);
            assert_eq!(channel.queued_outbound(), 12 - received as usize);
        }

        // Drain the queue under a generous grant, then shrink it
        grant("wide", 10);
        for _ in 0..2 {
            assert_eq!(next_event(&mut server_rx).await.name, "item");
        }
        wait_until(|| channel.remote_capacity() == 8).await;

        grant("narrow", 1);
        wait_until(|| channel.remote_capacity() == 1).await;
        for i in 12..15 {
            channel.send("item", vec![Value::from(i)]).unwrap();
        }

        let event = next_event(&mut server_rx).await;
        assert_eq!(event.args_list(), vec![Value::from(12)]);
        assert_silent(&mut server_rx, QUIET).await;
        assert_eq!(channel.remote_capacity(), 0);
        assert_eq!(channel.queued_outbound(), 2);
    }

    #[tokio::test]
    async fn test_replenish_leaves_before_delivery() {
        let config = SocketConfig::default().window(4);
        let (socket, peer, mut peer_rx) = raw_peer("channel-replenish-order", config).await;

        // Echo each streamed item back, so the peer sees when middleware ran
        socket.on_call(|socket, event| {
            let channel = socket.open_channel(Some(&event));
            channel.register(|channel, event, _| {
                if event.name == STREAM {
                    let _ = channel.send("ack", event.args_list().to_vec());
                }
            });
            channel.send("ready", Vec::new()).unwrap();
        });

        send_raw(&peer, Vec::new(), Header::new("call-order"), "open", Vec::new());
        assert_eq!(next_event(&mut peer_rx).await.name, "ready");
        let window = next_event(&mut peer_rx).await;
        assert_eq!(window.name, MORE);
        assert_eq!(window.args_list(), vec![Value::from(4)]);

        send_raw(&peer, Vec::new(), Header::reply("grant", "call-order"), MORE, vec![Value::from(100)]);
        for i in 0..3 {
            send_raw(&peer, Vec::new(), Header::reply(format!("s{}", i), "call-order"), STREAM, vec![Value::from(i)]);
        }

        // The third item drops the window below half and triggers the grant
        let mut seen = Vec::new();
        for _ in 0..4 {
            let event = next_event(&mut peer_rx).await;
            let label = match event.name.as_str() {
                MORE => "more".to_string(),
                _ => format!("{}:{}", event.name, event.args_list()[0].as_i64().unwrap()),
            };
            seen.push(label);
        }
        assert_silent(&mut peer_rx, QUIET).await;

        let position = |label: &str| seen.iter().position(|seen| seen == label).unwrap();
        assert!(position("more") < position("ack:2"), "order was {:?}", seen);
        assert!(position("ack:0") < position("ack:1"));
        assert!(position("ack:1") < position("ack:2"));
    }
}
