//! Strand client implementation

use crate::streaming::CallStream;
use serde::{Deserialize, Serialize};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strand_core::event::{ERR, HEARTBEAT, OK, STREAM, STREAM_DONE};
use strand_core::{Event, RemoteError, StrandError, Value};
use strand_mux::{add_heartbeat, add_timeout, Channel, MultiplexingSocket, SocketConfig};
use strand_transport::Endpoint;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, instrument, warn};

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a call may wait for its first reply
    pub timeout: Duration,
    /// Heartbeat interval for every call
    pub heartbeat: Duration,
    pub socket: SocketConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            heartbeat: Duration::from_secs(5),
            socket: SocketConfig::default(),
        }
    }
}

/// Per-call overrides of the client configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub heartbeat: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }
}

type ReplyCallback = Box<dyn FnMut(Option<StrandError>, Option<Value>, bool) + Send>;

type FinalReply = (Option<StrandError>, Option<Value>);

struct SinkState {
    /// Absent while the callback runs
    callback: Option<ReplyCallback>,
    /// Final reply that arrived while an item callback was running
    pending: Option<FinalReply>,
    done: bool,
}

/// Delivers the replies of one call to its callback, at most one final one
///
/// The callback always runs unlocked, so any invocation may close the
/// client or the channel.
#[derive(Clone)]
struct ReplySink {
    state: Arc<Mutex<SinkState>>,
}

impl ReplySink {
    fn new(callback: ReplyCallback) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                callback: Some(callback),
                pending: None,
                done: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, error: Option<StrandError>, result: Option<Value>, more: bool) {
        let mut state = self.lock();
        if state.done {
            return;
        }
        if !more {
            state.done = true;
        }

        let Some(mut callback) = state.callback.take() else {
            // Reentrant: the running item callback picks this up when it returns
            if !more {
                state.pending = Some((error, result));
            }
            return;
        };
        drop(state);

        callback(error, result, more);
        if !more {
            return;
        }

        let mut state = self.lock();
        match state.pending.take() {
            Some((error, result)) => {
                drop(state);
                callback(error, result, false);
            }
            None => state.callback = Some(callback),
        }
    }

    fn fail(&self, error: StrandError) {
        self.deliver(Some(error), None, false);
    }
}

/// Strand RPC client
///
/// Calls go out over a dealer socket, each on its own channel. Must be
/// built inside a Tokio runtime.
pub struct Client {
    socket: MultiplexingSocket,
    config: ClientConfig,
}

impl Client {
    /// Create a new client with custom configuration
    pub fn new(config: ClientConfig) -> Self {
        Self {
            socket: MultiplexingSocket::dealer(config.socket.clone()),
            config,
        }
    }

    /// Create a builder for configuring the client
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect to a server
    #[instrument(skip(self), fields(rpc.system = "strand"))]
    pub async fn connect(&self, endpoint: &str) -> Result<Endpoint, StrandError> {
        self.socket.connect(endpoint).await
    }

    /// Accept a connecting server
    #[instrument(skip(self), fields(rpc.system = "strand"))]
    pub async fn bind(&self, endpoint: &str) -> Result<Endpoint, StrandError> {
        self.socket.bind(endpoint).await
    }

    /// Close the socket; calls still in flight fail with `ChannelClosed`
    pub fn close(&self) {
        self.socket.close(None);
    }

    /// Subscribe to socket-level errors
    pub fn errors(&self) -> broadcast::Receiver<StrandError> {
        self.socket.errors()
    }

    pub fn socket(&self) -> &MultiplexingSocket {
        &self.socket
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start a call with the client's default options
    ///
    /// `callback(error, result, more)` runs once per `STREAM` item with
    /// `more = true`, then exactly once more with `more = false`: with the
    /// result for `OK`, with nothing for `STREAM_DONE`, or with the error.
    /// Any invocation may close the client.
    pub fn invoke<F>(&self, method: &str, args: Vec<Value>, callback: F)
    where
        F: FnMut(Option<StrandError>, Option<Value>, bool) + Send + 'static,
    {
        self.invoke_with(method, args, CallOptions::default(), callback);
    }

    /// Start a call with per-call options
    pub fn invoke_with<F>(&self, method: &str, args: Vec<Value>, options: CallOptions, callback: F)
    where
        F: FnMut(Option<StrandError>, Option<Value>, bool) + Send + 'static,
    {
        let sink = ReplySink::new(Box::new(callback));
        let channel = self.socket.open_channel(None);
        debug!(rpc.method = %method, channel = %channel.id(), "Invoking");

        let timeout = options.timeout.unwrap_or(self.config.timeout);
        add_timeout(timeout, &channel, {
            let sink = sink.clone();
            move |error| sink.fail(error)
        });

        // A channel-owned heartbeat consumes `_zpc_hb` before middleware sees it
        if self.socket.config().heartbeat.is_none() {
            let heartbeat = options.heartbeat.unwrap_or(self.config.heartbeat);
            add_heartbeat(heartbeat, &channel, {
                let sink = sink.clone();
                move |error| sink.fail(error)
            });
        }

        channel.register({
            let sink = sink.clone();
            move |channel, event, _| dispatch_reply(channel, &sink, event)
        });

        channel.on_closed({
            let sink = sink.clone();
            let id = channel.id().to_string();
            move |reason| {
                let error = reason
                    .cloned()
                    .unwrap_or_else(|| StrandError::ChannelClosed(id));
                sink.fail(error);
            }
        });

        if let Err(e) = channel.send(method, args) {
            sink.fail(e);
            channel.destroy(None);
        }
    }

    /// Call a method and wait for its result
    ///
    /// Streamed items are collected into an array, followed by the final
    /// `OK` value if a peer sends one after streaming.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, StrandError> {
        self.call_with(method, args, CallOptions::default()).await
    }

    #[instrument(
        skip(self, args, options),
        fields(
            rpc.method = method,
            rpc.system = "strand",
            otel.kind = "client"
        )
    )]
    pub async fn call_with(
        &self,
        method: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value, StrandError> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let mut items = Vec::new();

        self.invoke_with(method, args, options, move |error, result, more| {
            if more {
                items.extend(result);
                return;
            }
            let outcome = match error {
                Some(error) => Err(error),
                None if items.is_empty() => Ok(result.unwrap_or(Value::Nil)),
                None => {
                    items.extend(result);
                    Ok(Value::Array(mem::take(&mut items)))
                }
            };
            if let Some(tx) = tx.take() {
                let _ = tx.send(outcome);
            }
        });

        rx.await
            .map_err(|_| StrandError::ChannelClosed(format!("{} ended without a reply", method)))?
    }

    /// Call a method and receive its replies as a stream
    pub fn stream(&self, method: &str, args: Vec<Value>) -> CallStream {
        self.stream_with(method, args, CallOptions::default())
    }

    pub fn stream_with(&self, method: &str, args: Vec<Value>, options: CallOptions) -> CallStream {
        let (tx, rx) = mpsc::unbounded_channel();

        self.invoke_with(method, args, options, move |error, result, _more| {
            let item = match (error, result) {
                (Some(error), _) => Err(error),
                (None, Some(value)) => Ok(value),
                (None, None) => return,
            };
            let _ = tx.send(item);
        });

        CallStream::new(rx)
    }
}

/// Map one reply event onto the call's callback
///
/// `STREAM` args are the item itself and are delivered as received.
fn dispatch_reply(channel: &Channel, sink: &ReplySink, event: &Event) {
    match event.name.as_str() {
        OK => {
            let result = event.args_list().first().cloned().unwrap_or(Value::Nil);
            sink.deliver(None, Some(result), false);
            channel.close();
        }
        ERR => {
            let error = match RemoteError::from_args(event.args_list()) {
                Ok(remote) => StrandError::Remote(remote),
                Err(e) => e,
            };
            sink.deliver(Some(error), None, false);
            channel.close();
        }
        STREAM => sink.deliver(None, Some(event.args.clone()), true),
        STREAM_DONE => {
            sink.deliver(None, None, false);
            channel.close();
        }
        HEARTBEAT => {}
        other => {
            warn!(channel = %channel.id(), "Unexpected reply {}", other);
            sink.fail(StrandError::Protocol(format!("Unexpected reply: {}", other)));
            channel.close();
        }
    }
}

/// Builder for creating a Strand client
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Default time a call may wait for its first reply
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Default heartbeat interval for calls
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.config.heartbeat = interval;
        self
    }

    /// Channel settings of the underlying socket
    pub fn socket(mut self, socket: SocketConfig) -> Self {
        self.config.socket = socket;
        self
    }

    /// Build the client
    pub fn build(self) -> Client {
        Client::new(self.config)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
