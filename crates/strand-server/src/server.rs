//! Strand server implementation

use crate::responder::Responder;
use crate::router::{MethodRouter, INSPECT, LEGACY_INSPECT};
use crate::streaming::CallResponse;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strand_core::{Event, RemoteError, StrandError, Value};
use strand_mux::{add_heartbeat, MultiplexingSocket, SocketConfig};
use strand_transport::Endpoint;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name reported by `_zpc_inspect`
    pub name: String,
    /// Heartbeat interval for every call
    pub heartbeat: Duration,
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "strand".to_string(),
            heartbeat: Duration::from_secs(5),
            socket: SocketConfig::default(),
        }
    }
}

/// Strand RPC server
///
/// Listens on a router socket and answers every inbound call on its own
/// channel. Must be built inside a Tokio runtime.
pub struct Server {
    socket: MultiplexingSocket,
    router: Arc<MethodRouter>,
    config: ServerConfig,
}

impl Server {
    /// Create a server answering calls with `router`
    pub fn new(router: MethodRouter, config: ServerConfig) -> Self {
        let socket = MultiplexingSocket::router(config.socket.clone());
        let router = Arc::new(router);

        let dispatcher = Dispatcher {
            router: Arc::clone(&router),
            heartbeat: config.heartbeat,
            name: config.name.clone(),
        };
        socket.on_call(move |socket, event| dispatcher.dispatch(socket, event));

        Self {
            socket,
            router,
            config,
        }
    }

    /// Create a builder for configuring the server
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Accept clients on an endpoint
    #[instrument(skip(self), fields(rpc.system = "strand"))]
    pub async fn bind(&self, endpoint: &str) -> Result<Endpoint, StrandError> {
        let bound = self.socket.bind(endpoint).await?;
        info!("Strand server listening on {}", bound);
        Ok(bound)
    }

    /// Connect out to a client that is listening
    #[instrument(skip(self), fields(rpc.system = "strand"))]
    pub async fn connect(&self, endpoint: &str) -> Result<Endpoint, StrandError> {
        self.socket.connect(endpoint).await
    }

    /// Stop answering calls and close the socket
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

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<&str> {
        self.router.names()
    }
}

/// Turns inbound calls into handler invocations
struct Dispatcher {
    router: Arc<MethodRouter>,
    heartbeat: Duration,
    name: String,
}

impl Dispatcher {
    /// Runs on the socket's receive task; the handler itself gets its own task
    fn dispatch(&self, socket: &MultiplexingSocket, event: Event) {
        if !event.response_to().is_empty() || event.is_control() {
            trace!(name = %event.name, "Ignoring event for a finished call");
            return;
        }

        let method = event.name.clone();
        let channel = socket.open_channel(Some(&event));
        // A channel-owned heartbeat consumes `_zpc_hb` before middleware sees it
        if socket.config().heartbeat.is_none() {
            add_heartbeat(self.heartbeat, &channel, {
                let method = method.clone();
                move |error| warn!(rpc.method = %method, "Abandoning call: {}", error)
            });
        }
        let responder = Responder::new(channel, method.clone());

        let Some(handler) = self.router.get(&method).cloned() else {
            let reply = match method.as_str() {
                INSPECT => responder.ok(self.router.inspect(&self.name)),
                LEGACY_INSPECT => {
                    let filter = event.args_list().first().and_then(Value::as_str);
                    responder.ok(self.router.legacy_inspect(filter))
                }
                _ => {
                    debug!(rpc.method = %method, "Unknown method");
                    responder.error(RemoteError::new(
                        "NameError",
                        format!("Unknown method: {}", method),
                    ))
                }
            };
            if let Err(e) = reply {
                debug!("Failed to answer {}: {}", method, e);
            }
            return;
        };

        let span = info_span!(
            "rpc.call",
            rpc.system = "strand",
            rpc.method = %method,
            rpc.call_id = %event.message_id(),
        );
        let args = event.into_args_list();
        let call = {
            let responder = responder.clone();
            tokio::spawn(async move { handler(args, responder).await }.instrument(span))
        };

        tokio::spawn(async move {
            if let Err(e) = call.await {
                if e.is_panic() {
                    let message = panic_message(e.into_panic());
                    error!(rpc.method = %method, "Handler panicked: {}", message);
                    let _ = responder.error(RemoteError::new("Panic", message));
                }
            }
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Builder for creating a Strand server
pub struct ServerBuilder {
    router: MethodRouter,
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder
    pub fn new() -> Self {
        Self {
            router: MethodRouter::new(),
            config: ServerConfig::default(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Name reported by `_zpc_inspect`
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Heartbeat interval for every call
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.config.heartbeat = interval;
        self
    }

    /// Channel settings of the underlying socket
    pub fn socket(mut self, socket: SocketConfig) -> Self {
        self.config.socket = socket;
        self
    }

    /// Register a method that replies through its `Responder`
    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>, Responder) + Send + Sync + 'static,
    {
        self.router.register_raw(name, handler);
        self
    }

    /// Register an async method returning a single value
    pub fn unary<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        self.router.register_unary(name, handler);
        self
    }

    /// Register an async method returning a unary or streaming response
    pub fn register<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallResponse, RemoteError>> + Send + 'static,
    {
        self.router.register(name, handler);
        self
    }

    /// Build the server
    pub fn build(self) -> Server {
        Server::new(self.router, self.config)
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
