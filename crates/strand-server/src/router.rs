//! Method registry
//!
//! Maps method names (the `name` of a call event) to handlers.

use crate::responder::Responder;
use crate::streaming::CallResponse;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use strand_core::{RemoteError, Value};

/// Name of the built-in introspection method
pub const INSPECT: &str = "_zpc_inspect";

/// Older introspection method still called by zerorpc-python clients
pub const LEGACY_INSPECT: &str = "_zerorpc_inspect";

/// Future driving one call to completion
pub type CallFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Type alias for method handlers: arguments plus a reply handle in, a
/// future that drives the call out
pub type HandlerFn = Arc<dyn Fn(Vec<Value>, Responder) -> CallFuture + Send + Sync>;

/// Method router
#[derive(Clone, Default)]
pub struct MethodRouter {
    routes: BTreeMap<String, HandlerFn>,
}

impl MethodRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that replies through its `Responder`
    ///
    /// The handler runs on its own task and may hand the responder to
    /// other tasks; the call stays open until a final reply is sent.
    pub fn register_raw<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>, Responder) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.routes.insert(
            name.into(),
            Arc::new(move |args: Vec<Value>, responder: Responder| -> CallFuture {
                let handler = Arc::clone(&handler);
                Box::pin(async move { handler(args, responder) })
            }),
        );
    }

    /// Register an async handler returning a unary or streaming response
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallResponse, RemoteError>> + Send + 'static,
    {
        self.routes.insert(
            name.into(),
            Arc::new(move |args: Vec<Value>, responder: Responder| -> CallFuture {
                let response = handler(args);
                Box::pin(async move {
                    match response.await {
                        Ok(response) => response.answer(&responder).await,
                        Err(error) => {
                            let _ = responder.error(error);
                        }
                    }
                })
            }),
        );
    }

    /// Register an async handler returning a single value
    pub fn register_unary<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(name, move |args| {
            let handler = Arc::clone(&handler);
            async move { handler(args).await.map(CallResponse::Unary) }
        });
    }

    pub fn get(&self, name: &str) -> Option<&HandlerFn> {
        self.routes.get(name)
    }

    /// Registered method names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    /// Answer to `_zpc_inspect`: `{name, methods: {method: {args, doc}}}`
    pub fn inspect(&self, server_name: &str) -> Value {
        let methods = self
            .routes
            .keys()
            .map(|name| {
                let description = Value::Map(vec![
                    (Value::from("args"), Value::Array(Vec::new())),
                    (Value::from("doc"), Value::from("")),
                ]);
                (Value::from(name.as_str()), description)
            })
            .collect();

        Value::Map(vec![
            (Value::from("name"), Value::from(server_name)),
            (Value::from("methods"), Value::Map(methods)),
        ])
    }

    /// Answer to `_zerorpc_inspect [method?, long_doc?]`
    ///
    /// `{methods: [[name, [args, nil, nil, nil], doc], ...]}`, or
    /// `{method: [...]}` holding only the entry for `method` when one is given.
    pub fn legacy_inspect(&self, method: Option<&str>) -> Value {
        let key = if method.is_some() { "method" } else { "methods" };
        let entries = self
            .routes
            .keys()
            .filter(|name| method.map_or(true, |wanted| wanted == name.as_str()))
            .map(|name| {
                let signature = vec![Value::Array(Vec::new()), Value::Nil, Value::Nil, Value::Nil];
                Value::Array(vec![
                    Value::from(name.as_str()),
                    Value::Array(signature),
                    Value::from(""),
                ])
            })
            .collect();

        Value::Map(vec![(Value::from(key), Value::Array(entries))])
    }
}
