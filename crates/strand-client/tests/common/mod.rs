#![allow(dead_code)]

use strand_client::Client;
use strand_core::{RemoteError, Value};
use strand_server::{CallResponse, Server};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server exposing the methods the scenarios exercise
pub fn calculator() -> Server {
    Server::builder()
        .name("calculator")
        .unary("add42", |args| async move {
            match args.first().and_then(Value::as_i64) {
                Some(n) => Ok(Value::from(n + 42)),
                None => Err(RemoteError::new("TypeError", "add42 expects an integer")),
            }
        })
        .register("iter", |args| async move {
            let arg = |i: usize| args.get(i).and_then(Value::as_i64).unwrap_or(0);
            let (start, stop, step) = (arg(0), arg(1), arg(2).max(1));
            let items: Vec<Result<Value, RemoteError>> = (start..stop)
                .step_by(step as usize)
                .map(|n| Ok(Value::from(n)))
                .collect();
            Ok(CallResponse::streaming(tokio_stream::iter(items)))
        })
        .unary("boom", |_| async {
            Err(RemoteError::new("ValueError", "boom").with_trace("calculator.boom"))
        })
        .method("quiet", |_, _| {})
        .build()
}

/// Bind `server` on an endpoint and connect a client to it
pub async fn connect(server: &Server, endpoint: &str, client: Client) -> Client {
    let bound = server.bind(endpoint).await.unwrap();
    client.connect(&bound.to_string()).await.unwrap();
    client
}
