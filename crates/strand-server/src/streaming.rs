//! Handler results: a single value or a stream of values

use std::pin::Pin;
use strand_core::{RemoteError, Value};
use tokio_stream::{Stream, StreamExt};

use crate::responder::Responder;

/// Boxed stream of reply items
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<Value, RemoteError>> + Send>>;

/// Response type that can be either unary or streaming
pub enum CallResponse {
    /// Single result, answered with `OK`
    Unary(Value),
    /// Items answered with `STREAM` each, then `STREAM_DONE`
    Streaming(ReplyStream),
}

impl CallResponse {
    pub fn unary(value: impl Into<Value>) -> Self {
        Self::Unary(value.into())
    }

    pub fn streaming<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, RemoteError>> + Send + 'static,
    {
        Self::Streaming(Box::pin(stream))
    }

    /// Send this response through `responder`
    ///
    /// Stops early if the call is abandoned (peer lost, channel destroyed).
    /// An error item ends the stream with `ERR`.
    pub(crate) async fn answer(self, responder: &Responder) {
        match self {
            CallResponse::Unary(value) => {
                let _ = responder.ok(value);
            }
            CallResponse::Streaming(mut stream) => {
                while let Some(item) = stream.next().await {
                    let sent = match item {
                        Ok(value) => responder.item(value),
                        Err(error) => {
                            let _ = responder.error(error);
                            return;
                        }
                    };
                    if sent.is_err() {
                        return;
                    }
                }
                let _ = responder.end();
            }
        }
    }
}
