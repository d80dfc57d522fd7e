//! Client-side streaming support

use std::pin::Pin;
use std::task::{Context, Poll};
use strand_core::{StrandError, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

/// Replies of one call, as a stream
///
/// Yields every `STREAM` item exactly as the server sent it, or the single
/// `OK` value of a unary reply, and ends after the final reply. A failed
/// call yields its error last.
pub struct CallStream {
    inner: UnboundedReceiverStream<Result<Value, StrandError>>,
}

impl CallStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Result<Value, StrandError>>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl Stream for CallStream {
    type Item = Result<Value, StrandError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
