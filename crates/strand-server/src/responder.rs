//! Replying to a call.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use strand_core::event::{ERR, OK, STREAM, STREAM_DONE};
use strand_core::{RemoteError, StrandError, Value};
use strand_mux::{Channel, ChannelState};
use tracing::trace;

/// One reply to a call
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Final result; ends the call
    ///
    /// Answered with `OK [value]`, or, once items have been streamed, with
    /// `STREAM value` (skipped when nil) followed by `STREAM_DONE`.
    Ok(Value),
    /// Failure; ends the call
    Error(RemoteError),
    /// One streamed item; more may follow
    StreamItem(Value),
    /// End of a stream; ends the call
    StreamEnd,
}

#[derive(Default)]
struct ReplyState {
    streamed: bool,
    finished: bool,
}

struct ResponderInner {
    channel: Channel,
    method: String,
    state: Mutex<ReplyState>,
}

/// Reply handle for one call
///
/// Clones share state, so a call can be answered from any task. Every
/// call must end with exactly one of `Ok`, `Error` or `StreamEnd`; replying
/// after that is a usage error.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

impl Responder {
    pub(crate) fn new(channel: Channel, method: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                channel,
                method: method.into(),
                state: Mutex::new(ReplyState::default()),
            }),
        }
    }

    /// Name of the method being answered
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// Whether a final reply has been sent or the call was abandoned
    pub fn is_finished(&self) -> bool {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.finished || self.inner.channel.state() != ChannelState::Open
    }

    pub fn send(&self, reply: Reply) -> Result<(), StrandError> {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = &self.inner.channel;

        if state.finished || channel.state() != ChannelState::Open {
            return Err(StrandError::Usage(format!(
                "Reply to {} after the call finished",
                self.inner.method
            )));
        }

        match reply {
            Reply::Ok(value) => {
                state.finished = true;
                if state.streamed {
                    if !value.is_nil() {
                        channel.send_args(STREAM, value)?;
                    }
                    channel.send(STREAM_DONE, Vec::new())?;
                } else {
                    channel.send(OK, vec![value])?;
                }
                channel.close();
            }
            Reply::Error(error) => {
                state.finished = true;
                channel.send(ERR, error.to_args())?;
                channel.close();
            }
            Reply::StreamItem(item) => {
                state.streamed = true;
                channel.send_args(STREAM, item)?;
            }
            Reply::StreamEnd => {
                state.finished = true;
                if state.streamed {
                    channel.send(STREAM_DONE, Vec::new())?;
                } else {
                    channel.send(OK, vec![Value::Nil])?;
                }
                channel.close();
            }
        }

        trace!(rpc.method = %self.inner.method, channel = %channel.id(), "Replied");
        Ok(())
    }

    pub fn ok(&self, value: impl Into<Value>) -> Result<(), StrandError> {
        self.send(Reply::Ok(value.into()))
    }

    pub fn error(&self, error: RemoteError) -> Result<(), StrandError> {
        self.send(Reply::Error(error))
    }

    pub fn item(&self, item: impl Into<Value>) -> Result<(), StrandError> {
        self.send(Reply::StreamItem(item.into()))
    }

    pub fn end(&self) -> Result<(), StrandError> {
        self.send(Reply::StreamEnd)
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("method", &self.inner.method)
            .field("channel", &self.inner.channel.id())
            .finish()
    }
}
