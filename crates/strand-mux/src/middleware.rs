//! Receive middleware, plus the stock timeout and heartbeat behaviors
//! attached to channels at call time.

use crate::channel::{Channel, ChannelState};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use strand_core::event::HEARTBEAT;
use strand_core::{Event, StrandError, Value};
use tokio::time::Instant;
use tracing::trace;

/// A receive handler in a channel's middleware chain
pub type Middleware = Arc<dyn Fn(&Channel, &Event, Next<'_>) + Send + Sync>;

/// The rest of a middleware chain
pub struct Next<'a> {
    channel: &'a Channel,
    chain: &'a [Middleware],
}

impl<'a> Next<'a> {
    pub(crate) fn new(channel: &'a Channel, chain: &'a [Middleware]) -> Self {
        Self { channel, chain }
    }

    /// Pass the event to the next handler
    pub fn run(self, event: &Event) {
        match self.chain.split_first() {
            Some((handler, rest)) => handler(
                self.channel,
                event,
                Next {
                    channel: self.channel,
                    chain: rest,
                },
            ),
            None => trace!(channel = %self.channel.id(), "Unhandled {}", event.name),
        }
    }
}

/// Fail a call that hears nothing back within `duration`
///
/// If the timer fires while the channel is still open, `callback` gets a
/// `TimeoutExpired` error and the channel is destroyed. The first inbound
/// event other than a heartbeat cancels the timer for good. Register this
/// before other middleware.
pub fn add_timeout<F>(duration: Duration, channel: &Channel, callback: F)
where
    F: FnOnce(StrandError) + Send + 'static,
{
    let weak = channel.downgrade();
    let task = tokio::spawn(async move {
        tokio::time::sleep(duration).await;

        let Some(channel) = weak.upgrade() else {
            return;
        };
        if channel.state() != ChannelState::Open {
            return;
        }

        callback(StrandError::TimeoutExpired(format!(
            "Timeout after {}ms",
            duration.as_millis()
        )));
        channel.destroy(None);
    });

    let timer = task.abort_handle();
    channel.on_closing({
        let timer = timer.clone();
        move || timer.abort()
    });
    channel.register(move |_, event, next| {
        if event.name != HEARTBEAT {
            timer.abort();
        }
        next.run(event);
    });
}

/// Exchange heartbeats on a channel at `interval`
///
/// Swallows inbound heartbeats. After two intervals without one,
/// `callback` gets a `LostRemote` error and the channel is destroyed.
pub fn add_heartbeat<F>(interval: Duration, channel: &Channel, callback: F)
where
    F: FnOnce(StrandError) + Send + 'static,
{
    let deadline = Arc::new(Mutex::new(Instant::now() + interval * 2));

    let weak = channel.downgrade();
    let task = tokio::spawn({
        let deadline = deadline.clone();
        async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;

                let Some(channel) = weak.upgrade() else {
                    return;
                };
                if channel.state() == ChannelState::Closed {
                    return;
                }

                let expired =
                    Instant::now() > *deadline.lock().unwrap_or_else(PoisonError::into_inner);
                if expired {
                    callback(StrandError::LostRemote(format!(
                        "Lost remote after {}ms heartbeat",
                        (interval * 2).as_millis()
                    )));
                    channel.destroy(None);
                    return;
                }

                let _ = channel.send_control(HEARTBEAT, vec![Value::from(0)]);
            }
        }
    });

    let timer = task.abort_handle();
    channel.on_closed(move |_| timer.abort());
    channel.register(move |_, event, next| {
        if event.name == HEARTBEAT {
            *deadline.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now() + interval * 2;
        } else {
            next.run(event);
        }
    });
}
