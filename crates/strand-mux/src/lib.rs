//! Channel multiplexing for Strand.
//!
//! A [`MultiplexingSocket`] carries many [`Channel`]s over one transport
//! socket. Each channel is an ordered conversation with windowed flow
//! control: a sender never has more events in flight than the receiver
//! last advertised with a `_zpc_more` control event. Liveness is tracked
//! with `_zpc_hb` heartbeats, either owned by the channel (see
//! [`SocketConfig::heartbeat`]) or attached per call with
//! [`add_heartbeat`].

pub mod channel;
pub mod config;
pub mod middleware;
pub mod socket;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{Channel, ChannelState, Origin, WeakChannel};
pub use config::{ReplenishPolicy, SocketConfig};
pub use middleware::{add_heartbeat, add_timeout, Middleware, Next};
pub use socket::{CallHandler, MultiplexingSocket};
